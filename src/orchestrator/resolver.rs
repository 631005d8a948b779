//! Dependency resolution
//!
//! Depth-first topological sort over `depends_on` edges. Roots are visited in
//! declaration order and dependencies in the order they are listed, so the
//! result is deterministic and independent services keep their declaration
//! order.

use crate::error::ConfigError;
use crate::service::ServiceSpec;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Orders services so that every dependency precedes its dependents
pub struct DependencyResolver<'a> {
    specs: HashMap<&'a str, &'a ServiceSpec>,
    marks: HashMap<&'a str, Mark>,
    stack: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> DependencyResolver<'a> {
    /// Resolve the launch order of `specs`, given in declaration order
    pub fn resolve<I>(specs: I) -> Result<Vec<String>, ConfigError>
    where
        I: IntoIterator<Item = &'a ServiceSpec>,
    {
        let declared: Vec<&ServiceSpec> = specs.into_iter().collect();

        let mut resolver = DependencyResolver {
            specs: declared.iter().copied().map(|s| (s.name.as_str(), s)).collect(),
            marks: HashMap::with_capacity(declared.len()),
            stack: Vec::new(),
            order: Vec::with_capacity(declared.len()),
        };

        for spec in declared {
            resolver.visit(spec)?;
        }

        Ok(resolver.order)
    }

    fn visit(&mut self, spec: &'a ServiceSpec) -> Result<(), ConfigError> {
        let name = spec.name.as_str();
        match self.marks.get(name) {
            Some(Mark::Visited) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|s| *s == name).unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(name.to_string());
                return Err(ConfigError::CyclicDependency { path });
            }
            None => {}
        }

        self.marks.insert(name, Mark::Visiting);
        self.stack.push(name);

        for dependency in &spec.depends_on {
            let dep = self.specs.get(dependency.as_str()).copied().ok_or_else(|| {
                ConfigError::DanglingDependency {
                    service: spec.name.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            self.visit(dep)?;
        }

        self.stack.pop();
        self.marks.insert(name, Mark::Visited);
        self.order.push(name.to_string());

        Ok(())
    }
}
