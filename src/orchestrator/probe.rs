//! Readiness probing
//!
//! A probe connects to a TCP endpoint at a fixed interval until it succeeds,
//! the timeout elapses, or the probe is cancelled. Attempt `k` happens at
//! `k * interval`; the final attempt happens exactly at the timeout.

use crate::error::{BerthError, Result};
use crate::service::Endpoint;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Opens a connection to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt a single connection
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<()>;
}

/// Plain TCP connect
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<()> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        drop(stream);
        Ok(())
    }
}

/// Successful probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Number of connection attempts made, including the successful one
    pub attempts: u32,
    /// Time from the first attempt to success
    pub elapsed: Duration,
}

/// Refused and reset connections mean "not listening yet"
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Polls endpoints until they accept connections
#[derive(Clone)]
pub struct ReadinessProber {
    connector: Arc<dyn Connector>,
}

impl ReadinessProber {
    /// Create a prober with a custom connector
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Create a prober that uses TCP connections
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpConnector))
    }

    /// Probe `endpoint` until it is ready.
    ///
    /// # Errors
    ///
    /// - [`BerthError::ReadinessTimeout`] when `timeout` elapses first
    /// - [`BerthError::Cancelled`] when `cancel` fires while waiting
    /// - [`BerthError::Probe`] for a malformed endpoint or a non-transient
    ///   connection error; these are not retried
    pub async fn probe(
        &self,
        endpoint: &str,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport> {
        let parsed: Endpoint = endpoint.parse().map_err(|reason: String| BerthError::Probe {
            endpoint: endpoint.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, reason),
        })?;

        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BerthError::Cancelled),
                result = tokio::time::timeout(remaining, self.connector.connect(&parsed)) => result,
            };

            match attempt {
                Ok(Ok(())) => {
                    let elapsed = start.elapsed();
                    tracing::debug!(
                        "{} ready after {} attempt(s) in {:?}",
                        endpoint,
                        attempts,
                        elapsed
                    );
                    return Ok(ProbeReport { attempts, elapsed });
                }
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::debug!("{} not ready (attempt {}): {}", endpoint, attempts, e);
                }
                Ok(Err(e)) => {
                    return Err(BerthError::Probe {
                        endpoint: endpoint.to_string(),
                        source: e,
                    });
                }
                Err(_) => {
                    tracing::debug!("{} attempt {} ran into the deadline", endpoint, attempts);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BerthError::ReadinessTimeout {
                    endpoint: endpoint.to_string(),
                    elapsed: now.duration_since(start),
                });
            }

            let wait = interval.min(deadline.duration_since(now));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BerthError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;

    fn prober(connector: &Arc<ScriptedConnector>) -> ReadinessProber {
        ReadinessProber::new(connector.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_at_tick_n() {
        let connector = Arc::new(ScriptedConnector::refuse_first(3));
        let cancel = CancellationToken::new();

        let report = prober(&connector)
            .probe(
                "db:5432",
                Duration::from_secs(10),
                Duration::from_secs(1),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(report.attempts, 4);
        assert_eq!(report.elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately() {
        let connector = Arc::new(ScriptedConnector::refuse_first(0));
        let cancel = CancellationToken::new();

        let report = prober(&connector)
            .probe("db:5432", Duration::from_secs(5), Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_exactly_the_timeout() {
        let connector = Arc::new(ScriptedConnector::never_ready());
        let cancel = CancellationToken::new();

        let err = prober(&connector)
            .probe(
                "db:5432",
                Duration::from_secs(10),
                Duration::from_secs(3),
                &cancel,
            )
            .await
            .unwrap_err();

        match err {
            BerthError::ReadinessTimeout { endpoint, elapsed } => {
                assert_eq!(endpoint, "db:5432");
                assert_eq!(elapsed, Duration::from_secs(10));
            }
            other => panic!("unexpected error: {}", other),
        }
        // 0s, 3s, 6s, 9s and the final attempt at 10s
        assert_eq!(connector.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_reset_is_retried() {
        let connector = Arc::new(ScriptedConnector::with_errors(vec![
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
        ]));
        let cancel = CancellationToken::new();

        let report = prober(&connector)
            .probe("db:5432", Duration::from_secs(10), Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let connector = Arc::new(ScriptedConnector::with_errors(vec![
            io::ErrorKind::PermissionDenied,
        ]));
        let cancel = CancellationToken::new();

        let err = prober(&connector)
            .probe("db:5432", Duration::from_secs(10), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BerthError::Probe { .. }));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_endpoint_fails_without_connecting() {
        let connector = Arc::new(ScriptedConnector::never_ready());
        let cancel = CancellationToken::new();

        let err = prober(&connector)
            .probe("no-port", Duration::from_secs(10), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BerthError::Probe { .. }));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait() {
        let connector = Arc::new(ScriptedConnector::never_ready());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = prober(&connector)
            .probe("db:5432", Duration::from_secs(60), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_tcp_connector_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let report = ReadinessProber::tcp()
            .probe(
                &addr.to_string(),
                Duration::from_secs(5),
                Duration::from_millis(50),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
    }
}
