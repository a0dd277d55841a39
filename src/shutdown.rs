//! Lifecycle coordination for the proxy's HTTP listeners.
//!
//! Each listener (the proxy itself, the admin endpoint, the test backend) is
//! spawned through a `ShutdownManager` and is handed a `signal()` future to
//! pass to `with_graceful_shutdown`. The manager reports listeners that exit
//! on their own, broadcasts shutdown over a `watch` channel, and bounds how
//! long draining may take.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("A listener task panicked")]
    Panic(#[from] JoinError),
    #[error("Listener '{name}' failed: {error}")]
    Listener { name: &'static str, error: String },
    #[error("Graceful shutdown timed out after {0:?}")]
    Timeout(Duration),
}

type ListenerResult = (&'static str, Result<(), String>);

pub struct ShutdownManager {
    tasks: JoinSet<ListenerResult>,
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { tasks: JoinSet::new(), shutdown_tx }
    }

    /// Spawns a named listener. Its error, if any, is reported by
    /// `next_exit` or `graceful_shutdown`.
    pub fn spawn_listener<F, E>(&mut self, name: &'static str, listener: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        self.tasks.spawn(async move { (name, listener.await.map_err(|e| e.to_string())) });
    }

    /// A future that completes once shutdown has been triggered.
    pub fn signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            // A closed channel also means shutdown.
            let _ = rx.wait_for(|stop| *stop).await;
        }
    }

    pub fn trigger(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits until some listener exits without being asked to.
    ///
    /// Never completes while no listeners are running.
    pub async fn next_exit(&mut self) -> Result<&'static str, ShutdownError> {
        match self.tasks.join_next().await {
            Some(joined) => Self::check(joined),
            None => std::future::pending().await,
        }
    }

    /// Broadcasts shutdown and waits for every listener to drain, up to `timeout`.
    pub async fn graceful_shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let ShutdownManager { mut tasks, shutdown_tx } = self;

        info!(listeners = tasks.len(), "Broadcasting shutdown to listeners");
        shutdown_tx.send_replace(true);

        let drain = async {
            let mut first_error = None;
            while let Some(joined) = tasks.join_next().await {
                match Self::check(joined) {
                    Ok(name) => info!(listener = name, "Listener stopped"),
                    Err(e) => {
                        error!(error = %e, "Listener stopped with an error");
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?timeout, "Shutdown timed out, aborting remaining listeners");
                tasks.abort_all();
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }

    fn check(joined: Result<ListenerResult, JoinError>) -> Result<&'static str, ShutdownError> {
        match joined? {
            (name, Ok(())) => Ok(name),
            (name, Err(error)) => Err(ShutdownError::Listener { name, error }),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_listener_stops_on_signal() {
        let mut manager = ShutdownManager::new();
        let signal = manager.signal();
        manager.spawn_listener("proxy", async move {
            signal.await;
            Ok::<(), String>(())
        });
        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(res.is_ok(), "Expected graceful shutdown to succeed");
    }

    #[tokio::test]
    async fn test_signal_after_trigger() {
        let manager = ShutdownManager::new();
        manager.trigger();
        tokio::time::timeout(Duration::from_secs(1), manager.signal())
            .await
            .expect("signal should complete once triggered");
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut manager = ShutdownManager::new();
        manager.spawn_listener("stubborn", async {
            sleep(Duration::from_secs(10)).await;
            Ok::<(), String>(())
        });
        let res = manager.graceful_shutdown(Duration::from_millis(100)).await;
        assert!(matches!(res, Err(ShutdownError::Timeout(_))), "Expected a timeout error");
    }

    #[tokio::test]
    async fn test_panic_propagation() {
        let mut manager = ShutdownManager::new();
        manager.spawn_listener("broken", async {
            if true {
                panic!("Simulated panic");
            }
            Ok::<(), String>(())
        });
        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ShutdownError::Panic(_))), "Expected a panic error");
    }

    #[tokio::test]
    async fn test_listener_error_is_reported_by_name() {
        let mut manager = ShutdownManager::new();
        manager.spawn_listener("admin", async { Err::<(), _>("address in use") });

        match manager.next_exit().await {
            Err(ShutdownError::Listener { name, error }) => {
                assert_eq!(name, "admin");
                assert_eq!(error, "address in use");
            }
            other => panic!("expected listener error, got {:?}", other),
        }
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_next_exit_waits_for_running_listeners() {
        let mut manager = ShutdownManager::new();
        let signal = manager.signal();
        manager.spawn_listener("proxy", async move {
            signal.await;
            Ok::<(), String>(())
        });

        let waited = tokio::time::timeout(Duration::from_millis(100), manager.next_exit()).await;
        assert!(waited.is_err(), "listener should still be running");
        assert_eq!(manager.len(), 1);

        manager.trigger();
        assert_eq!(manager.next_exit().await.unwrap(), "proxy");
    }

    #[tokio::test]
    async fn test_shutdown_with_no_listeners() {
        let manager = ShutdownManager::new();
        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(res.is_ok(), "Shutdown should succeed immediately with no listeners");
    }

    #[tokio::test]
    async fn test_partial_failure_still_drains_others() {
        let mut manager = ShutdownManager::new();
        let signal = manager.signal();
        manager.spawn_listener("proxy", async move {
            signal.await;
            Ok::<(), String>(())
        });
        manager.spawn_listener("admin", async { Err::<(), _>("boom") });

        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ShutdownError::Listener { name: "admin", .. })));
    }
}
