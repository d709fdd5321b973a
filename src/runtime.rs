//! Foreground daemon: run every engine until a shutdown signal arrives.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::engine::{DnsEngine, Engine, ProxyEngine};

/// Starts engines, waits for shutdown, and cancels them with a bounded wait.
pub struct RuntimeCoordinator {
    cancel: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
    shutdown_timeout: Duration,
}

impl RuntimeCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            shutdown_timeout,
        }
    }

    /// DNS always runs; HTTPS only once TLS material is provisioned.
    pub fn from_config(cfg: &DaemonConfig) -> Result<Self> {
        let mut coordinator = Self::new(cfg.shutdown_timeout());
        coordinator.spawn(DnsEngine::from_config(cfg));
        match ProxyEngine::from_config(cfg)? {
            Some(proxy) => coordinator.spawn(proxy),
            None => log::warn!("HTTPS roots endpoint disabled"),
        }
        Ok(coordinator)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start an engine in its own task. Startup is fire-and-forget; failures
    /// surface as an early exit logged by [`run_until`](Self::run_until).
    pub fn spawn<E: Engine>(&mut self, engine: E) {
        let name = engine.name();
        let token = self.cancel.child_token();
        log::info!("Starting {name} engine");
        self.tasks.spawn(async move { (name, engine.serve(token).await) });
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves. Engines that exit early are logged;
    /// once none are left the daemon fails so the service manager restarts it.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.tasks.is_empty() {
            bail!("no engines to run");
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => log::warn!("{name} engine exited"),
                    Some(Ok((name, Err(e)))) => log::error!("{name} engine failed: {e:#}"),
                    Some(Err(e)) => log::error!("Engine task panicked: {e}"),
                    None => bail!("all engines have exited"),
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => log::info!("{name} engine shut down"),
                    Ok((name, Err(e))) => log::error!("{name} engine shutdown error: {e:#}"),
                    Err(e) => log::error!("Engine task panicked during shutdown: {e}"),
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            log::warn!(
                "Engines did not stop within {:?}, aborting {} task(s)",
                self.shutdown_timeout,
                self.tasks.len()
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => log::info!("Received SIGINT"),
                    _ = terminate.recv() => log::info!("Received SIGTERM"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Failed to register signal handlers, falling back to Ctrl-C: {e}");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Cooperative(Arc<AtomicBool>);

    impl Engine for Cooperative {
        fn name(&self) -> &'static str {
            "cooperative"
        }

        async fn serve(self, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Stubborn;

    impl Engine for Stubborn {
        fn name(&self) -> &'static str {
            "stubborn"
        }

        async fn serve(self, _cancel: CancellationToken) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Failing;

    impl Engine for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn serve(self, _cancel: CancellationToken) -> Result<()> {
            bail!("address in use")
        }
    }

    #[tokio::test]
    async fn cancels_engines_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut coordinator = RuntimeCoordinator::new(Duration::from_secs(5));
        coordinator.spawn(Cooperative(stopped.clone()));

        coordinator.run_until(async {}).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_wait_is_bounded() {
        let mut coordinator = RuntimeCoordinator::new(Duration::from_millis(100));
        coordinator.spawn(Stubborn);

        let finished = tokio::time::timeout(Duration::from_secs(5), coordinator.run_until(async {})).await;
        assert!(finished.is_ok(), "shutdown was not bounded");
    }

    #[tokio::test]
    async fn early_exit_keeps_others_running() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut coordinator = RuntimeCoordinator::new(Duration::from_secs(5));
        coordinator.spawn(Failing);
        coordinator.spawn(Cooperative(stopped.clone()));

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        coordinator.run_until(shutdown).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fails_once_every_engine_is_gone() {
        let mut coordinator = RuntimeCoordinator::new(Duration::from_secs(5));
        coordinator.spawn(Failing);

        let err = coordinator
            .run_until(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all engines"), "{err}");
    }

    #[tokio::test]
    async fn refuses_to_run_without_engines() {
        let coordinator = RuntimeCoordinator::new(Duration::from_secs(1));
        assert!(coordinator.run_until(async {}).await.is_err());
    }
}
