use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{error, info, warn};

/// 关机信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
    /// 程序内部触发的关机
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
            ShutdownSignal::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// 关机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown(ShutdownSignal),
}

/// 关机协调器：信号监听与取消广播
#[derive(Clone)]
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    state: Arc<RwLock<ShutdownState>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            state: Arc::new(RwLock::new(ShutdownState::Running)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub async fn get_state(&self) -> ShutdownState {
        *self.state.read().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        !matches!(*self.state.read().await, ShutdownState::Running)
    }

    /// 注册 SIGINT / SIGTERM / SIGQUIT 监听
    pub fn start_signal_handling(&self) -> Result<()> {
        let on_ctrl_c = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                return;
            }
            on_ctrl_c.trigger_shutdown(ShutdownSignal::Interrupt).await;
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            for (kind, which) in [
                (SignalKind::terminate(), ShutdownSignal::Terminate),
                (SignalKind::quit(), ShutdownSignal::Quit),
            ] {
                let mut stream = signal(kind)?;
                let handle = self.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        handle.trigger_shutdown(which).await;
                    }
                });
            }
        }

        info!("Signal handlers registered successfully");
        Ok(())
    }

    /// 触发关机，只有第一次生效
    pub async fn trigger_shutdown(&self, signal: ShutdownSignal) {
        let mut state = self.state.write().await;
        match *state {
            ShutdownState::Running => {
                info!("Initiating graceful shutdown due to signal: {}", signal);
                *state = ShutdownState::ShuttingDown(signal);
                if self.shutdown_tx.send(signal).is_err() {
                    warn!("No shutdown subscribers registered");
                }
            }
            ShutdownState::ShuttingDown(_) => {
                warn!("Shutdown already in progress, ignoring signal: {}", signal);
            }
        }
    }

    /// 等待关机信号；已经在关机时立即返回
    pub async fn wait_for_shutdown(&self) -> ShutdownSignal {
        let mut receiver = self.subscribe();
        if let ShutdownState::ShuttingDown(signal) = self.get_state().await {
            return signal;
        }

        match receiver.recv().await {
            Ok(signal) => signal,
            Err(e) => {
                error!("Error receiving shutdown signal: {}", e);
                ShutdownSignal::Internal
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = GracefulShutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.trigger_shutdown(ShutdownSignal::Terminate).await;
        shutdown.trigger_shutdown(ShutdownSignal::Interrupt).await;

        assert_eq!(waiter.await.unwrap(), ShutdownSignal::Terminate);
        assert_eq!(
            shutdown.get_state().await,
            ShutdownState::ShuttingDown(ShutdownSignal::Terminate)
        );
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownSignal::Internal).await;

        let signal = tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Internal);
        assert!(shutdown.is_shutting_down().await);
    }
}
