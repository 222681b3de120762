pub mod heartbeat;
pub mod sync;
pub mod traffic;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub use heartbeat::HeartbeatJob;
pub use sync::SyncJob;
pub use traffic::TrafficJob;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TRAFFIC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_RULE_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// 调度器错误
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler '{0}' is already running")]
    AlreadyRunning(&'static str),
}

/// 周期任务
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self);

    /// 同一循环内的第二个定时器
    fn secondary_interval(&self) -> Option<Duration> {
        None
    }

    async fn run_secondary(&self) {}
}

/// 非正数秒回退到默认值
pub fn interval_or_default(secs: i64, default: Duration) -> Duration {
    if secs > 0 {
        Duration::from_secs(secs as u64)
    } else {
        default
    }
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// 周期调度器 - 每个任务一个后台循环
pub struct Scheduler {
    name: &'static str,
    period: Duration,
    job: Arc<dyn Job>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(name: &'static str, period: Duration, job: Arc<dyn Job>) -> Self {
        Self {
            name,
            period,
            job,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// 启动后台循环，首次立即执行
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning(self.name));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.name, self.period, self.job.clone(), stop_rx));
        *running = Some(Running { stop_tx, handle });

        info!("Scheduler '{}' started with interval {:?}", self.name, self.period);
        Ok(())
    }

    /// 停止并等待循环退出，可重复调用
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!("Scheduler '{}' task ended abnormally: {}", self.name, e);
        }
        info!("Scheduler '{}' stopped", self.name);
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_loop(
    name: &'static str,
    period: Duration,
    job: Arc<dyn Job>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut primary = ticker(period);
    let mut secondary = job.secondary_interval().map(ticker);

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,
            _ = async {
                match secondary.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                debug!("Scheduler '{}' secondary tick", name);
                job.run_secondary().await;
            }
            _ = primary.tick() => {
                debug!("Scheduler '{}' tick", name);
                job.run().await;
            }
        }

        if *stop_rx.borrow() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        primary: AtomicUsize,
        secondary: AtomicUsize,
        with_secondary: bool,
        order: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) {
            self.primary.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push("primary");
        }

        fn secondary_interval(&self) -> Option<Duration> {
            self.with_secondary.then(|| Duration::from_millis(20))
        }

        async fn run_secondary(&self) {
            self.secondary.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push("secondary");
        }
    }

    #[test]
    fn test_interval_or_default() {
        assert_eq!(interval_or_default(5, DEFAULT_SYNC_INTERVAL), Duration::from_secs(5));
        assert_eq!(interval_or_default(0, DEFAULT_SYNC_INTERVAL), DEFAULT_SYNC_INTERVAL);
        assert_eq!(interval_or_default(-3, DEFAULT_TRAFFIC_INTERVAL), DEFAULT_TRAFFIC_INTERVAL);
    }

    #[tokio::test]
    async fn test_runs_immediately_and_rejects_double_start() {
        let job = Arc::new(CountingJob::default());
        let scheduler = Scheduler::new("test", Duration::from_secs(3600), job.clone());

        scheduler.start().await.unwrap();
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning("test"))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.primary.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_no_ticks_after_stop() {
        let job = Arc::new(CountingJob::default());
        let period = Duration::from_millis(20);
        let scheduler = Scheduler::new("test", period, job.clone());

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        scheduler.stop().await;

        let after_stop = job.primary.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        tokio::time::sleep(period * 3).await;
        assert_eq!(job.primary.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_secondary_runs_before_primary() {
        let job = Arc::new(CountingJob {
            with_secondary: true,
            ..Default::default()
        });
        let scheduler = Scheduler::new("traffic", Duration::from_secs(3600), job.clone());

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        scheduler.stop().await;

        let order = job.order.lock().unwrap().clone();
        assert_eq!(order[0], "secondary");
        assert_eq!(order[1], "primary");
        assert!(job.secondary.load(Ordering::SeqCst) >= 2);
        assert_eq!(job.primary.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let job = Arc::new(CountingJob::default());
        let scheduler = Scheduler::new("test", Duration::from_secs(3600), job.clone());

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;
        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;

        assert_eq!(job.primary.load(Ordering::SeqCst), 2);
    }
}
