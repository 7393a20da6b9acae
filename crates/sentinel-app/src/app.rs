//! Application runtime.
//!
//! Starts the feeds, runs the maintenance schedule and the ops endpoint,
//! and shuts everything down on Ctrl-C:
//! - reconciliation against a REST account snapshot (account feed only)
//! - freshness sweep with REST fallback
//! - gap sweep with backfill
//! - periodic health summary log line

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::manager::WebSocketManager;
use crate::ops;
use sentinel_account::ReconcileStatus;
use sentinel_rest::{BinanceRestClient, ExchangeRest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Application {
    config: AppConfig,
    manager: Arc<WebSocketManager>,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let rest: Arc<dyn ExchangeRest> = Arc::new(BinanceRestClient::new(config.rest.clone())?);
        Self::with_rest(config, Some(rest))
    }

    /// Build with an explicit REST collaborator.
    pub fn with_rest(config: AppConfig, rest: Option<Arc<dyn ExchangeRest>>) -> AppResult<Self> {
        let manager = Arc::new(WebSocketManager::new(&config, rest)?);
        Ok(Self { config, manager })
    }

    pub fn manager(&self) -> &Arc<WebSocketManager> {
        &self.manager
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run until `shutdown` completes, then stop every task and feed.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            symbols = self.manager.symbols().len(),
            intervals = ?self.config.intervals,
            price_feed = self.config.price_feed,
            account_feed = self.config.account_feed,
            "Starting application"
        );
        self.manager.start().await?;

        let cancel = CancellationToken::new();
        let tasks = self.spawn_tasks(&cancel);

        shutdown.await;

        info!("Shutting down");
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.manager.stop().await;
        log_health(&self.manager);
        Ok(())
    }

    fn spawn_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let tasks = &self.config.tasks;
        let mut handles = Vec::new();

        if self.manager.has_account_feed() {
            let manager = self.manager.clone();
            handles.push(spawn_periodic(
                "reconcile",
                Duration::from_secs(tasks.reconcile_interval_secs),
                cancel.clone(),
                move || {
                    let manager = manager.clone();
                    async move { reconcile(&manager).await }
                },
            ));
        }

        let manager = self.manager.clone();
        handles.push(spawn_periodic(
            "freshness",
            Duration::from_secs(tasks.freshness_interval_secs),
            cancel.clone(),
            move || {
                let manager = manager.clone();
                async move {
                    let served = manager.run_freshness_sweep().await;
                    if served > 0 {
                        info!(served, "REST fallback served stale data");
                    }
                }
            },
        ));

        let manager = self.manager.clone();
        handles.push(spawn_periodic(
            "gaps",
            Duration::from_secs(tasks.gap_interval_secs),
            cancel.clone(),
            move || {
                let manager = manager.clone();
                async move {
                    let stored = manager.run_gap_sweep().await;
                    if stored > 0 {
                        info!(stored, "Gap backfill stored bars");
                    }
                }
            },
        ));

        let manager = self.manager.clone();
        handles.push(spawn_periodic(
            "health",
            Duration::from_secs(tasks.health_log_interval_secs),
            cancel.clone(),
            move || {
                let manager = manager.clone();
                async move { log_health(&manager) }
            },
        ));

        if self.config.ops.enabled {
            let manager = self.manager.clone();
            let port = self.config.ops.port;
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = ops::serve(manager, port, cancel).await {
                    error!(port, error = %e, "Ops endpoint failed");
                }
            }));
        }

        handles
    }
}

/// Run `task` every `period` until `cancel` fires. The first run happens
/// one period after start.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = task() => {}
                    }
                }
            }
        }
        debug!(task = name, "Periodic task stopped");
    })
}

async fn reconcile(manager: &WebSocketManager) {
    match manager.reconcile().await {
        Ok(result) if result.status == ReconcileStatus::Error => {
            error!(error = ?result.error, "Reconciliation rejected REST snapshot");
        }
        Ok(result) => debug!(
            status = result.status.as_str(),
            mismatches = result.mismatch_count(),
            "Reconciliation finished"
        ),
        Err(e) => warn!(error = %e, "Reconciliation skipped"),
    }
}

fn log_health(manager: &WebSocketManager) {
    let summary = manager.get_health_summary();
    info!(
        streams = summary.streams,
        healthy = summary.healthy,
        degraded = summary.degraded,
        unavailable = summary.unavailable,
        acceptance_rate = summary.quality.acceptance_rate,
        fallbacks = summary.fallback.total,
        fallback_success_rate = summary.fallback.success_rate,
        gap_repairs = summary.gap_repairs,
        uptime_secs = summary.uptime_secs,
        "Health summary"
    );
}
