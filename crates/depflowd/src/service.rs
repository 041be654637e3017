//! Wires the orchestrator together and runs it until shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use depflow_core::metrics::METRICS;
use depflow_core::orchestrator::{frequency_schedules, run_timer};
use depflow_core::{
    BuildIngestor, CronSchedule, Dispatcher, LogOnlyAction, LongestBuildPathReporter,
    OrchestratorConfig, SubscriptionSerializer, SubscriptionUpdater, UpdateScheduler,
    UpdateWorkHandler, WorkerPool,
};
use flow_state::{BuildTimeProvider, Catalog, WorkQueue};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};

pub struct Service {
    config: OrchestratorConfig,
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    scheduler: Arc<UpdateScheduler>,
    reporter: Arc<LongestBuildPathReporter>,
    pool: WorkerPool,
}

impl Service {
    pub fn new(
        config: OrchestratorConfig,
        catalog: Arc<dyn Catalog>,
        queue: Arc<dyn WorkQueue>,
        build_times: Arc<dyn BuildTimeProvider>,
    ) -> Self {
        let dispatcher = Dispatcher::new(queue);
        let scheduler = Arc::new(UpdateScheduler::new(
            Arc::clone(&catalog),
            dispatcher.clone(),
            config.max_parallelism,
        ));
        let updater = Arc::new(SubscriptionUpdater::new(
            Arc::clone(&catalog),
            Arc::new(LogOnlyAction),
        ));
        let handler = Arc::new(UpdateWorkHandler::new(
            Arc::clone(&scheduler),
            updater,
            Arc::new(SubscriptionSerializer::new()),
            config.cache_ttl(),
        ));
        let pool = WorkerPool::new(&dispatcher, handler, config.pool_config());
        let reporter = Arc::new(LongestBuildPathReporter::new(
            Arc::clone(&catalog),
            build_times,
            config.graph_days,
            config.max_parallelism,
        ));
        Self {
            config,
            catalog,
            dispatcher,
            scheduler,
            reporter,
            pool,
        }
    }

    /// Run until `stop` resolves or a component exits on its own.
    pub async fn run<F>(self, listener: TcpListener, stop: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Service {
            config,
            catalog,
            dispatcher,
            scheduler,
            reporter,
            pool,
        } = self;
        let shutdown = pool.shutdown_handle();

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(async move {
            pool.run().await;
            Ok(())
        });

        let schedules = frequency_schedules(
            &config.daily_cron,
            &config.twice_daily_cron,
            &config.weekly_cron,
            &config.time_zone,
        )
        .context("invalid frequency schedule")?;
        for (frequency, schedule) in schedules {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = Arc::clone(&shutdown);
            tasks.spawn(async move {
                run_timer(schedule, shutdown, move || {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        if let Err(e) = scheduler.check_frequency(frequency).await {
                            warn!(frequency = %frequency, error = %e, "frequency check failed");
                        }
                    }
                })
                .await;
                Ok(())
            });
        }

        let report = CronSchedule::parse("longest-build-path", &config.report_cron, &config.time_zone)
            .context("invalid report schedule")?;
        {
            let shutdown = Arc::clone(&shutdown);
            tasks.spawn(async move {
                run_timer(report, shutdown, move || {
                    let reporter = Arc::clone(&reporter);
                    async move {
                        match reporter.run(Utc::now()).await {
                            Ok(rows) => info!(channels = rows.len(), "longest build path report done"),
                            Err(e) => warn!(error = %e, "longest build path report failed"),
                        }
                        METRICS.flush();
                    }
                })
                .await;
                Ok(())
            });
        }

        let ingestor = Arc::new(BuildIngestor::new(Arc::clone(&catalog), dispatcher.clone()));
        let app = api::router(ApiState {
            catalog,
            dispatcher,
            ingestor,
        });
        let addr = listener.local_addr().context("listener has no address")?;
        {
            let shutdown = Arc::clone(&shutdown);
            tasks.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await
                    .context("http server failed")
            });
        }
        info!(%addr, "depflowd started");

        tokio::select! {
            _ = stop => info!("shutdown requested"),
            Some(joined) = tasks.join_next() => {
                warn!("a component stopped unexpectedly, shutting down");
                log_exit(joined);
            }
        }
        shutdown.set();

        while let Some(joined) = tasks.join_next().await {
            log_exit(joined);
        }
        METRICS.flush();
        info!("depflowd stopped");
        Ok(())
    }
}

fn log_exit(joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "component failed"),
        Err(e) => error!(error = %e, "component panicked"),
    }
}
