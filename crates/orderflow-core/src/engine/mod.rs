//! Workflow engine.
//!
//! Owns the wired services and runs the background side of the workflow:
//! restoring claim timers at startup and sweeping for overdue claims at a
//! fixed interval until shutdown.

use crate::claims::ClaimCoordinator;
use crate::orchestrator::WorkflowOrchestrator;
use crate::scheduler::{SweepReport, TimeoutScheduler};
use crate::state::OrderStore;
use orderflow_config::Config;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while the engine is running.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Service error: {0}")]
	Service(String),
}

/// The assembled workflow services.
#[derive(Clone)]
pub struct WorkflowEngine {
	config: Config,
	store: Arc<OrderStore>,
	claims: Arc<ClaimCoordinator>,
	scheduler: Arc<TimeoutScheduler>,
	orchestrator: Arc<WorkflowOrchestrator>,
}

impl WorkflowEngine {
	/// Wires the services around an order store.
	pub fn new(config: Config, store: Arc<OrderStore>) -> Self {
		let claim_timeout = chrono::Duration::seconds(
			i64::try_from(config.workflow.claim_timeout_seconds).unwrap_or(i64::MAX),
		);
		let claims = Arc::new(ClaimCoordinator::new(store.clone(), claim_timeout));
		let scheduler = Arc::new(TimeoutScheduler::new(
			store.clone(),
			claims.clone(),
			config.workflow.retry.clone(),
		));
		let orchestrator = Arc::new(WorkflowOrchestrator::new(
			store.clone(),
			claims.clone(),
			scheduler.clone(),
			config.workflow.order_number_prefix.clone(),
		));

		Self {
			config,
			store,
			claims,
			scheduler,
			orchestrator,
		}
	}

	/// Runs until Ctrl-C.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.run_until(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!(error = %e, "Failed to listen for shutdown signal");
			}
		})
		.await
	}

	/// Restores claim timers, then sweeps every `sweep_interval_seconds`
	/// until `shutdown` completes.
	pub async fn run_until<F>(&self, shutdown: F) -> Result<(), EngineError>
	where
		F: Future<Output = ()>,
	{
		self.scheduler
			.restore_all()
			.await
			.map_err(|e| EngineError::Service(format!("Failed to restore timeouts: {}", e)))?;

		let period = self.config.workflow.sweep_interval();
		let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		tracing::info!(
			service = %self.config.service.id,
			sweep_interval = ?period,
			"Workflow engine started"
		);

		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				_ = interval.tick() => {
					match self.scheduler.sweep().await {
						Ok(report) => log_sweep(&report),
						Err(e) => tracing::warn!(error = %e, "Timeout sweep failed"),
					}
				}
				_ = &mut shutdown => {
					break;
				}
			}
		}

		self.scheduler.shutdown();
		tracing::info!("Workflow engine stopped");
		Ok(())
	}

	pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
		&self.orchestrator
	}

	pub fn store(&self) -> &Arc<OrderStore> {
		&self.store
	}

	pub fn claims(&self) -> &Arc<ClaimCoordinator> {
		&self.claims
	}

	pub fn scheduler(&self) -> &Arc<TimeoutScheduler> {
		&self.scheduler
	}

	pub fn config(&self) -> &Config {
		&self.config
	}
}

fn log_sweep(report: &SweepReport) {
	if report.fired > 0 || report.failed > 0 || report.armed > 0 {
		tracing::info!(
			scanned = report.scanned,
			fired = report.fired,
			stale = report.stale,
			failed = report.failed,
			armed = report.armed,
			"Timeout sweep"
		);
	} else {
		tracing::debug!(scanned = report.scanned, "Timeout sweep");
	}
}
