//! End-to-end workflow tests through the engine.

use chrono::{DateTime, Utc};
use orderflow_config::builders::ConfigBuilder;
use orderflow_core::{
	ActionPayload, Clock, TokioClock, WorkflowBuilder, WorkflowEngine, WorkflowError,
};
use orderflow_storage::implementations::file::FileStorage;
use orderflow_storage::implementations::memory::MemoryStorage;
use orderflow_types::{Action, Actor, NewOrder, Order, OrderStatus, Role, Stage};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A clock the test moves by hand.
#[derive(Debug)]
struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
	fn new(now: DateTime<Utc>) -> Self {
		Self(Mutex::new(now))
	}

	fn advance(&self, by: chrono::Duration) {
		let mut now = self.0.lock().unwrap();
		*now += by;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.0.lock().unwrap()
	}
}

fn memory_engine() -> WorkflowEngine {
	WorkflowBuilder::new(ConfigBuilder::new().build())
		.build_with_backend(Box::new(MemoryStorage::new()))
}

fn office() -> Actor {
	Actor::user("office-1", [Role::OfficeEmployee])
}

fn admin() -> Actor {
	Actor::user("admin-1", [Role::Administrator])
}

fn qc() -> Actor {
	Actor::user("qc-1", [Role::QualityControl])
}

fn worker(stage: Stage) -> Actor {
	Actor::user(format!("{}-1", stage), [stage.role()])
}

fn new_order() -> NewOrder {
	NewOrder {
		product_type: "photo book".into(),
		client_name: "Marko Kovač".into(),
		client_phone: Some("+385 1 234 5678".into()),
		..NewOrder::default()
	}
}

/// Takes one step along a path that visits every non-terminal status,
/// sending each stage through QC rejection and rework once.
async fn step(engine: &WorkflowEngine, order: &Order, reworked: &mut HashSet<Stage>) -> Order {
	let orchestrator = engine.orchestrator();
	let id = order.id.as_str();
	let none = ActionPayload::default;
	let result = match (order.status, order.status.stage()) {
		(OrderStatus::Created, _) => orchestrator.submit(id, &office(), none()).await,
		(status, Some(stage)) if status.is_pool() => {
			orchestrator.claim(id, &worker(stage), none()).await
		},
		(status, Some(stage)) if status.is_processing() || status.is_rework() => {
			orchestrator.complete(id, &worker(stage), none()).await
		},
		(status, Some(stage)) if status.is_qc_review() => {
			if reworked.insert(stage) {
				orchestrator.reject(id, &qc(), none()).await
			} else {
				orchestrator.approve(id, &qc(), none()).await
			}
		},
		(status, _) => panic!("no step from {}", status),
	};
	result.unwrap()
}

#[tokio::test]
async fn test_order_travels_through_every_stage() {
	let engine = memory_engine();
	let mut order = engine
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();

	let mut reworked = HashSet::new();
	let mut visited = vec![order.status];
	while order.status != OrderStatus::PrinterProcessing {
		order = step(&engine, &order, &mut reworked).await;
		visited.push(order.status);
	}

	let order = engine
		.orchestrator()
		.complete(
			&order.id,
			&worker(Stage::Printer),
			ActionPayload {
				notes: Some("shipped".into()),
				tracking_number: Some("RR123456785HR".into()),
			},
		)
		.await
		.unwrap();
	visited.push(order.status);

	assert_eq!(order.status, OrderStatus::Completed);
	assert_eq!(order.tracking_number.as_deref(), Some("RR123456785HR"));
	assert_eq!(order.current_holder, None);
	assert_eq!(order.previous_holder.as_deref(), Some("printer-1"));

	// Every status but cancelled is visited.
	let distinct: HashSet<_> = visited.iter().copied().collect();
	assert_eq!(distinct.len(), 16);

	let history = engine.orchestrator().history(&order.id).await.unwrap();
	assert_eq!(history.len(), visited.len());
	for (entry, pair) in history.iter().skip(1).zip(visited.windows(2)) {
		assert_eq!((entry.from_status, entry.to_status), (pair[0], pair[1]));
	}

	let stats = engine.orchestrator().statistics(&order.id).await.unwrap();
	assert_eq!(stats.len(), 4);
	assert!(stats.iter().all(|stat| !stat.is_open()));
	assert_eq!(engine.scheduler().armed_count(), 0);
}

#[tokio::test]
async fn test_cancel_from_every_non_terminal_status() {
	let engine = memory_engine();
	let targets: Vec<OrderStatus> = OrderStatus::all().filter(|s| !s.is_terminal()).collect();

	for target in targets {
		let mut order = engine
			.orchestrator()
			.create_order(&office(), new_order())
			.await
			.unwrap();
		let mut reworked = HashSet::new();
		while order.status != target {
			order = step(&engine, &order, &mut reworked).await;
		}

		let cancelled = engine
			.orchestrator()
			.cancel(&order.id, &admin(), ActionPayload::with_notes("client withdrew"))
			.await
			.unwrap();
		assert_eq!(cancelled.status, OrderStatus::Cancelled, "from {}", target);
		assert_eq!(cancelled.current_holder, None);
		assert!(!engine.scheduler().is_armed(&order.id));

		let err = engine
			.orchestrator()
			.cancel(&order.id, &admin(), ActionPayload::default())
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			WorkflowError::InvalidTransition {
				status: OrderStatus::Cancelled,
				action: Action::Cancel
			}
		));
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claims_through_orchestrator() {
	let engine = memory_engine();
	let order = engine
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();
	engine
		.orchestrator()
		.submit(&order.id, &office(), ActionPayload::default())
		.await
		.unwrap();

	let attempts = (0..16).map(|i| {
		let engine = engine.clone();
		let id = order.id.clone();
		tokio::spawn(async move {
			let editor = Actor::user(format!("editor-{}", i), [Role::Editor]);
			engine
				.orchestrator()
				.claim(&id, &editor, ActionPayload::default())
				.await
		})
	});
	let results: Vec<_> = futures::future::join_all(attempts)
		.await
		.into_iter()
		.map(|joined| joined.unwrap())
		.collect();

	assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
	assert!(results
		.iter()
		.filter(|r| r.is_err())
		.all(|r| matches!(r, Err(WorkflowError::AlreadyClaimed(_)))));

	let history = engine.orchestrator().history(&order.id).await.unwrap();
	let claims = history.iter().filter(|e| e.action == Action::Claim).count();
	assert_eq!(claims, 1);
	assert_eq!(engine.scheduler().armed_count(), 1);
	engine.scheduler().shutdown();
}

#[tokio::test]
async fn test_restart_recovers_overdue_claim_from_disk() {
	let dir = tempfile::tempdir().unwrap();
	let clock = Arc::new(ManualClock::new(Utc::now()));
	let build = |clock: Arc<ManualClock>| {
		WorkflowBuilder::new(ConfigBuilder::new().build())
			.with_clock(clock)
			.build_with_backend(Box::new(FileStorage::new(dir.path().to_path_buf())))
	};

	let first = build(clock.clone());
	let order = first
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();
	first
		.orchestrator()
		.submit(&order.id, &office(), ActionPayload::default())
		.await
		.unwrap();
	let claimed = first
		.orchestrator()
		.claim(&order.id, &worker(Stage::Editor), ActionPayload::default())
		.await
		.unwrap();
	assert_eq!(claimed.status, OrderStatus::EditorProcessing);

	// The process dies; its in-memory timers go with it.
	first.scheduler().shutdown();
	drop(first);

	clock.advance(chrono::Duration::hours(2) + chrono::Duration::minutes(1));
	let second = build(clock.clone());
	let report = second.scheduler().restore_all().await.unwrap();
	assert_eq!(report.fired, 1);

	let order = second.orchestrator().get(&order.id).await.unwrap();
	assert_eq!(order.status, OrderStatus::EditorPool);
	assert_eq!(order.current_holder, None);
	assert_eq!(order.timeout_at, None);

	let history = second.orchestrator().history(&order.id).await.unwrap();
	let last = history.last().unwrap();
	assert_eq!(last.action, Action::Timeout);
	assert_eq!(last.actor_id, None);

	// The editor's claim slot was released, so another order can be claimed.
	let next = second
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();
	second
		.orchestrator()
		.submit(&next.id, &office(), ActionPayload::default())
		.await
		.unwrap();
	second
		.orchestrator()
		.claim(&next.id, &worker(Stage::Editor), ActionPayload::default())
		.await
		.unwrap();
	second.scheduler().shutdown();
}

#[tokio::test]
async fn test_restart_rearms_pending_claim() {
	let dir = tempfile::tempdir().unwrap();
	let clock = Arc::new(ManualClock::new(Utc::now()));
	let build = |clock: Arc<ManualClock>| {
		WorkflowBuilder::new(ConfigBuilder::new().build())
			.with_clock(clock)
			.build_with_backend(Box::new(FileStorage::new(dir.path().to_path_buf())))
	};

	let first = build(clock.clone());
	let order = first
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();
	first
		.orchestrator()
		.submit(&order.id, &office(), ActionPayload::default())
		.await
		.unwrap();
	let claimed = first
		.orchestrator()
		.claim(&order.id, &worker(Stage::Editor), ActionPayload::default())
		.await
		.unwrap();
	first.scheduler().shutdown();
	drop(first);

	clock.advance(chrono::Duration::minutes(30));
	let second = build(clock.clone());
	let report = second.scheduler().restore_all().await.unwrap();
	assert_eq!((report.fired, report.armed), (0, 1));
	assert_eq!(second.scheduler().deadline(&order.id), claimed.timeout_at);
	assert_eq!(
		second.orchestrator().get(&order.id).await.unwrap().status,
		OrderStatus::EditorProcessing
	);
	second.scheduler().shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_engine_expires_claims_while_running() {
	let engine = WorkflowBuilder::new(ConfigBuilder::new().sweep_interval_seconds(60).build())
		.with_clock(Arc::new(TokioClock::new()))
		.build_with_backend(Box::new(MemoryStorage::new()));

	let order = engine
		.orchestrator()
		.create_order(&office(), new_order())
		.await
		.unwrap();
	engine
		.orchestrator()
		.submit(&order.id, &office(), ActionPayload::default())
		.await
		.unwrap();
	engine
		.orchestrator()
		.claim(&order.id, &worker(Stage::Editor), ActionPayload::default())
		.await
		.unwrap();

	let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
	let running = {
		let engine = engine.clone();
		tokio::spawn(async move {
			engine
				.run_until(async {
					let _ = stopped.await;
				})
				.await
		})
	};

	tokio::time::sleep(Duration::from_secs(2 * 3600 + 61)).await;

	let order = engine.orchestrator().get(&order.id).await.unwrap();
	assert_eq!(order.status, OrderStatus::EditorPool);
	let timeouts = engine
		.orchestrator()
		.history(&order.id)
		.await
		.unwrap()
		.into_iter()
		.filter(|entry| entry.action == Action::Timeout)
		.count();
	assert_eq!(timeouts, 1);

	stop.send(()).unwrap();
	running.await.unwrap().unwrap();
	assert_eq!(engine.scheduler().armed_count(), 0);
}
