use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kyroguard::{
    AuditStore, BusReceiver, CancellationToken, CorrelationId, EntityKey, EntitySink,
    EntityValidationConfig, FaultKind, FirstValuePolicy, GuardConfig, InMemoryAuditStore,
    InMemoryEntitySink, InProcessBus, MessagePublisher, OperationKind, PipelineContext,
    PipelineHost, PipelineMessage, ThresholdKind,
};
use kyroguard::messages::{DeleteRequested, SaveBatchRequested, SaveRequested};

struct Running {
    bus: Arc<InProcessBus>,
    observer: BusReceiver,
    store: Arc<InMemoryAuditStore>,
    sink: Arc<InMemoryEntitySink>,
    token: CancellationToken,
    host: tokio::task::JoinHandle<()>,
}

fn config() -> GuardConfig {
    GuardConfig {
        app_name: "inventory".to_string(),
        ..GuardConfig::default()
    }
    .with_entity(
        "server",
        EntityValidationConfig {
            metric_property: "cpu".to_string(),
            threshold_kind: ThresholdKind::RawDifference,
            threshold_value: 5.0,
            first_value_policy: FirstValuePolicy::Bypass,
            retry_delay_ms: 5,
            max_retry_attempts: 2,
            circuit_breaker_threshold: 1,
            ..EntityValidationConfig::default()
        },
    )
}

fn start() -> Running {
    let store = Arc::new(InMemoryAuditStore::new());
    let sink = Arc::new(InMemoryEntitySink::new());
    let ctx = PipelineContext::from_config(
        config(),
        Arc::clone(&store) as Arc<dyn AuditStore>,
        Arc::clone(&sink) as Arc<dyn EntitySink>,
    )
    .unwrap();

    let bus = Arc::new(InProcessBus::new(256));
    let host_rx = bus.subscribe();
    let observer = bus.subscribe();
    let host = Arc::new(PipelineHost::new(ctx, Arc::clone(&bus) as Arc<dyn MessagePublisher>));

    let token = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&host).run(host_rx, token.clone()));

    Running {
        bus,
        observer,
        store,
        sink,
        token,
        host: handle,
    }
}

/// Next message for `correlation_id` whose state is terminal.
async fn outcome(rx: &mut BusReceiver, correlation_id: CorrelationId) -> PipelineMessage {
    loop {
        let msg = rx.recv_timeout(Duration::from_secs(5)).await.unwrap();
        if msg.correlation_id() == correlation_id && msg.state().is_terminal() {
            return msg;
        }
    }
}

async fn stop(running: Running) {
    running.token.cancel();
    tokio::time::timeout(Duration::from_secs(5), running.host)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn save_flows_through_validate_and_commit() {
    let mut running = start();

    let req = SaveRequested::new("inventory", "server", "Server-A", json!({ "cpu": 16 }));
    let id = req.correlation_id;
    running.bus.publish(req.into()).unwrap();

    let PipelineMessage::SaveCommitted(committed) = outcome(&mut running.observer, id).await else {
        panic!("expected SaveCommitted");
    };
    assert_eq!(committed.entity_id, "Server-A");
    assert_eq!(
        running.sink.get("server", "Server-A").unwrap(),
        Some(json!({ "cpu": 16 }))
    );

    // 16 -> 24 is too far: audited, but not committed.
    let req = SaveRequested::new("inventory", "server", "Server-A", json!({ "cpu": 24 }));
    let id = req.correlation_id;
    running.bus.publish(req.into()).unwrap();
    assert!(matches!(
        outcome(&mut running.observer, id).await,
        PipelineMessage::SaveRejected(_)
    ));
    assert_eq!(
        running.sink.get("server", "Server-A").unwrap(),
        Some(json!({ "cpu": 16 }))
    );

    let key = EntityKey::new("server:Server-A").unwrap();
    let verdicts: Vec<bool> = running
        .store
        .history(&key)
        .unwrap()
        .iter()
        .map(|r| r.validated)
        .collect();
    assert_eq!(verdicts, vec![true, false]);

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_retries_then_reports_open_circuit() {
    let mut running = start();
    running.sink.save("server", "s1", &json!({ "cpu": 2 })).unwrap();

    // Two injected faults exhaust both attempts of the first delete.
    running.store.fail_next(2);
    let req = DeleteRequested::new("inventory", "server", "s1");
    let id = req.correlation_id;
    running.bus.publish(req.into()).unwrap();
    let PipelineMessage::DeleteCommitFault(fault) = outcome(&mut running.observer, id).await else {
        panic!("expected DeleteCommitFault");
    };
    assert_eq!(fault.fault_kind, FaultKind::RetriesExhausted);

    // Threshold of one: the circuit is now open and the delete is not attempted.
    let req = DeleteRequested::new("inventory", "server", "s1");
    let id = req.correlation_id;
    running.bus.publish(req.into()).unwrap();
    let PipelineMessage::DeleteCommitFault(fault) = outcome(&mut running.observer, id).await else {
        panic!("expected DeleteCommitFault");
    };
    assert_eq!(fault.fault_kind, FaultKind::CircuitOpen);
    assert_eq!(running.sink.len().unwrap(), 1);

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_is_all_or_nothing() {
    let mut running = start();

    let failing = SaveBatchRequested::new(vec![
        SaveRequested::new("inventory", "server", "k", json!({ "cpu": 10 })),
        SaveRequested::new("inventory", "server", "k", json!({ "cpu": 14 })),
        SaveRequested::new("inventory", "server", "k", json!({ "cpu": 30 })),
    ]);
    let id = failing.correlation_id;
    running.bus.publish(failing.into()).unwrap();
    let PipelineMessage::SaveBatchRejected(rejected) = outcome(&mut running.observer, id).await else {
        panic!("expected SaveBatchRejected");
    };
    assert_eq!(rejected.failed_index, Some(2));
    assert!(running.store.is_empty().unwrap());

    let passing = SaveBatchRequested::new(vec![
        SaveRequested::new("inventory", "server", "k", json!({ "cpu": 10 })),
        SaveRequested::new("inventory", "server", "k", json!({ "cpu": 14 })),
    ]);
    let id = passing.correlation_id;
    let batch_id = passing.batch_id;
    running.bus.publish(passing.into()).unwrap();
    let PipelineMessage::SaveBatchValidated(ok) = outcome(&mut running.observer, id).await else {
        panic!("expected SaveBatchValidated");
    };
    assert!((ok.aggregate_metric - 24.0).abs() < f64::EPSILON);

    let key = EntityKey::new(format!("batch:{batch_id}")).unwrap();
    let history = running.store.history(&key).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, OperationKind::Batch);
    assert_eq!(history[0].batch_size, Some(2));

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wire_json_requests_are_accepted() {
    let mut running = start();

    let msg = PipelineMessage::from_json(
        r#"{
            "type": "save_requested",
            "appName": "inventory",
            "entityType": "router",
            "entityId": "r1",
            "payload": { "ports": 48 }
        }"#,
    )
    .unwrap();
    let id = msg.correlation_id();
    running.bus.publish(msg).unwrap();

    // No plan for routers: always valid.
    assert!(matches!(
        outcome(&mut running.observer, id).await,
        PipelineMessage::SaveCommitted(_)
    ));

    stop(running).await;
}
