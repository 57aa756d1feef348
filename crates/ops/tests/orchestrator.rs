use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use skiff_api::{ApiError, ApiResponse, Call, MockApi, Verb};
use skiff_core::{ResourceKey, ResourceKind};
use skiff_ops::{
    spawn_epic, Action, DispatchError, Dispatcher, EpicSet, FailurePayload, Gate, InitializeAppFlow, OpsConfig, Operation,
    OperationRequest, Payload, ResourceFlow, Stage, StatusHook, SwitchPipelineFlow,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn recv(rx: &mut UnboundedReceiver<Action>) -> Action {
    rx.recv().await.expect("action")
}

fn drain(rx: &mut UnboundedReceiver<Action>) -> Vec<Action> {
    let mut out = Vec::new();
    while let Ok(a) = rx.try_recv() {
        out.push(a);
    }
    out
}

fn types(actions: &[Action]) -> Vec<String> {
    actions.iter().map(Action::type_name).collect()
}

fn resource_epic(
    api: &Arc<MockApi>,
    kind: ResourceKind,
    op: Operation,
    gate: Gate,
) -> (skiff_ops::EpicHandle<OperationRequest>, UnboundedReceiver<Action>) {
    let cfg = OpsConfig::default();
    let (out, rx) = Dispatcher::channel();
    let flow = Arc::new(ResourceFlow::new(kind, op, op.policy(&cfg), api.clone()));
    (spawn_epic(flow, gate, out), rx)
}

#[tokio::test(start_paused = true)]
async fn stop_succeeds_once_state_is_gone() {
    let api = Arc::new(MockApi::with_latency(ms(250)));
    let key = api.insert(ResourceKind::Shabondi, json!({ "name": "sb", "state": "RUNNING" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Shabondi, Operation::Stop, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key.clone())).expect("trigger");
    let req = recv(&mut rx).await;
    assert_eq!(req.type_name(), "STOP_SHABONDI/REQUEST");
    assert_eq!(req.payload.id(), Some(&key.id()));
    assert_eq!(t0.elapsed(), Duration::ZERO);

    let done = recv(&mut rx).await;
    assert_eq!(done.type_name(), "STOP_SHABONDI/SUCCESS");
    assert_eq!(t0.elapsed(), ms(500));
    match &done.payload {
        Payload::Success(s) => {
            let row = s.normalized.get(ResourceKind::Shabondi, &key.id()).expect("row");
            assert!(row.get("state").is_none());
        }
        other => panic!("unexpected payload {:?}", other),
    }
    epic.shutdown().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_exhausts_retries_and_logs_event() {
    let api = Arc::new(MockApi::new());
    let running = json!({ "name": "sb", "group": "default", "state": "RUNNING" });
    let key = api.insert(ResourceKind::Shabondi, running.clone()).expect("seed");
    api.script_get(ResourceKind::Shabondi, &key, std::iter::repeat(running).take(6));
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Shabondi, Operation::Stop, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key.clone())).expect("trigger");
    assert_eq!(recv(&mut rx).await.stage, Stage::Request);

    let failure = recv(&mut rx).await;
    assert_eq!(t0.elapsed(), ms(10_000));
    assert_eq!(failure.type_name(), "STOP_SHABONDI/FAILURE");
    let Payload::Failure(f) = &failure.payload else { panic!("expected failure payload") };
    assert!(f.title.contains("failed after retry 5 times"), "{}", f.title);
    assert!(f.title.ends_with("Actual state: RUNNING"), "{}", f.title);
    assert_eq!(f.data["state"], "RUNNING");

    let log = recv(&mut rx).await;
    assert_eq!(log.type_name(), "CREATE_EVENT_LOG/TRIGGER");
    let v = serde_json::to_value(&log.payload).expect("ser");
    assert_eq!(v["type"], "error");
    assert_eq!(v["title"], json!(f.title));
    assert_eq!(api.call_count(Verb::Get), 6);
    epic.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_succeeds_on_second_fetch() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Shabondi, json!({ "name": "sb", "state": "RUNNING" })).expect("seed");
    api.script_get(ResourceKind::Shabondi, &key, [json!({ "name": "sb", "state": "RUNNING" })]);
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Shabondi, Operation::Stop, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key)).expect("trigger");
    recv(&mut rx).await;
    let done = recv(&mut rx).await;
    assert_eq!(done.stage, Stage::Success);
    assert_eq!(t0.elapsed(), ms(2000));
    assert_eq!(api.call_count(Verb::Get), 2);
    epic.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn identical_trigger_in_flight_runs_once() {
    let api = Arc::new(MockApi::with_latency(ms(250)));
    let key = api.insert(ResourceKind::Worker, json!({ "name": "wk" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Worker, Operation::Start, Gate::LatestPerKey);

    epic.trigger(OperationRequest::new(key.clone())).expect("trigger");
    epic.trigger(OperationRequest::new(key.clone())).expect("trigger");
    epic.shutdown().await;

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["START_WORKER/REQUEST", "START_WORKER/SUCCESS"]);
    assert_eq!(api.call_count(Verb::Start), 1);
}

#[tokio::test(start_paused = true)]
async fn identical_trigger_after_completion_runs_again() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Broker, json!({ "name": "bk" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Broker, Operation::Fetch, Gate::LatestPerKey);

    epic.trigger(OperationRequest::new(key.clone())).expect("trigger");
    recv(&mut rx).await;
    assert_eq!(recv(&mut rx).await.stage, Stage::Success);
    tokio::time::sleep(ms(10)).await;
    epic.trigger(OperationRequest::new(key)).expect("trigger");
    epic.shutdown().await;

    assert_eq!(types(&drain(&mut rx)), vec!["FETCH_BROKER/REQUEST", "FETCH_BROKER/SUCCESS"]);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_run_independently() {
    let api = Arc::new(MockApi::with_latency(ms(250)));
    let a = api.insert(ResourceKind::Broker, json!({ "name": "s1", "state": "RUNNING" })).expect("seed");
    let b = api.insert(ResourceKind::Broker, json!({ "name": "s2", "state": "RUNNING" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Broker, Operation::Stop, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(a.clone())).expect("trigger");
    epic.trigger(OperationRequest::new(b.clone())).expect("trigger");
    epic.shutdown().await;
    assert_eq!(t0.elapsed(), ms(500));

    let actions = drain(&mut rx);
    let successes: Vec<_> = actions.iter().filter(|x| x.stage == Stage::Success).filter_map(|x| x.payload.id()).collect();
    assert_eq!(successes.len(), 2);
    assert!(successes.contains(&&a.id()));
    assert!(successes.contains(&&b.id()));
}

#[tokio::test(start_paused = true)]
async fn differing_trigger_supersedes_in_flight_flow() {
    let api = Arc::new(MockApi::with_latency(ms(250)));
    let key = api.insert(ResourceKind::Topic, json!({ "name": "t1", "partitions": 1 })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Topic, Operation::Update, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key.clone()).with_body(json!({ "partitions": 2 }))).expect("trigger");
    tokio::time::sleep(ms(100)).await;
    epic.trigger(OperationRequest::new(key.clone()).with_body(json!({ "partitions": 3 }))).expect("trigger");
    epic.shutdown().await;
    assert_eq!(t0.elapsed(), ms(350));

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["UPDATE_TOPIC/REQUEST", "UPDATE_TOPIC/REQUEST", "UPDATE_TOPIC/SUCCESS"]);
    let Payload::Success(s) = &actions[2].payload else { panic!("expected success") };
    assert_eq!(s.normalized.get(ResourceKind::Topic, &key.id()).expect("row")["partitions"], 3);
    assert_eq!(api.call_count(Verb::Update), 1);
}

#[tokio::test(start_paused = true)]
async fn start_success_carries_running_entity() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Broker, json!({ "name": "bk", "group": "g" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Broker, Operation::Start, Gate::LatestPerKey);

    epic.trigger(OperationRequest::new(key.clone()).with_view(json!({ "settings": { "displayName": "main" } })))
        .expect("trigger");
    epic.shutdown().await;

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["START_BROKER/REQUEST", "START_BROKER/SUCCESS"]);
    let Payload::Success(s) = &actions[1].payload else { panic!("expected success") };
    let row = s.normalized.get(ResourceKind::Broker, &key.id()).expect("row");
    assert_eq!(row["state"], "RUNNING");
    assert_eq!(row["settings"]["displayName"], "main");
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl StatusHook for Recorder {
    fn on_request(&self, key: &ResourceKey) {
        self.seen.lock().expect("lock").push(format!("request {}", key));
    }
    fn on_success(&self, key: &ResourceKey, _data: &serde_json::Value) {
        self.seen.lock().expect("lock").push(format!("success {}", key));
    }
    fn on_failure(&self, key: &ResourceKey, failure: &FailurePayload) {
        self.seen.lock().expect("lock").push(format!("failure {} {}", key, failure.title));
    }
}

#[tokio::test(start_paused = true)]
async fn start_rejection_fails_with_event_log_and_hook() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Broker, json!({ "name": "bk" })).expect("seed");
    let rejected = ApiResponse::rejected(500, "boom", "Start broker default/bk failed.");
    api.fail_next(ResourceKind::Broker, Verb::Start, ApiError::Rejected(Box::new(rejected)));
    let hook = Arc::new(Recorder::default());
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Broker, Operation::Start, Gate::LatestPerKey);

    epic.trigger(OperationRequest::new(key).with_hook(hook.clone())).expect("trigger");
    epic.shutdown().await;

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["START_BROKER/REQUEST", "START_BROKER/FAILURE", "CREATE_EVENT_LOG/TRIGGER"]);
    let Payload::Failure(f) = &actions[1].payload else { panic!("expected failure") };
    assert_eq!(f.title, "Start broker default/bk failed.");
    assert_eq!(f.meta.as_ref().expect("meta")["status"], 500);
    assert_eq!(
        *hook.seen.lock().expect("lock"),
        vec!["request default/bk".to_string(), "failure default/bk Start broker default/bk failed.".to_string()]
    );
    assert_eq!(api.call_count(Verb::Get), 0);
}

#[tokio::test(start_paused = true)]
async fn start_exhausts_its_own_retry_budget() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Worker, json!({ "name": "wk" })).expect("seed");
    api.script_get(ResourceKind::Worker, &key, std::iter::repeat(json!({ "name": "wk" })).take(11));
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Worker, Operation::Start, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key)).expect("trigger");
    assert_eq!(recv(&mut rx).await.stage, Stage::Request);
    let failure = recv(&mut rx).await;
    assert_eq!(t0.elapsed(), ms(20_000));
    let Payload::Failure(f) = &failure.payload else { panic!("expected failure payload") };
    assert!(f.title.contains("failed after retry 10 times"), "{}", f.title);
    assert!(f.title.ends_with("Expected state: RUNNING, Actual state: nonexistent"), "{}", f.title);
    assert_eq!(recv(&mut rx).await.type_name(), "CREATE_EVENT_LOG/TRIGGER");
    assert_eq!(api.call_count(Verb::Get), 11);
    epic.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn superseded_flow_does_not_reach_its_hook() {
    let api = Arc::new(MockApi::with_latency(ms(250)));
    let key = api.insert(ResourceKind::Topic, json!({ "name": "t1", "partitions": 1 })).expect("seed");
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let (epic, _rx) = resource_epic(&api, ResourceKind::Topic, Operation::Update, Gate::LatestPerKey);

    let req = OperationRequest::new(key.clone());
    epic.trigger(req.clone().with_body(json!({ "partitions": 2 })).with_hook(first.clone())).expect("trigger");
    tokio::time::sleep(ms(100)).await;
    epic.trigger(req.with_body(json!({ "partitions": 3 })).with_hook(second.clone())).expect("trigger");
    epic.shutdown().await;

    assert_eq!(*first.seen.lock().expect("lock"), vec!["request default/t1".to_string()]);
    assert_eq!(
        *second.seen.lock().expect("lock"),
        vec!["request default/t1".to_string(), "success default/t1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_error_while_polling_fails_immediately() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Zookeeper, json!({ "name": "zk", "state": "RUNNING" })).expect("seed");
    api.fail_next(ResourceKind::Zookeeper, Verb::Get, ApiError::Transport("connection refused".into()));
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Zookeeper, Operation::Stop, Gate::LatestPerKey);
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key)).expect("trigger");
    epic.shutdown().await;
    assert_eq!(t0.elapsed(), Duration::ZERO);

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["STOP_ZOOKEEPER/REQUEST", "STOP_ZOOKEEPER/FAILURE", "CREATE_EVENT_LOG/TRIGGER"]);
    let Payload::Failure(f) = &actions[1].payload else { panic!("expected failure") };
    assert_eq!(f.title, "Request failed: connection refused");
}

#[tokio::test(start_paused = true)]
async fn delete_is_debounced_and_keeps_latest() {
    let api = Arc::new(MockApi::new());
    let t1 = api.insert(ResourceKind::Topic, json!({ "name": "t1" })).expect("seed");
    let t2 = api.insert(ResourceKind::Topic, json!({ "name": "t2" })).expect("seed");
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Topic, Operation::Delete, Gate::Debounce(ms(1000)));
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(t1.clone())).expect("trigger");
    tokio::time::sleep(ms(500)).await;
    epic.trigger(OperationRequest::new(t2.clone())).expect("trigger");

    let req = recv(&mut rx).await;
    assert_eq!(t0.elapsed(), ms(1500));
    assert_eq!(req.payload.id(), Some(&t2.id()));
    let done = recv(&mut rx).await;
    assert_eq!(done.type_name(), "DELETE_TOPIC/SUCCESS");
    assert_eq!(serde_json::to_value(&done.payload).expect("ser"), json!({ "id": t2.id(), "entity": "topics" }));
    epic.shutdown().await;

    assert_eq!(api.call_count(Verb::Remove), 1);
    assert!(api.entity(ResourceKind::Topic, &t1).is_some());
    assert!(api.entity(ResourceKind::Topic, &t2).is_none());
}

#[tokio::test(start_paused = true)]
async fn delete_of_same_key_in_window_runs_once_with_latest_options() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Connector, json!({ "name": "c1" })).expect("seed");
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Connector, Operation::Delete, Gate::Debounce(ms(1000)));
    let t0 = Instant::now();

    epic.trigger(OperationRequest::new(key.clone()).with_hook(first.clone())).expect("trigger");
    tokio::time::sleep(ms(400)).await;
    epic.trigger(OperationRequest::new(key.clone()).with_hook(second.clone())).expect("trigger");

    assert_eq!(recv(&mut rx).await.type_name(), "DELETE_CONNECTOR/REQUEST");
    assert_eq!(t0.elapsed(), ms(1400));
    epic.shutdown().await;

    assert_eq!(types(&drain(&mut rx)), vec!["DELETE_CONNECTOR/SUCCESS"]);
    let removes: Vec<Call> = api.calls().into_iter().filter(|c| c.verb == Verb::Remove).collect();
    assert_eq!(removes, vec![Call { verb: Verb::Remove, kind: ResourceKind::Connector, key: Some(key) }]);
    assert!(first.seen.lock().expect("lock").is_empty());
    assert_eq!(
        *second.seen.lock().expect("lock"),
        vec!["request default/c1".to_string(), "success default/c1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn delete_gives_up_while_entity_is_listed() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Pipeline, json!({ "name": "p1" })).expect("seed");
    api.script_get_all(ResourceKind::Pipeline, std::iter::repeat(vec![json!({ "name": "p1" })]).take(6));
    let (epic, mut rx) = resource_epic(&api, ResourceKind::Pipeline, Operation::Delete, Gate::Debounce(ms(1000)));

    epic.trigger(OperationRequest::new(key)).expect("trigger");
    epic.shutdown().await;

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["DELETE_PIPELINE/REQUEST", "DELETE_PIPELINE/FAILURE"]);
    let Payload::Failure(f) = &actions[1].payload else { panic!("expected failure") };
    assert!(f.title.starts_with("Try to delete pipeline: \"p1\" failed after retry 5 times"), "{}", f.title);
}

#[tokio::test(start_paused = true)]
async fn switch_pipeline_debounces_and_ignores_empty_names() {
    let (out, mut rx) = Dispatcher::channel();
    let epic = spawn_epic(Arc::new(SwitchPipelineFlow::default()), Gate::Debounce(ms(1000)), out);
    let t0 = Instant::now();

    epic.trigger("a".to_string()).expect("trigger");
    tokio::time::sleep(ms(300)).await;
    epic.trigger("b".to_string()).expect("trigger");
    epic.trigger(String::new()).expect("trigger");

    let req = recv(&mut rx).await;
    assert_eq!(t0.elapsed(), ms(1300));
    assert_eq!(req.payload, Payload::Name { name: "b".into() });
    let done = recv(&mut rx).await;
    assert_eq!(done.type_name(), "SWITCH_PIPELINE/SUCCESS");
    epic.shutdown().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn initialize_app_merges_pipelines_and_workspaces() {
    let api = Arc::new(MockApi::with_latency(ms(100)));
    let p1 = api.insert(ResourceKind::Pipeline, json!({ "name": "p1", "group": "ws1" })).expect("seed");
    let w1 = api.insert(ResourceKind::Workspace, json!({ "name": "ws1" })).expect("seed");
    let (out, mut rx) = Dispatcher::channel();
    let epic = spawn_epic(Arc::new(InitializeAppFlow::new(api.clone())), Gate::Latest, out);
    let t0 = Instant::now();

    epic.trigger(()).expect("trigger");
    epic.shutdown().await;
    // Both lists load concurrently.
    assert_eq!(t0.elapsed(), ms(100));

    let actions = drain(&mut rx);
    assert_eq!(types(&actions), vec!["INITIALIZE_APP/REQUEST", "INITIALIZE_APP/SUCCESS", "INITIALIZE_APP/FULFILL"]);
    let Payload::Success(s) = &actions[1].payload else { panic!("expected success") };
    assert!(s.normalized.get(ResourceKind::Pipeline, &p1.id()).is_some());
    assert!(s.normalized.get(ResourceKind::Workspace, &w1.id()).is_some());
}

#[tokio::test(start_paused = true)]
async fn initialize_app_failure_has_no_fulfill() {
    let api = Arc::new(MockApi::new());
    api.fail_next(ResourceKind::Workspace, Verb::GetAll, ApiError::Transport("timeout".into()));
    let (out, mut rx) = Dispatcher::channel();
    let epic = spawn_epic(Arc::new(InitializeAppFlow::new(api)), Gate::Latest, out);

    epic.trigger(()).expect("trigger");
    epic.shutdown().await;
    assert_eq!(types(&drain(&mut rx)), vec!["INITIALIZE_APP/REQUEST", "INITIALIZE_APP/FAILURE"]);
}

#[tokio::test(start_paused = true)]
async fn epic_set_routes_by_kind_and_operation() {
    let api = Arc::new(MockApi::new());
    let key = api.insert(ResourceKind::Worker, json!({ "name": "wk" })).expect("seed");
    let (out, mut rx) = Dispatcher::channel();
    let set = EpicSet::spawn(api.clone(), &OpsConfig::default(), out);

    let err = set.dispatch(ResourceKind::Pipeline, Operation::Start, OperationRequest::new(key.clone()));
    assert!(matches!(err, Err(DispatchError::Unsupported { .. })));
    set.dispatch(ResourceKind::Worker, Operation::Start, OperationRequest::new(key)).expect("dispatch");
    set.switch_pipeline("p1").expect("switch");
    set.shutdown().await;

    let names = types(&drain(&mut rx));
    assert!(names.contains(&"START_WORKER/SUCCESS".to_string()));
    assert!(names.contains(&"SWITCH_PIPELINE/SUCCESS".to_string()));
}
