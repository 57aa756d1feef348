#![forbid(unsafe_code)]

use serde_json::json;
use skiff_core::{ResourceKey, ResourceKind};
use skiff_ops::{
    normalize, normalize_list, Action, EventLogEntry, FailurePayload, Payload, RemovedPayload, Routine, Stage, SuccessPayload,
};
use skiff_store::{EntityStore, RequestStatus};

fn success(routine: &Routine, kind: ResourceKind, data: serde_json::Value) -> Action {
    let key = ResourceKey::from_value(&data).expect("key");
    let normalized = normalize(kind, &data).expect("normalize");
    Action::success(routine, SuccessPayload { id: Some(key.id()), normalized })
}

fn failure(title: &str, id: Option<skiff_core::ResourceId>) -> FailurePayload {
    FailurePayload { id, data: json!(null), title: title.into(), meta: None }
}

#[test]
fn replay_lifecycle_sequence() {
    let mut store = EntityStore::with_event_log_cap(10);
    let start = Routine::new("START_BROKER");
    let stop = Routine::new("STOP_BROKER");
    let key = ResourceKey::new("default", "bk");
    let id = key.id();

    // Request, then success with the running entity.
    store.apply_batch(&[
        Action::request(&start, Some(id.clone())),
        success(&start, ResourceKind::Broker, json!({ "name": "bk", "state": "RUNNING" })),
    ]);
    let snap1 = store.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.entity("brokers", &id).expect("row")["state"], "RUNNING");
    assert_eq!(snap1.status[&id], RequestStatus::Ready { routine: "START_BROKER".into() });

    // Stop success replaces the row, so `state` is gone.
    store.apply_batch(&[
        Action::request(&stop, Some(id.clone())),
        success(&stop, ResourceKind::Broker, json!({ "name": "bk" })),
    ]);
    let snap2 = store.freeze();
    assert_eq!(snap2.epoch, 2);
    assert!(snap2.entity("brokers", &id).expect("row").get("state").is_none());

    // Delete removes the row and its status.
    let removed = RemovedPayload { id: id.clone(), entity: "brokers" };
    store.apply_batch(&[Action::new(Routine::new("DELETE_BROKER"), Stage::Success, Payload::Removed(removed))]);
    let snap3 = store.freeze();
    assert!(snap3.entity("brokers", &id).is_none());
    assert!(!snap3.status.contains_key(&id));

    // Earlier snapshots are untouched.
    assert!(snap1.entity("brokers", &id).is_some());
}

#[test]
fn failure_sets_status_and_event_log_is_bounded() {
    let mut store = EntityStore::with_event_log_cap(2);
    let id = ResourceKey::new("default", "sb").id();
    let routine = Routine::new("STOP_SHABONDI");

    store.apply(&Action::failure(&routine, failure("stop failed", Some(id.clone()))));
    for n in 0..3 {
        store.apply(&Action::event_log(EventLogEntry::error(failure(&format!("e{}", n), None))));
    }
    let snap = store.freeze();
    assert_eq!(snap.status[&id], RequestStatus::Failed { routine: "STOP_SHABONDI".into(), title: "stop failed".into() });
    let titles: Vec<_> = snap.event_log.iter().map(|e| e.failure.title.as_str()).collect();
    assert_eq!(titles, vec!["e1", "e2"]);
    assert_eq!(store.dropped(), 1);
}

#[test]
fn app_actions_track_pipeline_and_initialization() {
    let mut store = EntityStore::with_event_log_cap(10);
    let pipelines = normalize_list(ResourceKind::Pipeline, &json!([{ "name": "p1" }, { "name": "p2" }])).expect("pl");
    let workspaces = normalize_list(ResourceKind::Workspace, &json!([{ "name": "w1" }])).expect("ws");
    store.apply_batch(&[
        Action::request(&Routine::INITIALIZE_APP, None),
        Action::success(&Routine::INITIALIZE_APP, SuccessPayload { id: None, normalized: pipelines.merge(workspaces) }),
        Action::fulfill(&Routine::INITIALIZE_APP),
        Action::new(Routine::SWITCH_PIPELINE, Stage::Success, Payload::Name { name: "p2".into() }),
    ]);
    let snap = store.freeze();
    assert!(snap.initialized);
    assert_eq!(snap.current_pipeline.as_deref(), Some("p2"));
    assert_eq!(snap.entities["pipelines"].len(), 2);
    assert_eq!(snap.entities["workspaces"].len(), 1);
    assert!(snap.status.is_empty());
}
