use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use skiff_core::{CoreResult, ResourceId, ResourceKey, ResourceKind};

use crate::{title_for, ApiError, ApiResponse, ApiResult, ClusterApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Get,
    GetAll,
    Update,
    Remove,
    Start,
    Stop,
}

/// A recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: ResourceKind,
    pub key: Option<ResourceKey>,
}

#[derive(Default)]
struct MockState {
    entities: HashMap<(ResourceKind, ResourceId), serde_json::Value>,
    get_script: HashMap<(ResourceKind, ResourceId), VecDeque<serde_json::Value>>,
    list_script: HashMap<ResourceKind, VecDeque<Vec<serde_json::Value>>>,
    failures: HashMap<(ResourceKind, Verb), VecDeque<ApiError>>,
    calls: Vec<Call>,
}

/// In-memory cluster for tests.
///
/// Behaves like a server that converges instantly: `start` sets `state` to
/// RUNNING, `stop` drops `state`, `remove` deletes. Scripted `get`/`get_all`
/// results take precedence until exhausted, then the live entity is served.
/// Every call waits `latency` first.
#[derive(Default)]
pub struct MockApi {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency, ..Self::default() }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an entity; its key is read from the object itself.
    pub fn insert(&self, kind: ResourceKind, entity: serde_json::Value) -> CoreResult<ResourceKey> {
        let key = ResourceKey::from_value(&entity)?;
        self.lock().entities.insert((kind, key.id()), entity);
        Ok(key)
    }

    pub fn entity(&self, kind: ResourceKind, key: &ResourceKey) -> Option<serde_json::Value> {
        self.lock().entities.get(&(kind, key.id())).cloned()
    }

    /// Queue `data` values returned by successive `get` calls for `key`.
    pub fn script_get(&self, kind: ResourceKind, key: &ResourceKey, data: impl IntoIterator<Item = serde_json::Value>) {
        self.lock().get_script.entry((kind, key.id())).or_default().extend(data);
    }

    /// Queue lists returned by successive `get_all` calls for `kind`.
    pub fn script_get_all(&self, kind: ResourceKind, lists: impl IntoIterator<Item = Vec<serde_json::Value>>) {
        self.lock().list_script.entry(kind).or_default().extend(lists);
    }

    /// Make the next `verb` call on `kind` fail with `err`.
    pub fn fail_next(&self, kind: ResourceKind, verb: Verb, err: ApiError) {
        self.lock().failures.entry((kind, verb)).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, verb: Verb) -> usize {
        self.lock().calls.iter().filter(|c| c.verb == verb).count()
    }

    async fn enter(&self, verb: Verb, kind: ResourceKind, key: Option<&ResourceKey>) -> ApiResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut st = self.lock();
        st.calls.push(Call { verb, kind, key: key.cloned() });
        match st.failures.get_mut(&(kind, verb)).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(verb: &str, kind: ResourceKind, key: &ResourceKey) -> ApiResponse {
        ApiResponse::rejected(404, format!("{} {} does not exist", kind.label(), key), title_for(verb, kind, Some(key), false))
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockApi {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ApiResult<ApiResponse> {
        let key = ResourceKey::from_value(body).ok();
        self.enter(Verb::Create, kind, key.as_ref()).await?;
        let Some(key) = key else {
            return Ok(ApiResponse::rejected(400, "name is required", title_for("Create", kind, None, false)));
        };
        self.lock().entities.insert((kind, key.id()), body.clone());
        Ok(ApiResponse::ok(body.clone(), title_for("Create", kind, Some(&key), true)))
    }

    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        self.enter(Verb::Get, kind, Some(key)).await?;
        let mut st = self.lock();
        let scripted = st.get_script.get_mut(&(kind, key.id())).and_then(|q| q.pop_front());
        match scripted.or_else(|| st.entities.get(&(kind, key.id())).cloned()) {
            Some(data) => Ok(ApiResponse::ok(data, title_for("Get", kind, Some(key), true))),
            None => Ok(Self::not_found("Get", kind, key)),
        }
    }

    async fn get_all(&self, kind: ResourceKind) -> ApiResult<ApiResponse> {
        self.enter(Verb::GetAll, kind, None).await?;
        let mut st = self.lock();
        let scripted = st.list_script.get_mut(&kind).and_then(|q| q.pop_front());
        let list = match scripted {
            Some(list) => list,
            None => {
                let mut live: Vec<_> = st.entities.iter().filter(|((k, _), _)| *k == kind).map(|((_, id), v)| (id.clone(), v.clone())).collect();
                live.sort_by(|a, b| a.0.cmp(&b.0));
                live.into_iter().map(|(_, v)| v).collect()
            }
        };
        Ok(ApiResponse::ok(serde_json::Value::Array(list), title_for("Get", kind, None, true)))
    }

    async fn update(&self, kind: ResourceKind, key: &ResourceKey, body: &serde_json::Value) -> ApiResult<ApiResponse> {
        self.enter(Verb::Update, kind, Some(key)).await?;
        let mut st = self.lock();
        let Some(current) = st.entities.get_mut(&(kind, key.id())) else {
            return Ok(Self::not_found("Update", kind, key));
        };
        if let (Some(dst), Some(src)) = (current.as_object_mut(), body.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        Ok(ApiResponse::ok(current.clone(), title_for("Update", kind, Some(key), true)))
    }

    async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        self.enter(Verb::Remove, kind, Some(key)).await?;
        match self.lock().entities.remove(&(kind, key.id())) {
            Some(_) => Ok(ApiResponse::ok(serde_json::Value::Null, title_for("Remove", kind, Some(key), true))),
            None => Ok(Self::not_found("Remove", kind, key)),
        }
    }

    async fn start(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        self.enter(Verb::Start, kind, Some(key)).await?;
        let mut st = self.lock();
        let Some(current) = st.entities.get_mut(&(kind, key.id())) else {
            return Ok(Self::not_found("Start", kind, key));
        };
        if let Some(obj) = current.as_object_mut() {
            obj.insert("state".into(), serde_json::json!("RUNNING"));
        }
        Ok(ApiResponse::ok(serde_json::Value::Null, title_for("Start", kind, Some(key), true)))
    }

    async fn stop(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        self.enter(Verb::Stop, kind, Some(key)).await?;
        let mut st = self.lock();
        let Some(current) = st.entities.get_mut(&(kind, key.id())) else {
            return Ok(Self::not_found("Stop", kind, key));
        };
        if let Some(obj) = current.as_object_mut() {
            obj.remove("state");
        }
        Ok(ApiResponse::ok(serde_json::Value::Null, title_for("Stop", kind, Some(key), true)))
    }
}
