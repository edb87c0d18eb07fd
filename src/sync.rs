//! Live state shared with observers: a full snapshot on connect, then one
//! patch per state change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::resources::ResourceView;
use crate::tasks::TaskView;


#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub resources: Vec<ResourceView>,
    pub tasks: Vec<TaskView>,
    pub external_system: ExternalSystem,
}


#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalSystem {
    pub available: bool,
}


#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Replace,
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PatchOp {
    pub op: Op,
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self { op: Op::Replace, path: path.into(), value }
    }
}

pub type Patch = Vec<PatchOp>;


/// One line of the live stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Patch(Patch),
    Snapshot(Value),
}


/// A change to one section of the snapshot.
#[derive(Clone, Debug)]
pub enum Update {
    Resources(Vec<ResourceView>),
    Tasks(Vec<TaskView>),
    ExternalSystem(bool),
}

impl Update {
    fn section(&self) -> &'static str {
        match self {
            Update::Resources(_) => "resources",
            Update::Tasks(_) => "tasks",
            Update::ExternalSystem(_) => "externalSystem",
        }
    }

    fn value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Update::Resources(resources) => serde_json::to_value(resources),
            Update::Tasks(tasks) => serde_json::to_value(tasks),
            Update::ExternalSystem(available) => {
                serde_json::to_value(ExternalSystem { available: *available })
            }
        }
    }
}


/// A new observer's starting point and the patches that follow it.
#[derive(Debug)]
pub struct Subscription {
    pub snapshot: Value,
    pub patches: mpsc::UnboundedReceiver<Patch>,
}


#[derive(Debug)]
struct SyncState {
    snapshot: Value,
    observers: Vec<mpsc::UnboundedSender<Patch>>,
}


/// Sole owner of the live snapshot.
#[derive(Debug)]
pub struct Synchronizer {
    state: Mutex<SyncState>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        let snapshot = serde_json::to_value(Snapshot::default())
            .unwrap_or_else(|_| Value::Object(Default::default()));
        Self {
            state: Mutex::new(SyncState { snapshot, observers: vec![] }),
        }
    }

    pub async fn snapshot(&self) -> Value {
        self.state.lock().await.snapshot.clone()
    }

    /// Registers an observer. The snapshot is taken under the same lock
    /// that serializes broadcasts, so it lines up with the first patch
    /// received.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.observers.push(tx);
        Subscription { snapshot: state.snapshot.clone(), patches: rx }
    }

    pub async fn observers(&self) -> usize {
        self.state.lock().await.observers.len()
    }

    pub async fn apply(&self, update: Update) -> Patch {
        self.apply_all(vec![update]).await
    }

    /// Applies several section updates as a single patch.
    pub async fn apply_all(&self, updates: Vec<Update>) -> Patch {
        let mut state = self.state.lock().await;
        let mut patch = vec![];

        for update in updates {
            let section = update.section();
            let value = match update.value() {
                Ok(value) => value,
                Err(err) => {
                    warn!(section, "failed to serialize snapshot section: {}", err);
                    continue;
                }
            };

            let path = format!("/{}", escape(section));
            match state.snapshot.get_mut(section) {
                Some(current) => {
                    diff(current, &value, &path, &mut patch);
                    *current = value;
                }
                None => {
                    patch.push(PatchOp::replace(path, value.clone()));
                    if let Value::Object(snapshot) = &mut state.snapshot {
                        snapshot.insert(section.to_string(), value);
                    }
                }
            }
        }

        if !patch.is_empty() {
            debug!(ops = patch.len(), observers = state.observers.len(), "broadcasting patch");
            state.observers.retain(|observer| observer.send(patch.clone()).is_ok());
        }

        patch
    }
}


/// Appends the replacements that turn `old` into `new`. Objects with the
/// same keys and arrays with the same length are compared member by member;
/// anything else is replaced as a whole.
pub fn diff(old: &Value, new: &Value, path: &str, patch: &mut Patch) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b))
            if a.len() == b.len() && a.keys().all(|key| b.contains_key(key)) =>
        {
            for (key, value) in b {
                diff(&a[key], value, &format!("{}/{}", path, escape(key)), patch);
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (index, (x, y)) in a.iter().zip(b).enumerate() {
                diff(x, y, &format!("{}/{}", path, index), patch);
            }
        }
        _ => patch.push(PatchOp::replace(path, new.clone())),
    }
}


/// Applies `patch` to `doc`. Returns false if a path does not exist.
pub fn apply_patch(doc: &mut Value, patch: &[PatchOp]) -> bool {
    patch.iter().all(|op| match op.op {
        Op::Replace => match doc.pointer_mut(&op.path) {
            Some(target) => {
                *target = op.value.clone();
                true
            }
            None => false,
        },
    })
}


fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
