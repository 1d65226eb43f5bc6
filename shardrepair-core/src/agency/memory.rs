//! An in-memory coordination store.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::agency::{lookup, path_segments, AgencyClient};
use crate::error::{AgencyError, AgencyResult};
use crate::operations::{AgencyOperation, AgencyPrecondition, AgencyWriteTransaction, WriteOutcome};

/// A coordination store held entirely in memory.
///
/// It implements the same read & conditional write contract as the real store, and offers fault
/// injection so that communication failures can be exercised deterministically.
pub struct InMemoryAgency {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    /// The store tree.
    root: Value,
    /// The number of upcoming reads which will fail as unreachable.
    failing_reads: u32,
    /// The number of upcoming writes which will fail as unreachable without applying.
    failing_writes: u32,
    /// The number of upcoming writes which will apply, but whose reply is lost.
    lost_replies: u32,
    /// Every transaction applied so far, in order.
    applied: Vec<AgencyWriteTransaction>,
}

impl Default for InMemoryAgency {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl InMemoryAgency {
    /// Create a new instance holding the given tree.
    pub fn new(root: Value) -> Self {
        Self {
            inner: Mutex::new(MemoryState { root, ..Default::default() }),
        }
    }

    /// Get a copy of the value under the given path.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let state = self.inner.lock().await;
        lookup(&state.root, &path_segments(path)).cloned()
    }

    /// Unconditionally set the value under the given path.
    ///
    /// This models writes performed by other cluster actors.
    pub async fn set(&self, path: &str, value: Value) {
        let mut state = self.inner.lock().await;
        insert(&mut state.root, &path_segments(path), value);
    }

    /// Unconditionally delete the value under the given path.
    pub async fn delete(&self, path: &str) -> Option<Value> {
        let mut state = self.inner.lock().await;
        remove(&mut state.root, &path_segments(path))
    }

    /// Make the next `count` reads fail as unreachable.
    pub async fn fail_reads(&self, count: u32) {
        self.inner.lock().await.failing_reads = count;
    }

    /// Make the next `count` writes fail as unreachable, without applying them.
    pub async fn fail_writes(&self, count: u32) {
        self.inner.lock().await.failing_writes = count;
    }

    /// Make the next `count` writes apply, but report a communication failure to the caller.
    pub async fn lose_write_replies(&self, count: u32) {
        self.inner.lock().await.lost_replies = count;
    }

    /// All transactions applied so far, in order.
    pub async fn applied_writes(&self) -> Vec<AgencyWriteTransaction> {
        self.inner.lock().await.applied.clone()
    }

    /// A copy of the whole store tree.
    pub async fn dump(&self) -> Value {
        self.inner.lock().await.root.clone()
    }

    fn precondition_holds(root: &Value, precondition: &AgencyPrecondition) -> bool {
        let current = lookup(root, &path_segments(precondition.key()));
        match precondition {
            AgencyPrecondition::Value { expected, .. } => current == Some(expected),
            AgencyPrecondition::Empty { .. } => current.is_none(),
        }
    }

    fn apply(root: &mut Value, operation: &AgencyOperation) {
        match operation {
            AgencyOperation::Delete { key } => {
                let _ = remove(root, &path_segments(key));
            }
            AgencyOperation::Set { key, value } => insert(root, &path_segments(key), value.clone()),
        }
    }
}

#[async_trait]
impl AgencyClient for InMemoryAgency {
    async fn read(&self, path: &str) -> AgencyResult<Option<Value>> {
        let mut state = self.inner.lock().await;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(AgencyError::Unreachable("injected read failure".into()));
        }
        Ok(lookup(&state.root, &path_segments(path)).cloned())
    }

    async fn write(&self, txn: &AgencyWriteTransaction) -> AgencyResult<WriteOutcome> {
        let mut state = self.inner.lock().await;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(AgencyError::Unreachable("injected write failure".into()));
        }
        if !txn.preconditions.iter().all(|pre| Self::precondition_holds(&state.root, pre)) {
            return Ok(WriteOutcome::PreconditionFailed);
        }
        for operation in txn.operations.iter() {
            Self::apply(&mut state.root, operation);
        }
        state.applied.push(txn.clone());
        if state.lost_replies > 0 {
            state.lost_replies -= 1;
            return Err(AgencyError::Unreachable("injected lost reply".into()));
        }
        Ok(WriteOutcome::Applied)
    }
}

/// Set the value under the given segments of a store tree, creating intermediate objects.
///
/// Any non-object value found along the way is replaced by an object.
fn insert(root: &mut Value, segments: &[&str], value: Value) {
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => {
            *root = value;
            return;
        }
    };
    let mut node = root;
    for seg in parents {
        node = ensure_object(node).entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.to_string(), value);
}

/// Remove the value under the given segments of a store tree, returning it if present.
fn remove(root: &mut Value, segments: &[&str]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut node = root;
    for seg in parents {
        node = node.as_object_mut()?.get_mut(*seg)?;
    }
    node.as_object_mut()?.remove(*last)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(obj) => obj,
        _ => unreachable!("node was just replaced with an object"),
    }
}
