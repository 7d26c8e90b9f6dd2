//! In-memory stand-in for the monitoring API
//!
//! Mock-mode clients list and create objects against a fixture instead of
//! the network. Fixtures are shared per mock username so separate clients
//! in one process observe each other's creates, the same way separate
//! connections to the real API would.

use crate::error::{ProvisionError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Registry of shared fixtures, keyed by mock username
static SHARED_FIXTURES: OnceLock<Mutex<HashMap<String, MockFixture>>> = OnceLock::new();

/// In-memory collection store
#[derive(Clone, Default)]
pub struct MockFixture {
    state: Arc<Mutex<FixtureState>>,
}

#[derive(Default)]
struct FixtureState {
    /// Objects per collection path, in creation order
    collections: HashMap<String, Vec<Value>>,
    next_id: u64,
    list_calls: usize,
    create_calls: usize,
}

impl MockFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide fixture for a mock username
    pub fn shared(username: &str) -> Self {
        let registry = SHARED_FIXTURES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.entry(username.to_string()).or_default().clone()
    }

    /// Seed an object into a collection, e.g. `agent_tokens` or `entities/enA/alarms`
    pub fn with_object(self, path: &str, object: Value) -> Self {
        self.lock()
            .collections
            .entry(path.to_string())
            .or_default()
            .push(object);
        self
    }

    /// Number of list calls served
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of objects created through the API
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Objects currently stored at `path`
    pub fn objects(&self, path: &str) -> Vec<Value> {
        self.lock().collections.get(path).cloned().unwrap_or_default()
    }

    pub(crate) fn list(&self, path: &str) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.list_calls += 1;
        ensure_parent_exists(&state, path)?;
        Ok(state.collections.get(path).cloned().unwrap_or_default())
    }

    pub(crate) fn create(&self, path: &str, attributes: Value) -> Result<Value> {
        let mut state = self.lock();
        state.create_calls += 1;
        ensure_parent_exists(&state, path)?;

        let Value::Object(mut object) = attributes else {
            return Err(ProvisionError::remote(400, "request body must be an object"));
        };
        if !object.get("label").is_some_and(Value::is_string) {
            return Err(ProvisionError::remote(400, "label is required"));
        }

        state.next_id += 1;
        let id = generate_id(path, state.next_id);
        object.insert("id".to_string(), Value::String(id.clone()));
        if path == "agent_tokens" {
            object.insert("token".to_string(), Value::String(id));
        }

        let created = Value::Object(object);
        state
            .collections
            .entry(path.to_string())
            .or_default()
            .push(created.clone());

        tracing::debug!("Mock created {} under {}", created["id"], path);
        Ok(created)
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scoped paths (`entities/<id>/alarms`) need their parent to exist
fn ensure_parent_exists(state: &FixtureState, path: &str) -> Result<()> {
    let parts: Vec<&str> = path.split('/').collect();
    let [parent_collection, parent_id, _] = parts.as_slice() else {
        return Ok(());
    };

    let found = state
        .collections
        .get(*parent_collection)
        .is_some_and(|objects| objects.iter().any(|o| o["id"] == *parent_id));

    if found {
        Ok(())
    } else {
        Err(ProvisionError::remote(
            404,
            format!("Object does not exist: {}/{}", parent_collection, parent_id),
        ))
    }
}

/// Deterministic id: a collection prefix plus the fixture's sequence number
fn generate_id(path: &str, sequence: u64) -> String {
    let collection = path.rsplit('/').next().unwrap_or(path);
    match collection {
        "entities" => format!("en{:08x}", sequence),
        "alarms" => format!("al{:08x}", sequence),
        "agent_tokens" => format!("{:016x}.{:08x}", 0x6d6f636b_u64, sequence),
        _ => format!("{:08x}", sequence),
    }
}
