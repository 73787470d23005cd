//! Variable pool: the per-run scoped value store.
//!
//! Owned exclusively by the control loop. Nodes never see the pool itself,
//! only the [`VariablePool::snapshot`] of the selectors they declared.

use std::collections::BTreeMap;

use nodes::variables::{
    is_reserved_scope, File, CONVERSATION_VARIABLE_NODE_ID, ENVIRONMENT_VARIABLE_NODE_ID, SYSTEM_VARIABLE_NODE_ID,
};
use nodes::{NodeInputs, Segment, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Run-level values exposed under the `sys` scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemVariables {
    pub query: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub workflow_run_id: Option<Uuid>,
    pub dialogue_count: Option<i64>,
}

impl SystemVariables {
    fn into_segments(self) -> BTreeMap<String, Segment> {
        let mut out = BTreeMap::new();
        let mut put = |name: &str, value: Option<Segment>| {
            if let Some(v) = value {
                out.insert(name.to_string(), v);
            }
        };
        put("query", self.query.map(Segment::String));
        put("files", Some(Segment::ArrayFile(self.files)));
        put("conversation_id", self.conversation_id.map(Segment::String));
        put("user_id", self.user_id.map(Segment::String));
        put("app_id", self.app_id.map(Segment::String));
        put("workflow_id", self.workflow_id.map(|id| Segment::String(id.to_string())));
        put("workflow_run_id", self.workflow_run_id.map(|id| Segment::String(id.to_string())));
        put("dialogue_count", self.dialogue_count.map(Segment::Integer));
        out
    }
}

/// Scope id → variable name → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablePool {
    scopes: BTreeMap<String, BTreeMap<String, Segment>>,
}

impl VariablePool {
    /// Seed the reserved scopes. Environment values can only enter here.
    pub fn new(
        system: SystemVariables,
        environment: BTreeMap<String, Value>,
        conversation: BTreeMap<String, Value>,
    ) -> Self {
        let to_segments = |values: BTreeMap<String, Value>| -> BTreeMap<String, Segment> {
            values.into_iter().map(|(k, v)| (k, Segment::from_json(v))).collect()
        };
        let mut scopes = BTreeMap::new();
        scopes.insert(SYSTEM_VARIABLE_NODE_ID.to_string(), system.into_segments());
        scopes.insert(ENVIRONMENT_VARIABLE_NODE_ID.to_string(), to_segments(environment));
        scopes.insert(CONVERSATION_VARIABLE_NODE_ID.to_string(), to_segments(conversation));
        Self { scopes }
    }

    /// Look up a value. Longer selectors descend into the stored value.
    /// Absence is not an error: the producer may simply not have run yet.
    pub fn get(&self, selector: &Selector) -> Option<Segment> {
        let value = self.scopes.get(selector.scope())?.get(selector.name())?;
        value.get_path(selector.path())
    }

    pub fn contains(&self, selector: &Selector) -> bool {
        self.get(selector).is_some()
    }

    /// Store a value under the selector's `(scope, name)`.
    ///
    /// Returns `false` (and keeps the existing value) when the selector
    /// targets the read-only environment scope.
    pub fn add(&mut self, selector: &Selector, value: Segment) -> bool {
        if selector.is_environment() {
            debug!(selector = %selector, "Ignoring write to environment variable");
            return false;
        }
        self.scopes
            .entry(selector.scope().to_string())
            .or_default()
            .insert(selector.name().to_string(), value);
        true
    }

    /// All variables of one scope.
    pub fn get_by_prefix(&self, scope: &str) -> BTreeMap<String, Segment> {
        self.scopes.get(scope).cloned().unwrap_or_default()
    }

    pub fn remove(&mut self, selector: &Selector) -> Option<Segment> {
        self.scopes.get_mut(selector.scope())?.remove(selector.name())
    }

    pub fn remove_scope(&mut self, scope: &str) {
        if scope != ENVIRONMENT_VARIABLE_NODE_ID {
            self.scopes.remove(scope);
        }
    }

    /// Replace a node scope wholesale with that node's outputs.
    ///
    /// Returns `false` and leaves the pool unchanged for the reserved
    /// `sys`, `env` and `conversation` scopes; those are only written
    /// variable by variable.
    pub fn set_scope(&mut self, scope: &str, values: BTreeMap<String, Segment>) -> bool {
        if is_reserved_scope(scope) {
            debug!(scope, "Ignoring wholesale write to reserved scope");
            return false;
        }
        self.scopes.insert(scope.to_string(), values);
        true
    }

    /// Immutable input set for one node: only the selectors it declared,
    /// only those currently resolvable.
    pub fn snapshot(&self, selectors: &[Selector]) -> NodeInputs {
        selectors
            .iter()
            .filter_map(|sel| self.get(sel).map(|v| (sel.clone(), v)))
            .collect()
    }

    pub fn scope_ids(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }
}
