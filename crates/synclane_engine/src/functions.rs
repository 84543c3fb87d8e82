//! Client-side query and mutation definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use synclane_value::Value;

use crate::error::QueryError;
use crate::overlay::{LocalWriter, OptimisticFn};
use crate::reader::LocalDbReader;

/// A sync query: a pure function of the local mirror and its arguments.
pub type QueryFn =
    Arc<dyn Fn(&mut LocalDbReader<'_>, &Value) -> Result<Value, QueryError> + Send + Sync>;

/// Current result of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncQueryResult {
    /// Some range the query reads is not loaded yet.
    Loading,
    /// The query produced a value.
    Success(Value),
    /// The query or one of its pages failed.
    Error(String),
}

impl SyncQueryResult {
    /// Returns true while loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, SyncQueryResult::Loading)
    }

    /// The value on success.
    pub fn value(&self) -> Option<&Value> {
        match self {
            SyncQueryResult::Success(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Result<Value, QueryError>> for SyncQueryResult {
    fn from(result: Result<Value, QueryError>) -> Self {
        match result {
            Ok(value) => SyncQueryResult::Success(value),
            Err(QueryError::Loading) => SyncQueryResult::Loading,
            Err(e) => SyncQueryResult::Error(e.to_string()),
        }
    }
}

/// A named sync query.
#[derive(Clone)]
pub struct SyncQuery {
    name: String,
    func: QueryFn,
}

impl SyncQuery {
    /// Creates a sync query.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut LocalDbReader<'_>, &Value) -> Result<Value, QueryError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Query name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the query against a reader.
    pub fn run(&self, reader: &mut LocalDbReader<'_>, args: &Value) -> Result<Value, QueryError> {
        (self.func)(reader, args)
    }
}

impl fmt::Debug for SyncQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQuery").field("name", &self.name).finish()
    }
}

/// A mutation known to the client: its server name and, optionally, an
/// optimistic prediction applied locally before the server answers.
#[derive(Clone)]
pub struct MutationSpec {
    name: String,
    optimistic: Option<OptimisticFn>,
}

impl MutationSpec {
    /// A mutation with no optimistic update.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optimistic: None,
        }
    }

    /// Attaches an optimistic update.
    pub fn with_optimistic<F>(mut self, func: F) -> Self
    where
        F: Fn(&mut LocalWriter<'_>, &Value) -> Result<(), QueryError> + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(func));
        self
    }

    /// Server-side mutation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn optimistic(&self) -> Option<&OptimisticFn> {
        self.optimistic.as_ref()
    }
}

impl fmt::Debug for MutationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationSpec")
            .field("name", &self.name)
            .field("optimistic", &self.optimistic.is_some())
            .finish()
    }
}

/// Mutation specs by name, used to restore persisted mutations.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    mutations: BTreeMap<String, MutationSpec>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutation spec.
    pub fn with_mutation(mut self, spec: MutationSpec) -> Self {
        self.mutations.insert(spec.name.clone(), spec);
        self
    }

    /// Looks up a mutation spec.
    pub fn mutation(&self, name: &str) -> Option<&MutationSpec> {
        self.mutations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_errors_map_to_results() {
        assert_eq!(SyncQueryResult::from(Err(QueryError::Loading)), SyncQueryResult::Loading);
        assert_eq!(
            SyncQueryResult::from(Err(QueryError::failed("denied"))),
            SyncQueryResult::Error("denied".into())
        );
        let ok = SyncQueryResult::from(Ok(Value::Integer(1)));
        assert_eq!(ok.value(), Some(&Value::Integer(1)));
        assert!(!ok.is_loading());
    }

    #[test]
    fn registry_lookup() {
        let registry = FunctionRegistry::new()
            .with_mutation(MutationSpec::new("notes:add").with_optimistic(|_, _| Ok(())));
        let spec = registry.mutation("notes:add").unwrap();
        assert!(spec.optimistic().is_some());
        assert!(registry.mutation("notes:remove").is_none());
        assert_eq!(format!("{spec:?}"), "MutationSpec { name: \"notes:add\", optimistic: true }");
    }
}
