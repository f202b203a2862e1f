//! Datasource identity, resolution and per-datasource hooks

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::models::{DataSourceRef, Query};

/// A configured datasource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstance {
    /// Legacy numeric id
    pub id: i64,
    pub uid: String,
    pub name: String,
    /// Plugin type (e.g. "prometheus")
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub is_default: bool,
}

impl DataSourceInstance {
    pub fn new(
        id: i64,
        uid: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            uid: uid.into(),
            name: name.into(),
            type_name: type_name.into(),
            is_default: false,
        }
    }

    /// Reference stamped onto queries resolved to this datasource
    pub fn to_ref(&self) -> DataSourceRef {
        DataSourceRef::new(self.type_name.clone(), self.uid.clone())
    }
}

/// Resolves datasource references to configured instances
pub trait DataSourceResolver: Send + Sync {
    /// Find the instance `reference` points at
    fn resolve(&self, reference: &DataSourceRef) -> Option<DataSourceInstance>;
}

/// In-memory datasource registry
///
/// Resolves by uid, then legacy name (or stringified numeric id), then, for
/// type-only references, the default instance of that type (or the one with
/// the lowest id).
#[derive(Debug, Default)]
pub struct DataSourceRegistry {
    by_uid: RwLock<HashMap<String, DataSourceInstance>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of instances
    pub fn from_instances(instances: impl IntoIterator<Item = DataSourceInstance>) -> Self {
        let registry = Self::new();
        for instance in instances {
            registry.register(instance);
        }
        registry
    }

    pub fn register(&self, instance: DataSourceInstance) {
        info!(
            uid = %instance.uid,
            name = %instance.name,
            ds_type = %instance.type_name,
            "Registering datasource"
        );
        self.by_uid.write().insert(instance.uid.clone(), instance);
    }

    pub fn unregister(&self, uid: &str) -> Option<DataSourceInstance> {
        self.by_uid.write().remove(uid)
    }

    pub fn get(&self, uid: &str) -> Option<DataSourceInstance> {
        self.by_uid.read().get(uid).cloned()
    }

    /// All instances, ordered by id
    pub fn list(&self) -> Vec<DataSourceInstance> {
        let mut all: Vec<_> = self.by_uid.read().values().cloned().collect();
        all.sort_by_key(|ds| ds.id);
        all
    }

    /// The instance flagged as default, if any
    pub fn default_instance(&self) -> Option<DataSourceInstance> {
        self.list().into_iter().find(|ds| ds.is_default)
    }

    pub fn len(&self) -> usize {
        self.by_uid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.read().is_empty()
    }
}

impl DataSourceResolver for DataSourceRegistry {
    fn resolve(&self, reference: &DataSourceRef) -> Option<DataSourceInstance> {
        if let Some(uid) = &reference.uid {
            return self.get(uid);
        }

        let all = self.list();
        if let Some(name) = &reference.name {
            return all
                .into_iter()
                .find(|ds| &ds.name == name || &ds.uid == name || ds.id.to_string() == *name);
        }

        let type_name = reference.type_name.as_ref()?;
        let mut of_type = all.into_iter().filter(|ds| &ds.type_name == type_name);
        let first = of_type.next()?;
        if first.is_default {
            return Some(first);
        }
        Some(of_type.find(|ds| ds.is_default).unwrap_or(first))
    }
}

/// Query predicate: `false` drops the query before any network call
pub type QueryFilter = Arc<dyn Fn(&Query) -> bool + Send + Sync>;

/// Query rewrite applied before sending (template interpolation and the like)
pub type TemplateHook = Arc<dyn Fn(Query, &HashMap<String, Value>) -> Query + Send + Sync>;

/// Optional capabilities a datasource can provide to the dispatcher
///
/// The dispatcher checks for each hook and only calls the ones present.
#[derive(Clone, Default)]
pub struct DataSourceHooks {
    pub filter_query: Option<QueryFilter>,
    pub apply_template_variables: Option<TemplateHook>,
}

impl DataSourceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.filter_query = Some(Arc::new(filter));
        self
    }

    pub fn with_template_variables(
        mut self,
        hook: impl Fn(Query, &HashMap<String, Value>) -> Query + Send + Sync + 'static,
    ) -> Self {
        self.apply_template_variables = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for DataSourceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceHooks")
            .field("filter_query", &self.filter_query.is_some())
            .field("apply_template_variables", &self.apply_template_variables.is_some())
            .finish()
    }
}
