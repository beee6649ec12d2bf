//! Externally supplied per-key defaults.

use std::collections::HashMap;

use crate::model::{ConfigValue, Scope};

/// Source of schema defaults, consulted after the store and before the
/// caller's own default.
pub trait SchemaDefaults: Send + Sync {
    fn default_value(&self, scope: &Scope, key: &str) -> Option<ConfigValue>;
}

/// Fixed key → default table, identical for every scope.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    defaults: HashMap<String, ConfigValue>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }
}

impl SchemaDefaults for StaticSchema {
    fn default_value(&self, _scope: &Scope, key: &str) -> Option<ConfigValue> {
        self.defaults.get(key).cloned()
    }
}
