//! Dynamic default factories.
//!
//! A property default written as `"name()"` refers to a factory looked up
//! here. The marker is resolved exactly once, when a new instance is built.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

pub type Factory = Rc<dyn Fn() -> Value>;

/// Generate an opaque record id.
pub fn create_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Extract the factory name from a `"name()"` marker.
pub fn marker_name(raw: &str) -> Option<&str> {
    let name = raw.strip_suffix("()")?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

#[derive(Clone)]
pub struct DefaultFactories {
    factories: HashMap<String, Factory>,
}

impl DefaultFactories {
    /// Registry without any factories.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `createId`, `now` and `today`.
    pub fn builtin() -> Self {
        let mut factories = Self::empty();
        factories.register("createId", || Value::String(create_id()));
        factories.register("now", || Value::String(Utc::now().to_rfc3339()));
        factories.register("today", || {
            Value::String(Utc::now().date_naive().format("%Y-%m-%d").to_string())
        });
        factories
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl Fn() -> Value + 'static) {
        self.factories.insert(name.into(), Rc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn produce(&self, name: &str) -> Option<Value> {
        self.factories.get(name).map(|factory| factory())
    }
}

impl Default for DefaultFactories {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for DefaultFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("DefaultFactories")
            .field("factories", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_markers() {
        assert_eq!(marker_name("createId()"), Some("createId"));
        assert_eq!(marker_name("now()"), Some("now"));
        assert_eq!(marker_name("()"), None);
        assert_eq!(marker_name("folder"), None);
        assert_eq!(marker_name("a b()"), None);
    }

    #[test]
    fn builtin_factories_produce_fresh_values() {
        let factories = DefaultFactories::builtin();
        let a = factories.produce("createId").unwrap();
        let b = factories.produce("createId").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().map(str::len), Some(32));
        assert!(factories.produce("today").unwrap().as_str().unwrap().len() == 10);
        assert!(factories.produce("missing").is_none());
    }
}
