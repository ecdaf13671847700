//! Namespace-qualified table names.

use serde::{Deserialize, Serialize};

/// A table name with its namespace (schema). Namespaces are
/// first-class: everything the engine touches is qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTablename {
    pub namespace: String,
    pub tablename: String,
}

impl QualifiedTablename {
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }
}

impl std::fmt::Display for QualifiedTablename {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.tablename)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        let qt = QualifiedTablename::new("main", "parent");
        assert_eq!(qt.to_string(), "main.parent");
    }
}
