//! Work keys.
//!
//! A `Key` は reconcile 対象リソース 1 つを指す不透明な識別子。
//! 比較とハッシュだけが意味を持ち、順序には意味がない。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque identifier for one reconcilable resource (e.g. `"namespace/name"`).
///
/// Cloning is cheap: the text is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref()))
    }

    /// Build the conventional `namespace/name` key.
    ///
    /// Cluster-scoped objects (empty namespace) are keyed by name alone.
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self::new(name)
        } else {
            Self::new(format!("{namespace}/{name}"))
        }
    }

    /// Split into `(namespace, name)`. The namespace is empty for keys without a `/`.
    pub fn split(&self) -> (&str, &str) {
        match self.0.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => ("", &self.0),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Key::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("garden", "ev-1", "garden/ev-1")]
    #[case("", "cluster-wide", "cluster-wide")]
    fn namespaced_key_format(#[case] ns: &str, #[case] name: &str, #[case] expected: &str) {
        assert_eq!(Key::namespaced(ns, name).as_str(), expected);
    }

    #[rstest]
    #[case("garden/ev-1", ("garden", "ev-1"))]
    #[case("cluster-wide", ("", "cluster-wide"))]
    fn split_recovers_parts(#[case] key: &str, #[case] expected: (&str, &str)) {
        assert_eq!(Key::new(key).split(), expected);
    }

    #[test]
    fn clones_compare_equal() {
        let a = Key::from("ns/a");
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"ns/a\"");
    }
}
