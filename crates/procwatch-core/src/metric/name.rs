//! Metric names with metadata.

use std::collections::BTreeMap;
use std::fmt;

/// An identifier for a metric plus optional metadata.
///
/// By convention the name ends in the metric type (`requests_count`,
/// `disk_latency_gauge`). Metadata groups similar metrics to help locate the
/// source of a problem. Names render as `name[k=v ... @annotation ...]` with
/// keys and annotations in sorted order; an entry with an empty value is
/// treated as an annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    name: String,
    metadata: BTreeMap<String, String>,
}

impl Name {
    /// Create a name with optional metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, metadata: Option<BTreeMap<String, String>>) -> Self {
        Self {
            name: name.into(),
            metadata: metadata.unwrap_or_default(),
        }
    }

    /// Upsert metadata entries.
    pub fn add_metadata<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.metadata.insert(k.into(), v.into());
        }
    }

    /// Add annotations (metadata keys with no value, rendered as `@key`).
    pub fn add_annotations<K: Into<String>>(&mut self, keys: impl IntoIterator<Item = K>) {
        for k in keys {
            self.metadata.insert(k.into(), String::new());
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.metadata.is_empty() {
            return Ok(());
        }

        let mut parts: Vec<String> = self
            .metadata
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.extend(
            self.metadata
                .iter()
                .filter(|(_, v)| v.is_empty())
                .map(|(k, _)| format!("@{k}")),
        );
        write!(f, "[{}]", parts.join(" "))
    }
}
