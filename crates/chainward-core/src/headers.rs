//! Ordered, multi-valued header map.
//!
//! Names are stored lowercased so lookups are case-insensitive; insertion
//! order is preserved across names and across values of the same name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw pairs (names are normalised).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        Self { entries }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single value.
    ///
    /// The new value takes the position of the first existing value so a
    /// rewrite does not reorder the header block.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == name) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = 0;
                self.entries.retain(|(k, _)| {
                    let keep = idx <= pos || *k != name;
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Add a value to `name` unless that exact value is already present.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        if self.entries.iter().any(|(k, v)| *k == name && *v == value) {
            return;
        }
        self.entries.push((name, value));
    }

    /// Remove every value of `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != name);
        before != self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Distinct names, first-seen order.
    pub fn names(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (k, _) in &self.entries {
            if !out.contains(&k.as_str()) {
                out.push(k.as_str());
            }
        }
        out
    }

    /// Expression-language view: name -> first value (pseudo-headers excluded).
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.entries {
            if k.starts_with(':') {
                continue;
            }
            map.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
        }
        Value::Object(map)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Headers::from_pairs(iter)
    }
}
