//! Generic record container.

use crate::{TypesError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered map of field name to [`Value`].
///
/// Records carry no static shape; callers validate them against an entity
/// definition at every component boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builds a record from a JSON object. Any other JSON shape is rejected.
    pub fn from_json(json: serde_json::Value) -> Result<Self, TypesError> {
        match Value::from_json(json) {
            Value::Object(record) => Ok(record),
            other => Err(TypesError::NotAnObject(other.type_name())),
        }
    }

    /// Parses a record from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self, TypesError> {
        let json: serde_json::Value = serde_json::from_str(s)?;
        Self::from_json(json)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Looks up a dot-separated path (e.g. `customer.address.city`) through
    /// nested objects.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Overwrites this record's fields with every field of `other`.
    pub fn merge(&mut self, other: &Record) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Returns a copy of this record holding only the named fields.
    pub fn project<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Record {
        fields
            .into_iter()
            .filter_map(|f| self.0.get(f).map(|v| (f.to_string(), v.clone())))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
