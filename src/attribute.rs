//! Attribute value model.
//!
//! An [`Attributes`] set is the unit every other component in this crate
//! operates on: it is what gets fingerprinted into a [`crate::signature`],
//! looked up in the [`crate::check_cache`], and folded into a
//! [`crate::report`] batch. Attribute sets are value objects: cheap to
//! clone, never mutated after construction.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// A single typed attribute value.
///
/// Mirrors the type-segregated value kinds of the wire protocol: string,
/// bytes, int64, double, bool, timestamp, duration, and string-map.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bytes(Vec<u8>),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Timestamp(SystemTime),
    Duration(Duration),
    StringMap(BTreeMap<String, String>),
}

impl Value {
    /// Canonical bytes fed into the signature hasher for this value's type.
    ///
    /// String-map values are handled specially by the caller (only the
    /// subkey named by a template's exact-key is hashed), so this method
    /// is not called for `Value::StringMap`.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Int64(i) => i.to_le_bytes().to_vec(),
            Value::Double(d) => d.to_le_bytes().to_vec(),
            Value::Bool(b) => vec![*b as u8],
            Value::Timestamp(t) => {
                let dur = t
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                dur.as_nanos().to_le_bytes().to_vec()
            }
            Value::Duration(d) => d.as_nanos().to_le_bytes().to_vec(),
            Value::StringMap(_) => Vec::new(),
        }
    }
}

/// A named, typed attribute set.
///
/// Names are unique within a set; iteration order is irrelevant, so this
/// is backed by a [`BTreeMap`] rather than preserving insertion order (the
/// teacher's own `RequestKey`/`MultiRequestKey` types are likewise ordered
/// maps/enums rather than insertion-ordered vectors).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    values: BTreeMap<String, Value>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Look up a specific subkey of a string-map attribute. Returns `None`
    /// both when the attribute is absent and when it is present but not a
    /// string-map, or the subkey itself is absent.
    pub fn get_map_value(&self, name: &str, subkey: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Value::StringMap(map)) => map.get(subkey).map(String::as_str),
            _ => None,
        }
    }

    /// Whether a string-map attribute carries the given subkey at all.
    pub fn map_key_present(&self, name: &str, subkey: &str) -> bool {
        self.get_map_value(name, subkey).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Attribute name used to carry the per-quota requested amount; excluded
    /// from quota cache keying.
    pub const QUOTA_AMOUNT: &'static str = "quota.amount";
    /// Attribute name used to carry the target quota name.
    pub const QUOTA_NAME: &'static str = "quota.name";

    /// A copy of this attribute set with `quota.amount` removed, used when
    /// deriving the [`crate::quota::cache::QuotaCache`] signature.
    pub fn without_quota_amount(&self) -> Attributes {
        let mut values = self.values.clone();
        values.remove(Self::QUOTA_AMOUNT);
        Attributes { values }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut attrs = Attributes::new();
        attrs.insert("source.ip", Value::String("10.0.0.1".into()));
        assert_eq!(
            attrs.get("source.ip"),
            Some(&Value::String("10.0.0.1".into()))
        );
        assert!(!attrs.contains("missing"));
    }

    #[test]
    fn string_map_subkey_lookup() {
        let mut map = BTreeMap::new();
        map.insert("k1".to_string(), "v1".to_string());
        let mut attrs = Attributes::new();
        attrs.insert("request.headers", Value::StringMap(map));
        assert_eq!(attrs.get_map_value("request.headers", "k1"), Some("v1"));
        assert_eq!(attrs.get_map_value("request.headers", "missing"), None);
        assert_eq!(attrs.get_map_value("not.present", "k1"), None);
    }

    #[test]
    fn without_quota_amount_strips_only_that_key() {
        let mut attrs = Attributes::new();
        attrs.insert(Attributes::QUOTA_AMOUNT, Value::Int64(5));
        attrs.insert(Attributes::QUOTA_NAME, Value::String("rq".into()));
        let stripped = attrs.without_quota_amount();
        assert!(!stripped.contains(Attributes::QUOTA_AMOUNT));
        assert!(stripped.contains(Attributes::QUOTA_NAME));
    }
}
