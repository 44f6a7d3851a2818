//! Referenced templates and attribute-set signatures.
//!
//! A [`Referenced`] template is the server's declaration of which
//! attributes influenced a specific Check decision. Two templates with the
//! same sorted absence/exact key sequences share a [`Referenced::hash`]; a
//! template plus a concrete [`Attributes`] set produces a [`Signature`], a
//! 128-bit fingerprint used as the Check cache's inner key.
//!
//! Both absence and exact keys may name a subkey of a string-map attribute
//! rather than a whole scalar attribute.

use md5::{Digest, Md5};

use crate::attribute::{Attributes, Value};

/// A single key referenced by a template: either a plain scalar attribute,
/// or one subkey of a string-map attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Scalar(String),
    MapKey(String, String),
}

impl Key {
    fn name(&self) -> &str {
        match self {
            Key::Scalar(n) => n,
            Key::MapKey(n, _) => n,
        }
    }
}

/// Whether a condition on an attribute match is an absence check, an exact
/// equality check, or a (caching-suppressing) regex check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Absence,
    Exact,
    /// Suppresses caching for the whole response; no implementation here
    /// evaluates the pattern itself.
    Regex,
}

/// A server-advertised declaration of which attributes influenced a Check
/// decision: two canonically-sorted key sequences, absence and exact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Referenced {
    absence_keys: Vec<Key>,
    exact_keys: Vec<Key>,
    /// Set if any attribute match carried a `Regex` condition; such a
    /// response must be used but never cached.
    has_regex: bool,
}

const DELIMITER: &[u8] = b"\0";

impl Referenced {
    /// Build a template from a flat list of `(key, condition)` matches,
    /// canonically sorting each bucket so that two templates containing the
    /// same keys are `==` and hash identically.
    pub fn from_matches(matches: impl IntoIterator<Item = (Key, Condition)>) -> Self {
        let mut absence_keys = Vec::new();
        let mut exact_keys = Vec::new();
        let mut has_regex = false;
        for (key, condition) in matches {
            match condition {
                Condition::Absence => absence_keys.push(key),
                Condition::Exact => exact_keys.push(key),
                Condition::Regex => has_regex = true,
            }
        }
        absence_keys.sort();
        absence_keys.dedup();
        exact_keys.sort();
        exact_keys.dedup();
        Self {
            absence_keys,
            exact_keys,
            has_regex,
        }
    }

    pub fn has_regex(&self) -> bool {
        self.has_regex
    }

    pub fn is_empty(&self) -> bool {
        self.absence_keys.is_empty() && self.exact_keys.is_empty()
    }

    /// Stable identity hash: deterministic and equal for any two templates
    /// whose sorted absence/exact key sequences are equal.
    pub fn hash(&self) -> TemplateHash {
        let mut hasher = Md5::new();
        for key in &self.absence_keys {
            hasher.update(key.name().as_bytes());
            hasher.update(DELIMITER);
            if let Key::MapKey(_, sub) = key {
                hasher.update(sub.as_bytes());
                hasher.update(DELIMITER);
            }
        }
        hasher.update(b"====");
        for key in &self.exact_keys {
            hasher.update(key.name().as_bytes());
            hasher.update(DELIMITER);
            if let Key::MapKey(_, sub) = key {
                hasher.update(sub.as_bytes());
                hasher.update(DELIMITER);
            }
        }
        TemplateHash(hasher.finalize().into())
    }

    /// Compute the signature of `attributes` against this template, mixing
    /// in `extra` (used to fold the quota name into the fingerprint).
    /// Returns `None` ("not cacheable") if any absence key is violated.
    pub fn signature(&self, attributes: &Attributes, extra: &str) -> Option<Signature> {
        if self.has_regex {
            return None;
        }
        for key in &self.absence_keys {
            let violated = match key {
                Key::Scalar(name) => attributes.contains(name),
                Key::MapKey(name, sub) => attributes.map_key_present(name, sub),
            };
            if violated {
                return None;
            }
        }

        let mut hasher = Md5::new();
        for key in &self.exact_keys {
            match key {
                Key::Scalar(name) => {
                    let value = attributes.get(name)?;
                    hasher.update(name.as_bytes());
                    hasher.update(DELIMITER);
                    hash_value(&mut hasher, value);
                }
                Key::MapKey(name, sub) => {
                    let value = attributes.get_map_value(name, sub)?;
                    hasher.update(name.as_bytes());
                    hasher.update(DELIMITER);
                    hasher.update(sub.as_bytes());
                    hasher.update(DELIMITER);
                    hasher.update(value.as_bytes());
                    hasher.update(DELIMITER);
                }
            }
            hasher.update(DELIMITER);
        }
        hasher.update(extra.as_bytes());
        hasher.update(DELIMITER);

        Some(Signature(hasher.finalize().into()))
    }
}

fn hash_value(hasher: &mut Md5, value: &Value) {
    match value {
        Value::StringMap(map) => {
            for (k, v) in map {
                hasher.update(k.as_bytes());
                hasher.update(DELIMITER);
                hasher.update(v.as_bytes());
                hasher.update(DELIMITER);
            }
        }
        other => hasher.update(other.canonical_bytes()),
    }
    hasher.update(DELIMITER);
}

/// Hash every attribute in `attrs` plus `extra`, used by
/// [`crate::quota::cache::QuotaCache`] to key its per-(attributes,
/// quota-name) class signature — unlike [`Referenced::signature`], this has
/// no notion of absence/exact keys: it simply covers the whole attribute
/// set handed to it (the caller is expected to have already stripped
/// `quota.amount`).
pub fn hash_attributes_with_extra(attrs: &Attributes, extra: &str) -> Signature {
    let mut hasher = Md5::new();
    for (name, value) in attrs.iter() {
        hasher.update(name.as_bytes());
        hasher.update(DELIMITER);
        hash_value(&mut hasher, value);
    }
    hasher.update(extra.as_bytes());
    hasher.update(DELIMITER);
    Signature(hasher.finalize().into())
}

/// A stable identity hash for a [`Referenced`] template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateHash([u8; 16]);

/// A 128-bit fingerprint over an attribute set, computed through a
/// [`Referenced`] template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; 16]);

#[cfg(test)]
mod test {
    use super::*;

    fn sample_attrs() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("source.ip", Value::String("10.0.0.1".into()));
        attrs.insert("destination.service", Value::String("svc-a".into()));
        attrs
    }

    #[test]
    fn signature_is_deterministic() {
        let template = Referenced::from_matches([(
            Key::Scalar("source.ip".into()),
            Condition::Exact,
        )]);
        let attrs = sample_attrs();
        let sig1 = template.signature(&attrs, "quota-x").unwrap();
        let sig2 = template.signature(&attrs, "quota-x").unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signature_differs_by_extra_key() {
        let template = Referenced::from_matches([(
            Key::Scalar("source.ip".into()),
            Condition::Exact,
        )]);
        let attrs = sample_attrs();
        let sig1 = template.signature(&attrs, "quota-x").unwrap();
        let sig2 = template.signature(&attrs, "quota-y").unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn absence_violation_is_not_cacheable() {
        let template = Referenced::from_matches([(
            Key::Scalar("bool-key".into()),
            Condition::Absence,
        )]);
        let mut attrs = Attributes::new();
        attrs.insert("bool-key", Value::Bool(true));
        assert!(template.signature(&attrs, "").is_none());
    }

    #[test]
    fn missing_exact_key_is_not_cacheable() {
        let template = Referenced::from_matches([(
            Key::Scalar("missing.key".into()),
            Condition::Exact,
        )]);
        let attrs = sample_attrs();
        assert!(template.signature(&attrs, "").is_none());
    }

    #[test]
    fn regex_condition_suppresses_caching() {
        let template = Referenced::from_matches([(
            Key::Scalar("request.path".into()),
            Condition::Regex,
        )]);
        assert!(template.has_regex());
        let attrs = sample_attrs();
        assert!(template.signature(&attrs, "").is_none());
    }

    #[test]
    fn hash_equal_iff_same_sorted_keys() {
        let t1 = Referenced::from_matches([
            (Key::Scalar("b".into()), Condition::Exact),
            (Key::Scalar("a".into()), Condition::Exact),
        ]);
        let t2 = Referenced::from_matches([
            (Key::Scalar("a".into()), Condition::Exact),
            (Key::Scalar("b".into()), Condition::Exact),
        ]);
        assert_eq!(t1.hash(), t2.hash());

        let t3 = Referenced::from_matches([(Key::Scalar("a".into()), Condition::Exact)]);
        assert_ne!(t1.hash(), t3.hash());
    }

    #[test]
    fn map_key_signature_uses_named_subkey_only() {
        use std::collections::BTreeMap;
        let template = Referenced::from_matches([(
            Key::MapKey("request.headers".into(), "x-req-id".into()),
            Condition::Exact,
        )]);
        let mut map = BTreeMap::new();
        map.insert("x-req-id".to_string(), "abc".to_string());
        map.insert("x-other".to_string(), "zzz".to_string());
        let mut attrs = Attributes::new();
        attrs.insert("request.headers", Value::StringMap(map.clone()));

        let mut map2 = map.clone();
        map2.insert("x-other".to_string(), "different".to_string());
        let mut attrs2 = Attributes::new();
        attrs2.insert("request.headers", Value::StringMap(map2));

        assert_eq!(
            template.signature(&attrs, "").unwrap(),
            template.signature(&attrs2, "").unwrap()
        );
    }
}
