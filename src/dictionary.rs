//! Name dictionary and wire-index encoding.
//!
//! The wire protocol encodes attribute *names* as small integers. A
//! process-constant [`GLOBAL_WORDS`] table is identical at both peers; a
//! per-message word list accompanies any message that introduces names
//! outside it. A non-negative index refers to `GLOBAL_WORDS`; a negative
//! index `j` refers to per-message word `-(j+1)`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Error;

/// The fixed, compiled-in vocabulary shared by both peers. Order is part of
/// the wire contract: never reorder or remove an entry, only append.
pub const GLOBAL_WORDS: &[&str] = &[
    "request.time",
    "request.path",
    "request.method",
    "request.headers",
    "source.ip",
    "source.service",
    "destination.ip",
    "destination.service",
    "response.code",
    "response.time",
    "context.protocol",
    "check.cache_hit",
    "quota.name",
    "quota.amount",
];

/// Resolve a wire index against the global table and an optional per-message
/// word list, validating bounds.
pub fn resolve_index(index: i32, message_words: &[String]) -> Result<String, Error> {
    if index >= 0 {
        GLOBAL_WORDS
            .get(index as usize)
            .map(|s| s.to_string())
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "global word index {index} out of range (len {})",
                    GLOBAL_WORDS.len()
                ))
            })
    } else {
        let local = (-index - 1) as usize;
        message_words.get(local).cloned().ok_or_else(|| {
            Error::invalid_argument(format!(
                "per-message word index {local} out of range (len {})",
                message_words.len()
            ))
        })
    }
}

/// A process-wide, append-only mapping from attribute name to a positive
/// integer index, scoped to the lifetime of one [`crate::Client`].
///
/// Once an index is assigned to a name it is never reused for another name
/// — except across a [`Dictionary::reset`], which bumps [`Dictionary::epoch`]
/// so that anything holding indices resolved under the old epoch (e.g. a
/// buffered [`crate::report::ReportBatch`]) can detect the break instead of
/// silently reinterpreting a stale index under the new mapping.
#[derive(Debug)]
pub struct Dictionary {
    inner: Mutex<DictionaryInner>,
    epoch: AtomicU64,
}

#[derive(Debug, Default)]
struct DictionaryInner {
    name_to_index: HashMap<String, i32>,
    words: Vec<String>,
    /// Local (negative-indexed) words assigned but not yet included in any
    /// outgoing message's `dictionary` field.
    unshipped: HashSet<i32>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    pub fn new() -> Self {
        let global = GLOBAL_WORDS
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as i32))
            .collect();
        Self {
            inner: Mutex::new(DictionaryInner {
                name_to_index: global,
                words: Vec::new(),
                unshipped: HashSet::new(),
            }),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current dictionary epoch, bumped by every [`Dictionary::reset`].
    /// Anything that caches a resolved index across an `await` point should
    /// snapshot this alongside it and re-resolve if the epoch has moved on.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Resolve `name`'s wire index for inclusion in an outgoing message. If
    /// this is the first message to reference it, the name is also
    /// returned so the caller can add it to that message's `dictionary`
    /// field — every later message resolving the same name gets `None`,
    /// since both peers already agree on the index by then.
    pub fn index_for_message(&self, name: &str) -> (i32, Option<String>) {
        let mut inner = self.inner.lock();
        let index = match inner.name_to_index.get(name) {
            Some(idx) => *idx,
            None => {
                let local = inner.words.len() as i32;
                inner.words.push(name.to_string());
                let index = -(local + 1);
                inner.name_to_index.insert(name.to_string(), index);
                inner.unshipped.insert(index);
                index
            }
        };
        if inner.unshipped.remove(&index) {
            (index, Some(name.to_string()))
        } else {
            (index, None)
        }
    }

    /// Reset the per-client incremental dictionary back to just the global
    /// words, e.g. after rotating to a fresh stream. Bumps [`Dictionary::epoch`]
    /// so any already-encoded message referencing a now-reassigned local
    /// index is recognizable as stale.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.words.clear();
        inner.unshipped.clear();
        inner.name_to_index = GLOBAL_WORDS
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as i32))
            .collect();
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}
