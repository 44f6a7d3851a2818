//! Fingerprint-keyed Check cache.
//!
//! Keyed by `(template_hash, signature)`: a bounded LRU of live decisions
//! plus a single-flight table so concurrent misses against the same key
//! share one outstanding RPC, modeled as a map from signature to a waiter
//! list protected by the cache mutex.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::attribute::Attributes;
use crate::config::CheckOptions;
use crate::error::{Error, Result};
use crate::signature::{Referenced, Signature, TemplateHash};

type CacheKey = (TemplateHash, Signature);

/// A decision to be cached, as learned from a server Check response.
#[derive(Debug, Clone)]
pub struct CacheDecision {
    pub status: Result<()>,
    pub valid_duration: Duration,
    pub valid_use_count: u32,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    status: Result<()>,
    remaining_uses: u32,
    expiry: Instant,
}

impl CachedResponse {
    fn is_live(&self, now: Instant) -> bool {
        self.remaining_uses > 0 && now < self.expiry
    }
}

/// Result of a synchronous [`CheckCache::lookup`].
pub enum CheckLookup {
    /// A live, unexpired entry answered the request locally.
    Hit(Result<()>),
    /// No entry exists, but another caller's RPC for the same key is
    /// already in flight; await `wait()` for its outcome.
    Pending(Waiter),
    /// No entry exists and no RPC is in flight for this key (or no key
    /// could be computed at all, e.g. cold start). The caller is the
    /// single-flight leader and must issue the network Check and call
    /// [`CheckCache::cache_response`].
    Miss(Option<CacheKey>),
}

/// A follower's handle on an in-flight leader's result.
pub struct Waiter {
    rx: oneshot::Receiver<Result<()>>,
}

impl Waiter {
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::unavailable("check cache leader vanished")))
    }
}

struct Inner {
    templates: Vec<Referenced>,
    entries: Option<LruCache<CacheKey, CachedResponse>>,
    inflight: std::collections::HashMap<CacheKey, Vec<oneshot::Sender<Result<()>>>>,
}

pub struct CheckCache {
    inner: Mutex<Inner>,
}

impl CheckCache {
    pub fn new(options: &CheckOptions) -> Self {
        let entries = NonZeroUsize::new(options.num_entries).map(LruCache::new);
        Self {
            inner: Mutex::new(Inner {
                templates: Vec::new(),
                entries,
                inflight: std::collections::HashMap::new(),
            }),
        }
    }

    /// Try to answer `attrs` locally. See [`CheckLookup`] for the three
    /// possible outcomes.
    pub fn lookup(&self, attrs: &Attributes) -> CheckLookup {
        let mut inner = self.inner.lock();
        if inner.entries.is_none() {
            return CheckLookup::Miss(None);
        }

        let now = Instant::now();
        let mut candidate: Option<CacheKey> = None;
        for template in inner.templates.clone() {
            let Some(signature) = template.signature(attrs, "") else {
                continue;
            };
            let key = (template.hash(), signature);
            if candidate.is_none() {
                candidate = Some(key);
            }
            if let Some(entries) = inner.entries.as_mut() {
                if let Some(entry) = entries.get_mut(&key) {
                    if entry.is_live(now) {
                        entry.remaining_uses -= 1;
                        tracing::trace!(?key, "check cache hit");
                        return CheckLookup::Hit(entry.status.clone());
                    }
                }
            }
        }

        tracing::debug!(?candidate, "check cache miss");
        match candidate {
            Some(key) => {
                if let Some(waiters) = inner.inflight.get_mut(&key) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    CheckLookup::Pending(Waiter { rx })
                } else {
                    inner.inflight.insert(key, Vec::new());
                    CheckLookup::Miss(Some(key))
                }
            }
            None => CheckLookup::Miss(None),
        }
    }

    /// Learn the Referenced template from a server response (if any),
    /// compute the final signature, insert the decision, and fan it out to
    /// any followers registered under `miss_key`.
    ///
    /// `miss_key` must be the value returned by the [`CheckLookup::Miss`]
    /// that prompted this RPC, so followers that registered against it are
    /// correctly notified even when the response turns out not cacheable.
    pub fn cache_response(
        &self,
        attrs: &Attributes,
        miss_key: Option<CacheKey>,
        referenced: Option<Referenced>,
        decision: CacheDecision,
    ) {
        let mut inner = self.inner.lock();

        let store_key = referenced.as_ref().and_then(|template| {
            if template.has_regex() {
                return None;
            }
            let signature = template.signature(attrs, "")?;
            Some((template.hash(), signature))
        });

        if let Some(template) = referenced {
            if !template.has_regex()
                && !inner.templates.iter().any(|t| t.hash() == template.hash())
            {
                inner.templates.push(template);
            }
        }

        if let (Some(key), Some(entries)) = (store_key, inner.entries.as_mut()) {
            let now = Instant::now();
            let new_expiry = now + decision.valid_duration;
            let should_insert = match entries.peek(&key) {
                Some(existing) => new_expiry >= existing.expiry,
                None => true,
            };
            if should_insert {
                entries.put(
                    key,
                    CachedResponse {
                        status: decision.status.clone(),
                        remaining_uses: decision.valid_use_count,
                        expiry: new_expiry,
                    },
                );
            }
        }

        let notify_key = miss_key.or(store_key);
        if let Some(key) = notify_key {
            if let Some(waiters) = inner.inflight.remove(&key) {
                for tx in waiters {
                    let _ = tx.send(decision.status.clone());
                }
            }
        }
    }

    /// Fail every follower waiting on `miss_key` (e.g. the leader's RPC
    /// itself failed rather than completed).
    pub fn fail_pending(&self, miss_key: Option<CacheKey>, error: Error) {
        let Some(key) = miss_key else { return };
        let mut inner = self.inner.lock();
        if let Some(waiters) = inner.inflight.remove(&key) {
            for tx in waiters {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Remove all expired entries. Intended to be called opportunistically
    /// or from a background sweep.
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.entries.as_mut() else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, v)| !v.is_live(now))
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    /// Empty the cache entirely.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.entries.as_mut() {
            entries.clear();
        }
        inner.templates.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attribute::Value;
    use crate::signature::{Condition, Key};

    fn attrs_with(key: &str, v: &str) -> Attributes {
        let mut a = Attributes::new();
        a.insert(key, Value::String(v.to_string()));
        a
    }

    #[test]
    fn cold_miss_then_cache_then_hit() {
        let cache = CheckCache::new(&CheckOptions {
            num_entries: 4,
            ..Default::default()
        });
        let attrs = attrs_with("key", "v");

        let key = match cache.lookup(&attrs) {
            CheckLookup::Miss(k) => k,
            _ => panic!("expected miss on cold cache"),
        };
        assert!(key.is_none(), "no template known yet");

        let template = Referenced::from_matches([(Key::Scalar("key".into()), Condition::Exact)]);
        cache.cache_response(
            &attrs,
            key,
            Some(template),
            CacheDecision {
                status: Ok(()),
                valid_duration: Duration::from_secs(60),
                valid_use_count: 5,
            },
        );

        match cache.lookup(&attrs) {
            CheckLookup::Hit(status) => assert!(status.is_ok()),
            _ => panic!("expected hit after caching"),
        }
    }

    #[test]
    fn valid_use_count_is_exhausted() {
        let cache = CheckCache::new(&CheckOptions {
            num_entries: 4,
            ..Default::default()
        });
        let attrs = attrs_with("key", "v");
        let template = Referenced::from_matches([(Key::Scalar("key".into()), Condition::Exact)]);
        cache.cache_response(
            &attrs,
            None,
            Some(template),
            CacheDecision {
                status: Ok(()),
                valid_duration: Duration::from_secs(60),
                valid_use_count: 1,
            },
        );

        assert!(matches!(cache.lookup(&attrs), CheckLookup::Hit(_)));
        // second lookup: the single use was already consumed
        match cache.lookup(&attrs) {
            CheckLookup::Miss(_) | CheckLookup::Pending(_) => {}
            CheckLookup::Hit(_) => panic!("valid_use_count should have been exhausted"),
        }
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = CheckCache::new(&CheckOptions {
            num_entries: 0,
            ..Default::default()
        });
        let attrs = attrs_with("key", "v");
        assert!(matches!(cache.lookup(&attrs), CheckLookup::Miss(None)));
    }

    #[tokio::test]
    async fn concurrent_miss_coalesces_into_single_flight() {
        let cache = std::sync::Arc::new(CheckCache::new(&CheckOptions {
            num_entries: 4,
            ..Default::default()
        }));
        let attrs = attrs_with("key", "v");
        let template = Referenced::from_matches([(Key::Scalar("key".into()), Condition::Exact)]);

        // Prime the cache with a known template (but no live entry) so a
        // stable key is computable before the first RPC even completes.
        cache.cache_response(
            &attrs,
            None,
            Some(template.clone()),
            CacheDecision {
                status: Ok(()),
                valid_duration: Duration::from_millis(0),
                valid_use_count: 0,
            },
        );

        let leader_key = match cache.lookup(&attrs) {
            CheckLookup::Miss(Some(k)) => k,
            _ => panic!("expected leader miss, got a different outcome"),
        };

        let follower = match cache.lookup(&attrs) {
            CheckLookup::Pending(w) => w,
            _ => panic!("expected follower to coalesce onto the in-flight leader"),
        };

        cache.cache_response(
            &attrs,
            Some(leader_key),
            Some(template),
            CacheDecision {
                status: Ok(()),
                valid_duration: Duration::from_secs(60),
                valid_use_count: 5,
            },
        );

        assert!(follower.wait().await.is_ok());
    }
}
