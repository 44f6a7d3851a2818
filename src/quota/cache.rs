//! Dispatches per-request quota requirements to the correct
//! [`QuotaPrefetch`] instance.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::attribute::Attributes;
use crate::config::QuotaOptions;
use crate::signature::{hash_attributes_with_extra, Signature};
use crate::transport::{QuotaRequest, Transport};

use super::{AllocFn, BoxFuture, QuotaPrefetch};

/// Outcome of evaluating a single named quota against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    /// Granted locally.
    Passed,
    /// Rejected locally (no predictive layer warranted an optimistic grant).
    Rejected,
    /// No predictive cache is configured (`num_entries == 0`); the decision
    /// must defer to the server's `CheckResponse.quotas` map.
    Pending,
}

/// Aggregate decision across every quota named on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Ok,
    Pending(Vec<String>),
    Rejected(Vec<String>),
}

/// One (quota name, requested amount) pair extracted from configuration for
/// a single request.
#[derive(Debug, Clone)]
pub struct QuotaDemand {
    pub name: String,
    pub amount: i64,
}

struct Entry {
    prefetch: Arc<QuotaPrefetch>,
}

/// Bounded LRU of [`QuotaPrefetch`] instances, keyed by a signature over
/// (attributes minus `quota.amount`, quota name).
pub struct QuotaCache {
    options: QuotaOptions,
    transport: Arc<dyn Transport>,
    entries: Option<Mutex<LruCache<Signature, Entry>>>,
}

impl QuotaCache {
    pub fn new(options: QuotaOptions, transport: Arc<dyn Transport>) -> Self {
        let entries = NonZeroUsize::new(options.num_entries).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            options,
            transport,
            entries,
        }
    }

    /// Evaluate every demand in `demands` against `attrs`, returning the
    /// per-quota states plus the aggregate decision.
    pub fn evaluate(
        &self,
        attrs: &Attributes,
        demands: &[QuotaDemand],
    ) -> (Vec<(String, QuotaState)>, Aggregate) {
        let keyed_attrs = attrs.without_quota_amount();
        let now = Instant::now();

        let mut results = Vec::with_capacity(demands.len());
        for demand in demands {
            let state = self.check_one(&keyed_attrs, demand, now);
            results.push((demand.name.clone(), state));
        }

        let rejected: Vec<String> = results
            .iter()
            .filter(|(_, s)| *s == QuotaState::Rejected)
            .map(|(n, _)| n.clone())
            .collect();
        let pending: Vec<String> = results
            .iter()
            .filter(|(_, s)| *s == QuotaState::Pending)
            .map(|(n, _)| n.clone())
            .collect();

        let aggregate = if !rejected.is_empty() {
            Aggregate::Rejected(rejected)
        } else if !pending.is_empty() {
            Aggregate::Pending(pending)
        } else {
            Aggregate::Ok
        };

        (results, aggregate)
    }

    fn check_one(&self, keyed_attrs: &Attributes, demand: &QuotaDemand, now: Instant) -> QuotaState {
        let Some(entries) = &self.entries else {
            return QuotaState::Pending;
        };

        let signature = hash_attributes_with_extra(keyed_attrs, &demand.name);

        let prefetch = {
            let mut cache = entries.lock();
            if let Some(entry) = cache.get(&signature) {
                entry.prefetch.clone()
            } else {
                let prefetch = QuotaPrefetch::new(
                    self.options.clone(),
                    self.alloc_fn(keyed_attrs.clone(), demand.name.clone()),
                );
                cache.put(signature, Entry { prefetch: prefetch.clone() });
                prefetch
            }
        };

        if prefetch.check(demand.amount, now) {
            QuotaState::Passed
        } else {
            QuotaState::Rejected
        }
    }

    fn alloc_fn(&self, attrs: Attributes, quota_name: String) -> AllocFn {
        let transport = self.transport.clone();
        Arc::new(move |amount: i64| -> BoxFuture<Option<(i64, Duration)>> {
            let transport = transport.clone();
            let attrs = attrs.clone();
            let quota_name = quota_name.clone();
            Box::pin(async move {
                let request = QuotaRequest {
                    quota: quota_name,
                    amount,
                    best_effort: true,
                    attributes: crate::transport::AttributesMsg::default(),
                };
                let _ = &attrs; // attribute encoding is the embedder's concern (non-goal)
                match transport.quota(request).await {
                    Ok(resp) => Some((resp.granted_amount, resp.valid_duration)),
                    Err(err) => {
                        tracing::warn!(?err, "quota alloc transport failure, failing open");
                        None
                    }
                }
            })
        })
    }

    /// Empty the cache, dropping all per-class prefetch state.
    pub fn flush_all(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }
}
