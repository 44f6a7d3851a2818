//! The `Client` façade.
//!
//! Composes [`CheckCache`], [`QuotaCache`], [`ReportBatch`], and the name
//! [`Dictionary`] behind a single async entry point per RPC. `Check`
//! replaces the original's `done_fn` continuation with a plain `async fn`:
//! a cache hit resolves the returned future immediately, a miss or
//! single-flight follower resolves it once the transport or the leader
//! completes — the caller cannot tell which path was taken from the type
//! alone.

use std::sync::Arc;

use crate::attribute::Attributes;
use crate::check_cache::{CacheDecision, CheckCache, CheckLookup};
use crate::config::ClientOptions;
use crate::dictionary::{resolve_index, Dictionary};
use crate::error::{Error, Result};
use crate::quota::cache::{Aggregate, QuotaCache, QuotaDemand};
use crate::report::ReportBatch;
use crate::signature::{Condition, Key, Referenced};
use crate::transport::{
    AttributesMsg, CheckRequest, CheckResponse, MatchCondition, QuotaParams, QuotaRequest, Transport,
};

/// Client-side sidecar mediating Check, Quota, and Report against a single
/// Mixer-protocol server.
pub struct Client {
    check_cache: CheckCache,
    quota_cache: QuotaCache,
    report_batch: ReportBatch,
    dictionary: Arc<Dictionary>,
    transport: Arc<dyn Transport>,
    network_fail_open: bool,
    default_expiration_ms: u64,
}

impl Client {
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        let dictionary = Arc::new(Dictionary::new());
        let network_fail_open = options.check.network_fail_open;
        let default_expiration_ms = options.check.expiration_ms;
        Self {
            check_cache: CheckCache::new(&options.check),
            quota_cache: QuotaCache::new(options.quota, transport.clone()),
            report_batch: ReportBatch::new(options.report, dictionary.clone(), transport.clone()),
            dictionary,
            transport,
            network_fail_open,
            default_expiration_ms,
        }
    }

    /// Evaluate a Check decision and every named quota demand against
    /// `attrs`, resolving locally where possible and falling back to the
    /// transport otherwise.
    pub async fn check(&self, attrs: &Attributes, quotas: &[QuotaDemand]) -> Result<()> {
        let (_, quota_aggregate) = self.quota_cache.evaluate(attrs, quotas);

        match self.check_cache.lookup(attrs) {
            CheckLookup::Hit(status) => self.finish(status, attrs, quotas, quota_aggregate).await,
            CheckLookup::Pending(waiter) => {
                let status = waiter.wait().await;
                self.finish(status, attrs, quotas, quota_aggregate).await
            }
            CheckLookup::Miss(miss_key) => self.issue_check(attrs, quotas, miss_key, quota_aggregate).await,
        }
    }

    /// Combine a resolved Check status with a quota aggregate that did not
    /// require a network round trip of its own (resolving any `Pending`
    /// quotas directly, since no CheckResponse is available on this path).
    async fn finish(
        &self,
        status: Result<()>,
        attrs: &Attributes,
        quotas: &[QuotaDemand],
        quota_aggregate: Aggregate,
    ) -> Result<()> {
        let rejected = match quota_aggregate {
            Aggregate::Ok => Vec::new(),
            Aggregate::Rejected(names) => names,
            Aggregate::Pending(names) => self.resolve_pending(attrs, quotas, &names).await,
        };
        status?;
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(Error::resource_exhausted(rejected))
        }
    }

    async fn issue_check(
        &self,
        attrs: &Attributes,
        quotas: &[QuotaDemand],
        miss_key: Option<(crate::signature::TemplateHash, crate::signature::Signature)>,
        quota_aggregate: Aggregate,
    ) -> Result<()> {
        let quotas_map = quotas
            .iter()
            .map(|q| (q.name.clone(), QuotaParams { amount: q.amount, best_effort: true }))
            .collect();
        let request = CheckRequest {
            attributes: AttributesMsg::encode(attrs, &self.dictionary),
            quotas: quotas_map,
        };

        match self.transport.check(request).await {
            Ok(response) => {
                let (status, valid_duration, valid_use_count) = decode_precondition(&response, self.default_expiration_ms);
                let referenced = decode_referenced(&response);

                self.check_cache.cache_response(
                    attrs,
                    miss_key,
                    referenced,
                    CacheDecision {
                        status: status.clone(),
                        valid_duration,
                        valid_use_count,
                    },
                );

                let rejected = self
                    .resolve_quota_aggregate_with_response(attrs, quotas, quota_aggregate, &response)
                    .await;

                status?;
                if rejected.is_empty() {
                    Ok(())
                } else {
                    Err(Error::resource_exhausted(rejected))
                }
            }
            Err(err) => {
                self.check_cache.fail_pending(miss_key, err.clone());
                if self.network_fail_open {
                    tracing::warn!(?err, "check transport failed, failing open");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Resolve a quota aggregate once a `CheckResponse` is already in hand:
    /// any pending quota the server happened to answer is resolved for
    /// free; anything left over still needs its own RPC.
    async fn resolve_quota_aggregate_with_response(
        &self,
        attrs: &Attributes,
        quotas: &[QuotaDemand],
        quota_aggregate: Aggregate,
        response: &CheckResponse,
    ) -> Vec<String> {
        let (mut rejected, pending) = match quota_aggregate {
            Aggregate::Ok => (Vec::new(), Vec::new()),
            Aggregate::Rejected(names) => (names, Vec::new()),
            Aggregate::Pending(names) => (Vec::new(), names),
        };

        let mut still_pending = Vec::new();
        for name in pending {
            match response.quotas.get(&name) {
                Some(result) => {
                    let demand = quotas.iter().find(|q| q.name == name);
                    let satisfied = demand.map(|d| result.granted_amount >= d.amount).unwrap_or(result.granted_amount > 0);
                    if !satisfied {
                        rejected.push(name);
                    }
                }
                None => still_pending.push(name),
            }
        }

        if !still_pending.is_empty() {
            rejected.extend(self.resolve_pending(attrs, quotas, &still_pending).await);
        }
        rejected
    }

    /// Resolve quota names with no predictive cache (or none answered by a
    /// CheckResponse) via a direct per-quota Alloc call. Transport failure
    /// fails open: a quota decision that can't reach the server grants
    /// rather than rejects.
    async fn resolve_pending(&self, attrs: &Attributes, quotas: &[QuotaDemand], names: &[String]) -> Vec<String> {
        let mut rejected = Vec::new();
        for name in names {
            let Some(demand) = quotas.iter().find(|q| &q.name == name) else {
                continue;
            };
            let request = QuotaRequest {
                quota: demand.name.clone(),
                amount: demand.amount,
                best_effort: true,
                attributes: AttributesMsg::encode(attrs, &self.dictionary),
            };
            match self.transport.quota(request).await {
                Ok(result) if result.granted_amount >= demand.amount => {}
                Ok(_) => rejected.push(name.clone()),
                Err(err) => {
                    tracing::warn!(?err, quota = %name, "quota rpc failed, failing open");
                }
            }
        }
        rejected
    }

    /// Forward `attrs` to the [`ReportBatch`]; fire-and-forget.
    pub fn report(&self, attrs: &Attributes) {
        self.report_batch.report(attrs);
    }

    /// Flush the report batch synchronously and drop all cache contents,
    /// the analogue of the original's destructor behavior.
    pub async fn shutdown(&self) {
        self.report_batch.flush().await;
        self.check_cache.flush_all();
        self.quota_cache.flush_all();
    }
}

fn decode_precondition(response: &CheckResponse, default_expiration_ms: u64) -> (Result<()>, std::time::Duration, u32) {
    match &response.precondition {
        Some(precondition) => {
            let status = if precondition.code == 0 {
                Ok(())
            } else {
                Err(Error::server(precondition.code, precondition.message.clone()))
            };
            (status, precondition.valid_duration, precondition.valid_use_count)
        }
        None => (
            Ok(()),
            std::time::Duration::from_millis(default_expiration_ms),
            1,
        ),
    }
}

fn decode_referenced(response: &CheckResponse) -> Option<Referenced> {
    let precondition = response.precondition.as_ref()?;
    let referenced_attributes = precondition.referenced_attributes.as_ref()?;
    let matches: Vec<(Key, Condition)> = referenced_attributes
        .attribute_matches
        .iter()
        .filter_map(|m| {
            let name = resolve_index(m.name, &referenced_attributes.words).ok()?;
            let key = match m.map_key {
                Some(idx) => {
                    let sub = resolve_index(idx, &referenced_attributes.words).ok()?;
                    Key::MapKey(name, sub)
                }
                None => Key::Scalar(name),
            };
            let condition = match m.condition {
                MatchCondition::Absence => Condition::Absence,
                MatchCondition::Exact => Condition::Exact,
                MatchCondition::Regex => Condition::Regex,
            };
            Some((key, condition))
        })
        .collect();
    Some(Referenced::from_matches(matches))
}
