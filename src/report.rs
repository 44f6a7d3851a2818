//! Telemetry report batching.
//!
//! Coalesces many [`ReportBatch::report`] calls into infrequent RPCs: the
//! first entry in an empty batch arms a flush timer, a full batch flushes
//! immediately, and a flush is best-effort — transport failures are logged,
//! never surfaced to the caller, since Report has no return value to report
//! them through.
//!
//! Every entry in a batch carries its own per-message `dictionary` (see
//! [`crate::transport::AttributesMsg::encode`]), naming only the words it
//! introduces. That is safe to combine across entries only as long as the
//! index a given entry references still means what it meant when earlier
//! entries in the same batch were encoded — true as long as the
//! [`Dictionary`] they were all encoded against hasn't been reset in
//! between. Each batch is stamped with the dictionary's
//! [`Dictionary::epoch`] at creation; an entry encoded under a later epoch
//! forces the in-progress batch to flush first, exactly as the original's
//! `batch_converter_->Add()` returning `false` forced a flush before a
//! conflicting attribute set could be folded in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attribute::Attributes;
use crate::config::ReportOptions;
use crate::dictionary::Dictionary;
use crate::transport::{AttributesMsg, ReportRequest, Transport};

struct Batch {
    entries: Vec<AttributesMsg>,
    generation: u64,
    /// [`Dictionary::epoch`] snapshotted when this batch's first entry was
    /// encoded; a later entry encoded under a different epoch cannot share
    /// this batch's dictionary namespace.
    dictionary_epoch: u64,
}

struct Inner {
    batch: Mutex<Option<Batch>>,
    next_generation: AtomicU64,
    options: ReportOptions,
    dictionary: Arc<Dictionary>,
    transport: Arc<dyn Transport>,
}

/// Coalesces Report calls into batches, flushed on a count threshold or a
/// timer armed by the first entry in an otherwise-empty batch.
#[derive(Clone)]
pub struct ReportBatch {
    inner: Arc<Inner>,
}

impl ReportBatch {
    pub fn new(options: ReportOptions, dictionary: Arc<Dictionary>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                batch: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                options,
                dictionary,
                transport,
            }),
        }
    }

    /// Append one telemetry entry. Arms a flush timer on the first entry of
    /// a fresh batch; flushes immediately once `max_batch_entries` is hit,
    /// or if the in-progress batch was built against a dictionary epoch the
    /// [`Dictionary`] has since moved past (see the module docs).
    pub fn report(&self, attrs: &Attributes) {
        let encoded = AttributesMsg::encode(attrs, &self.inner.dictionary);
        let current_epoch = self.inner.dictionary.epoch();
        let mut batch = self.inner.batch.lock();

        if let Some(existing) = batch.as_ref() {
            if existing.dictionary_epoch != current_epoch {
                let stale = batch.take().unwrap();
                drop(batch);
                tracing::debug!(
                    stale_epoch = stale.dictionary_epoch,
                    current_epoch,
                    "dictionary epoch advanced, flushing in-progress batch before adding"
                );
                self.spawn_flush(stale.entries);
                batch = self.inner.batch.lock();
            }
        }

        let should_arm_timer = batch.is_none();
        let entry_batch = batch.get_or_insert_with(|| Batch {
            entries: Vec::new(),
            generation: self.inner.next_generation.fetch_add(1, Ordering::SeqCst),
            dictionary_epoch: current_epoch,
        });
        entry_batch.entries.push(encoded);

        let full = entry_batch.entries.len() >= self.inner.options.max_batch_entries;
        let generation = entry_batch.generation;

        if full {
            let taken = batch.take();
            drop(batch);
            if let Some(taken) = taken {
                self.spawn_flush(taken.entries);
            }
        } else if should_arm_timer {
            drop(batch);
            self.arm_timer(generation);
        }
    }

    fn arm_timer(&self, generation: u64) {
        let inner = self.inner.clone();
        let delay = inner.options.max_batch_time();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let taken = {
                let mut batch = inner.batch.lock();
                match batch.as_ref() {
                    Some(b) if b.generation == generation => batch.take(),
                    _ => None,
                }
            };
            if let Some(taken) = taken {
                Self::flush_entries(inner, taken.entries).await;
            }
        });
    }

    fn spawn_flush(&self, entries: Vec<AttributesMsg>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Self::flush_entries(inner, entries).await;
        });
    }

    async fn flush_entries(inner: Arc<Inner>, entries: Vec<AttributesMsg>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        let request = ReportRequest { attributes: entries };
        match inner.transport.report(request).await {
            Ok(_) => tracing::trace!(count, "report batch flushed"),
            Err(err) => tracing::warn!(?err, count, "report batch flush failed, entries dropped"),
        }
    }

    /// Flush whatever batch is currently buffered, synchronously with
    /// respect to the caller issuing the transport call (though the RPC
    /// itself still completes asynchronously). Used on client teardown, the
    /// analogue of the original's destructor flush.
    pub async fn flush(&self) {
        let taken = self.inner.batch.lock().take();
        if let Some(taken) = taken {
            Self::flush_entries(self.inner.clone(), taken.entries).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attribute::Value;
    use crate::error::Result;
    use crate::transport::{CheckRequest, CheckResponse, QuotaRequest, QuotaResponse, ReportResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTransport {
        report_calls: AtomicUsize,
        total_entries: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn check(&self, _req: CheckRequest) -> Result<CheckResponse> {
            unimplemented!()
        }
        async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            self.total_entries.fetch_add(req.attributes.len(), Ordering::SeqCst);
            Ok(ReportResponse::default())
        }
        async fn quota(&self, _req: QuotaRequest) -> Result<QuotaResponse> {
            unimplemented!()
        }
    }

    fn sample() -> Attributes {
        let mut a = Attributes::new();
        a.insert("destination.service", Value::String("svc".into()));
        a
    }

    #[tokio::test]
    async fn flushes_on_entry_count_threshold() {
        let transport = Arc::new(CountingTransport {
            report_calls: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
        });
        let batch = ReportBatch::new(
            ReportOptions {
                max_batch_entries: 3,
                max_batch_time_ms: 60_000,
            },
            Arc::new(Dictionary::new()),
            transport.clone(),
        );

        for _ in 0..3 {
            batch.report(&sample());
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn flushes_on_timer_when_under_threshold() {
        let transport = Arc::new(CountingTransport {
            report_calls: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
        });
        let batch = ReportBatch::new(
            ReportOptions {
                max_batch_entries: 1_000,
                max_batch_time_ms: 20,
            },
            Arc::new(Dictionary::new()),
            transport.clone(),
        );

        batch.report(&sample());
        batch.report(&sample());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_report_after_a_count_flush_arms_a_fresh_timer() {
        let transport = Arc::new(CountingTransport {
            report_calls: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
        });
        let batch = ReportBatch::new(
            ReportOptions {
                max_batch_entries: 3,
                max_batch_time_ms: 40,
            },
            Arc::new(Dictionary::new()),
            transport.clone(),
        );

        // two reports: under both the count and time threshold, no flush yet.
        batch.report(&sample());
        batch.report(&sample());
        tokio::task::yield_now().await;
        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 0);

        // third report hits the count threshold: flushes immediately.
        batch.report(&sample());
        tokio::task::yield_now().await;
        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 3);

        // a further report opens a fresh batch and arms its own timer,
        // independent of the one the flushed batch had armed.
        batch.report(&sample());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn dictionary_reset_flushes_the_in_progress_batch_first() {
        let transport = Arc::new(CountingTransport {
            report_calls: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
        });
        let dictionary = Arc::new(Dictionary::new());
        let batch = ReportBatch::new(
            ReportOptions {
                max_batch_entries: 1_000,
                max_batch_time_ms: 60_000,
            },
            dictionary.clone(),
            transport.clone(),
        );

        batch.report(&sample());
        batch.report(&sample());

        dictionary.reset();

        // this entry was encoded under a new epoch: it cannot share a batch
        // with the two entries encoded before the reset.
        batch.report(&sample());
        tokio::task::yield_now().await;

        assert_eq!(
            transport.report_calls.load(Ordering::SeqCst),
            1,
            "the pre-reset batch should have been flushed on its own"
        );
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 2);

        batch.flush().await;
        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn explicit_flush_drains_buffered_entries() {
        let transport = Arc::new(CountingTransport {
            report_calls: AtomicUsize::new(0),
            total_entries: AtomicUsize::new(0),
        });
        let batch = ReportBatch::new(
            ReportOptions {
                max_batch_entries: 1_000,
                max_batch_time_ms: 60_000,
            },
            Arc::new(Dictionary::new()),
            transport.clone(),
        );

        batch.report(&sample());
        batch.flush().await;

        assert_eq!(transport.report_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.total_entries.load(Ordering::SeqCst), 1);
    }
}
