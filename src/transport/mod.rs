//! Transport interface and wire-level message shapes.
//!
//! The library requires a transport exposing three streaming RPCs — Check,
//! Report, Quota — but the concrete gRPC implementation is an external
//! collaborator: only the interface is specified here. [`stream`] provides
//! the generic reader/writer multiplexer a concrete transport would be
//! built from; [`Transport`] is the narrower async-call surface the
//! [`crate::Client`] façade actually depends on.

pub mod stream;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attribute::{Attributes, Value};
use crate::dictionary::Dictionary;
use crate::error::Result;

/// One attribute value in wire form, already resolved to a dictionary
/// index: type-segregated maps keyed by integer index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributesMsg {
    /// Names whose index first appears in this message.
    pub dictionary: HashMap<i32, String>,
    pub strings: HashMap<i32, String>,
    pub int64s: HashMap<i32, i64>,
    pub doubles: HashMap<i32, f64>,
    pub bools: HashMap<i32, bool>,
    pub bytes: HashMap<i32, Vec<u8>>,
    pub timestamps: HashMap<i32, std::time::SystemTime>,
    pub durations: HashMap<i32, std::time::Duration>,
}

impl AttributesMsg {
    /// Resolve every attribute name in `attrs` against `dictionary` and
    /// bucket the values into their type-segregated maps.
    ///
    /// `dictionary` on the resulting message carries only the names whose
    /// index is introduced for the first time by this call — a name
    /// already shipped in an earlier message is never repeated, since both
    /// peers already agree on its index.
    ///
    /// String-map attributes have no wire representation here (the concrete
    /// transport encoding is out of scope) and are skipped.
    pub fn encode(attrs: &Attributes, dictionary: &Dictionary) -> Self {
        let mut msg = AttributesMsg::default();
        for (name, value) in attrs.iter() {
            let (index, new_word) = dictionary.index_for_message(name);
            if let Some(word) = new_word {
                msg.dictionary.insert(index, word);
            }
            match value {
                Value::String(s) => {
                    msg.strings.insert(index, s.clone());
                }
                Value::Bytes(b) => {
                    msg.bytes.insert(index, b.clone());
                }
                Value::Int64(i) => {
                    msg.int64s.insert(index, *i);
                }
                Value::Double(d) => {
                    msg.doubles.insert(index, *d);
                }
                Value::Bool(b) => {
                    msg.bools.insert(index, *b);
                }
                Value::Timestamp(t) => {
                    msg.timestamps.insert(index, *t);
                }
                Value::Duration(d) => {
                    msg.durations.insert(index, *d);
                }
                Value::StringMap(_) => {
                    tracing::trace!(name, "string-map attributes have no wire encoding, skipping");
                }
            }
        }
        msg
    }
}

/// Per-quota request parameters folded into a [`CheckRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaParams {
    pub amount: i64,
    pub best_effort: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub attributes: AttributesMsg,
    pub quotas: HashMap<String, QuotaParams>,
}

/// Condition under which an attribute match in [`ReferencedAttributes`]
/// applies; `Regex` suppresses caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchCondition {
    Absence,
    Exact,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMatch {
    pub name: i32,
    pub map_key: Option<i32>,
    pub condition: MatchCondition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencedAttributes {
    pub words: Vec<String>,
    pub attribute_matches: Vec<AttributeMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub code: i32,
    pub message: String,
    pub valid_duration: std::time::Duration,
    pub valid_use_count: u32,
    pub referenced_attributes: Option<ReferencedAttributes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaResult {
    pub granted_amount: i64,
    pub valid_duration: std::time::Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub precondition: Option<Precondition>,
    pub quotas: HashMap<String, QuotaResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub attributes: Vec<AttributesMsg>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRequest {
    pub quota: String,
    pub amount: i64,
    pub best_effort: bool,
    pub attributes: AttributesMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub granted_amount: i64,
    pub valid_duration: std::time::Duration,
}

/// A handle allowing the caller to abandon a pending Check RPC. Dropping
/// it without calling [`CancelHandle::cancel`] has no effect.
pub struct CancelHandle {
    inner: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, tokio::sync::oneshot::Receiver<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Self {
                inner: Some(tx),
            },
            rx,
        )
    }

    /// Abandon the pending RPC. Its completion callback will be invoked
    /// with [`crate::error::ErrorKind::Cancelled`].
    pub fn cancel(mut self) {
        if let Some(tx) = self.inner.take() {
            let _ = tx.send(());
        }
    }
}

/// The asynchronous call surface the [`crate::Client`] façade depends on.
///
/// A concrete implementation is expected to multiplex these over three
/// long-lived streams (see [`stream::Stream`] for the reusable fan-out
/// machinery), opening a new stream lazily whenever the previous one
/// fails.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse>;
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse>;
    async fn quota(&self, request: QuotaRequest) -> Result<QuotaResponse>;
}
