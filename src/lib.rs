//! Client-side sidecar library mediating policy Check, Quota allocation,
//! and telemetry Report with a central Mixer-protocol server.
//!
//! [`Client`] is the entry point: construct one per proxy process, call
//! [`Client::check`] on the request path and [`Client::report`] on
//! completion. The concrete transport (the network connection to the
//! server) is supplied by the embedder through the [`transport::Transport`]
//! trait; this crate owns everything above that line — attribute
//! compression, the Check cache, the quota prefetcher, and report batching.

pub mod attribute;
pub mod check_cache;
pub mod client;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod quota;
pub mod report;
pub mod signature;
pub mod transport;

pub use attribute::{Attributes, Value};
pub use client::Client;
pub use config::{CheckOptions, ClientOptions, QuotaOptions, ReportOptions};
pub use error::{Error, ErrorKind, Result};
pub use quota::cache::QuotaDemand;
pub use transport::Transport;
