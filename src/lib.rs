//! Channel relay: policy-gated, rate-limited message forwarding with
//! resumable history backfill.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod recorder;
pub mod relay;
pub mod stats;
pub mod store;
