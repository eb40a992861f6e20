//! The forwarding engine: admission, delivery, and the two ingestion paths.

pub mod backfill;
pub mod forwarder;
pub mod limiter;
pub mod live;
pub mod retry;

pub use backfill::{BackfillController, BackfillState, BackfillStatus};
pub use forwarder::{ForwardOutcome, Forwarder};
pub use limiter::{Limiters, RateLimiter};
pub use live::{LiveHealth, LiveState, LiveStatus, spawn_live_task};
pub use retry::RetryPolicy;
