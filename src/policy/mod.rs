//! Forwarding policy: pauses, channel lists, and the gate that evaluates them.

pub mod admin;
pub mod gate;
pub mod model;
pub mod store;

pub use admin::AdminService;
pub use gate::{Decision, DenyReason, admit};
pub use model::{ChannelPolicy, ForwardingMode, ListMode, PauseScope, PauseState, PolicySnapshot};
pub use store::PolicyStore;
