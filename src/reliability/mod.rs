//! The reliability protocol: integrity tags bound to sequence numbers, per-transfer receipt
//!  tracking, and the rules for acknowledging, rejecting and resuming transfers.

pub mod engine;
pub mod frame;
pub mod integrity;
pub mod outgoing;
pub mod registry;
pub mod transfer_state;
pub mod wire;
