//! A relay for chat messages and file transfers over UDP, with an application-layer reliability
//!  protocol on top: every frame carries an integrity tag bound to its sequence number, file
//!  transfers are tracked per transfer id, and senders can resume interrupted transfers by asking
//!  for the exact set of missing chunks.

pub mod config;
pub mod reliability;
pub mod transport;
pub mod test_util;
