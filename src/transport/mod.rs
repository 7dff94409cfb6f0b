//! UDP transport for the reliability protocol

pub mod end_point;
pub mod send_pipeline;
