//! Wire protocols.
//!
//! - `request`: the per-stream request header, shared by both backends
//! - `mux`: stream framing for the byte-stream (TCP) backend

pub mod mux;
pub mod request;
