//! Stream multiplexing over one ordered byte connection.
//!
//! Independent logical streams share a single TCP connection. Each frame
//! carries a stream identifier and open/fin/abort flags; frames of different
//! streams interleave freely.

mod frame;
mod table;

pub use frame::{encode_header, Frame, FrameDecoder, FrameFlags, FRAME_HEADER_LEN};
pub use table::{Slot, StreamTable};
