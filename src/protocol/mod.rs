//! The framed request/response protocol carried on the control channel.
//!
//! Every record is an 8-byte little-endian header followed by a UTF-8 payload
//! and zero padding to the next 8-byte boundary. Host-to-PHP records carry an
//! opcode and a non-negative payload length; PHP-to-host records reuse the
//! first header word as a signed length whose sign distinguishes results from
//! reverse requests (see [`frame`] for the exact layout).

mod frame;
mod opcode;

pub use frame::{Channel, InRecord};
pub use opcode::{Opcode, ReverseOp};

/// Feature/type bitmask carried in `DATA` replies to reverse requests.
///
/// `IS_ERROR`, `IS_STRING` and `IS_JSON` select the payload interpretation;
/// when none of them is set the payload is a decimal host-handle ID and the
/// capability bits describe the handle.
pub mod data_flags {
    /// The returned handle supports iteration.
    pub const HAS_ITERATOR: u32 = 1;
    /// The returned handle exposes a length.
    pub const HAS_LENGTH: u32 = 2;
    /// The returned handle exposes a size.
    pub const HAS_SIZE: u32 = 4;
    /// Payload is a raw string.
    pub const IS_STRING: u32 = 8;
    /// Payload is JSON text.
    pub const IS_JSON: u32 = 16;
    /// Payload is an error message; PHP raises it as an exception.
    pub const IS_ERROR: u32 = 32;
}
