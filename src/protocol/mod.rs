//! Protocol module - Defines the wire protocol for VNOC messaging
//!
//! Every frame has the layout:
//! - 2 bytes magic ("VN")
//! - 1 byte instruction code
//! - 4 bytes body length (little-endian)
//! - Variable length body of named field records
//! - 4 bytes CRC-32 trailer (little-endian)

mod checksum;
mod codec;
mod message;
mod schema;
mod value;

pub use checksum::*;
pub use codec::*;
pub use message::*;
pub use schema::*;
pub use value::*;

/// Default port for VNOC communication
pub const DEFAULT_PORT: u16 = 7890;

/// Magic bytes for frame identification
pub const MAGIC_BYTES: [u8; 2] = [0x56, 0x4E]; // "VN"

/// Default ceiling on the declared body length (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
