//! Protocol module - Defines the wire protocol spoken between overlay nodes
//!
//! Every packet is a 3-byte header followed by its fields:
//! - 1 byte frame category (local, transfer, broadcast)
//! - 1 byte opcode, meaning depends on the category
//! - 1 byte type tag selecting the concrete packet
//!
//! Integers are big-endian. Decoding is incremental and works on any chunking
//! of the input stream.

mod codec;
mod message;
mod packet;
mod wire;

pub use codec::*;
pub use message::*;
pub use packet::*;
pub use wire::*;

/// Default port for overlay traffic
pub const DEFAULT_PORT: u16 = 7777;

/// Upper bound on the element count of any list on the wire
pub const MAX_LIST_LEN: usize = 1024;

/// Upper bound on the byte length of any string on the wire
pub const MAX_STRING_LEN: usize = 1024;

pub const OP_LOCAL_CONNECTION: u8 = 0;
pub const OP_LOCAL_DISCONNECTION: u8 = 1;
pub const OP_TRANSFER_WORK: u8 = 1;
pub const OP_BROADCAST_DISCONNECTED: u8 = 0;
pub const OP_BROADCAST_ADD_NODE: u8 = 1;

pub const TAG_CONNECT: u8 = 1;
pub const TAG_CONNECT_KO: u8 = 2;
pub const TAG_CONNECT_OK: u8 = 3;
pub const TAG_ADD_NODE: u8 = 4;

pub const TAG_DISCONNECTION_REQUEST: u8 = 10;
pub const TAG_DISCONNECTION_DENIED: u8 = 11;
pub const TAG_DISCONNECTION_GRANTED: u8 = 12;
pub const TAG_PLEASE_RECONNECT: u8 = 13;
pub const TAG_RECONNECT: u8 = 14;
pub const TAG_DISCONNECTED: u8 = 15;

pub const TAG_WORK_REQUEST: u8 = 1;
pub const TAG_WORK_AVAILABILITY: u8 = 2;
pub const TAG_WORK_ASSIGNMENT: u8 = 3;
pub const TAG_WORK_RESPONSE: u8 = 4;
