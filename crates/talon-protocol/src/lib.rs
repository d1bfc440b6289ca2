//! Wire protocol shared by plugin and channel subprocesses: one
//! length-prefixed JSON frame codec, two method vocabularies.

pub mod channel;
pub mod codec;
pub mod handshake;
pub mod plugin;

pub use codec::{read_frame, write_frame, ProtocolError, Result, MAX_FRAME_BYTES};
