//! Work-packet and result framing.
//!
//! Application payloads are UTF-8 JSON documents carried in WebSocket
//! messages. A frame remembers the op-code it arrived with so replies go
//! back with the same one.
//!
//! - [`WorkPacket`]: `{"Filepath": string}`
//! - [`JobResult`]: `{"Packet": WorkPacket, "Err": string|null, "Converted": string}`

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{decode_packet, decode_result, encode_packet, encode_result, Frame, FrameKind};
pub use error::{FrameError, Result};
pub use packet::{JobResult, Outcome, WorkPacket};
