//! Protocol module containing message types, the frame codec and the
//! sequence counter used for connection ids.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{
    decode_frame, decode_message, encode_frame, encode_message, read_frame, write_frame,
    ProtocolError, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use messages::*;
pub use sequence::SequenceCounter;
