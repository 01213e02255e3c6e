//! Wire protocol: frame grammar ([`codec`]) and stream reassembly ([`assembler`]).
pub mod assembler;
pub mod codec;

pub use assembler::{AssembledFrame, FrameAssembler, MAX_BUFFER_BYTES};
pub use codec::{
    encode_frame, format_line, try_decode, DecodeError, Fixed, FrameFields, FRAME_LEN,
};
