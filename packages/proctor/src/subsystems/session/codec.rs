//! Frame layer of the agent protocol: 4-byte big-endian length prefix,
//! bincode-encoded tagged unions inside. Nothing above the session layer
//! ever sees raw frames.

use bytes::Bytes;
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Hard cap on a single frame; inline artifacts are limited well below
/// this by configuration.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .length_field_type::<u32>()
        .new_codec()
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub fn encode_frame<T: bincode::Encode>(msg: &T) -> Result<Bytes, CodecError> {
    let bytes = bincode::encode_to_vec(msg, bincode::config::standard())?;
    Ok(Bytes::from(bytes))
}

pub fn decode_frame<T: bincode::Decode<()>>(frame: &[u8]) -> Result<T, CodecError> {
    let (msg, read) = bincode::decode_from_slice(frame, bincode::config::standard())?;
    if read != frame.len() {
        return Err(CodecError::Decode(bincode::error::DecodeError::Other(
            "trailing bytes after message",
        )));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_types::{AgentMessage, CoreMessage, DrainId, RunId};

    #[test]
    fn frames_round_trip() {
        let msg = CoreMessage::CancelWork {
            run_id: RunId::new("run-1").unwrap(),
            reason: "test".to_string(),
        };
        let frame = encode_frame(&msg).unwrap();
        let back: CoreMessage = decode_frame(&frame).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let msg = AgentMessage::DrainComplete {
            drain_id: DrainId::new("drain-1").unwrap(),
        };
        let mut bytes = encode_frame(&msg).unwrap().to_vec();
        bytes.push(0xff);
        assert!(decode_frame::<AgentMessage>(&bytes).is_err());
    }

    #[test]
    fn junk_is_an_error_not_a_panic() {
        assert!(decode_frame::<AgentMessage>(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
