//! Pluggable tuple wire codecs.
//!
//! Only the transport framing is fixed; the bytes inside a frame are
//! produced by a [`TupleCodec`]. Codecs are plain values handed to each
//! connection at construction, so swapping one in is constructor injection,
//! not global state.

use bytes::Bytes;
use thiserror::Error;

use crate::tuple::Tuple;

/// Failure to turn a tuple into bytes or back.
#[derive(Debug, Error)]
pub enum CodecError {
  /// The tuple could not be serialized.
  #[error("tuple encode failed: {0}")]
  Encode(#[source] serde_json::Error),
  /// The frame could not be parsed as a tuple.
  #[error("tuple decode failed: {0}")]
  Decode(#[source] serde_json::Error),
}

/// Serializes tuples for the wire.
pub trait TupleCodec: Send + Sync {
  /// Encodes one tuple into the body of a frame.
  fn encode(&self, tuple: &Tuple) -> Result<Bytes, CodecError>;
  /// Decodes one frame body back into a tuple.
  fn decode(&self, frame: &[u8]) -> Result<Tuple, CodecError>;
}

/// The default codec: tuples as JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTupleCodec;

impl TupleCodec for JsonTupleCodec {
  fn encode(&self, tuple: &Tuple) -> Result<Bytes, CodecError> {
    let body = serde_json::to_vec(tuple).map_err(CodecError::Encode)?;
    Ok(Bytes::from(body))
  }

  fn decode(&self, frame: &[u8]) -> Result<Tuple, CodecError> {
    serde_json::from_slice(frame).map_err(CodecError::Decode)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tuple::Key;

  #[test]
  fn json_codec_round_trips_a_tuple() {
    let mut tuple = Tuple::with_id(17);
    tuple.origin_id = 17;
    tuple.source_ids = vec![17, 31];
    tuple.group_by_key = Some(Key::from("host1"));
    tuple.group_by_value = Some(9);
    tuple.component_name = "transform".to_string();
    tuple.next_component = Some("sink".to_string());
    tuple.destination_task_id = 4;
    tuple.destination_worker_id = 2;
    tuple.set("count", 12);

    let codec = JsonTupleCodec;
    let frame = codec.encode(&tuple).unwrap();
    let decoded = codec.decode(&frame).unwrap();
    assert_eq!(decoded, tuple);
  }

  #[test]
  fn garbage_frames_fail_to_decode() {
    let codec = JsonTupleCodec;
    assert!(matches!(codec.decode(b"not a tuple"), Err(CodecError::Decode(_))));
    assert!(matches!(codec.decode(b"{\"id\":true}"), Err(CodecError::Decode(_))));
  }
}
