//! Property model for the control-frame codec.
//!
//! Invariants exercised here:
//! - encode → decode returns the original frame (for field values within
//!   the wire's u16 limits)
//! - decoding arbitrary bytes never panics, only errors
//! - decoding a corrupted encoding never panics

use localcall::frame::Frame;

/// One codec operation to execute.
#[derive(Debug, Clone)]
pub enum CodecOp {
    /// Encode the frame, decode the result, compare.
    Roundtrip(Frame),
    /// Feed raw bytes straight to the decoder. Errors are expected;
    /// panics are the bug.
    DecodeRaw(Vec<u8>),
    /// Encode the frame, XOR one body byte, decode. Must not panic.
    FlipByte { frame: Frame, index: usize, xor: u8 },
}

/// Run a sequence of codec operations, verifying the invariants above.
pub fn execute_and_verify(ops: &[CodecOp]) -> Result<(), String> {
    for op in ops {
        match op {
            CodecOp::Roundtrip(frame) => {
                let body = frame.encode_body();
                let decoded = Frame::decode_body(&body)
                    .map_err(|e| format!("roundtrip of {frame:?} failed to decode: {e}"))?;
                if &decoded != frame {
                    return Err(format!("roundtrip mismatch: {frame:?} became {decoded:?}"));
                }
            }
            CodecOp::DecodeRaw(bytes) => {
                // Any verdict is acceptable; reaching the next line is
                // the property.
                let _ = Frame::decode_body(bytes);
            }
            CodecOp::FlipByte { frame, index, xor } => {
                let mut body = frame.encode_body();
                if body.is_empty() {
                    continue;
                }
                let index = index % body.len();
                body[index] ^= xor;
                let _ = Frame::decode_body(&body);
            }
        }
    }
    Ok(())
}
