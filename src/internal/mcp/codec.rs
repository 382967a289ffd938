use super::protocol::JsonRpcMessage;

/// Errors produced by the newline-delimited frame codec.
///
/// `MalformedFrame` is recoverable (one bad frame, the stream continues);
/// `FrameTooLarge` is fatal to the connection so a misbehaving child cannot
/// force unbounded buffering.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("frame exceeds maximum size of {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Serialize one message as a wire frame: JSON text plus a single `\n`.
pub fn encode_message(message: &JsonRpcMessage) -> Result<Vec<u8>, CodecError> {
    if message.result.is_some() && message.error.is_some() {
        return Err(CodecError::InvalidMessage(
            "response carries both result and error".to_string(),
        ));
    }
    if message.method.is_none() && message.result.is_none() && message.error.is_none() {
        return Err(CodecError::InvalidMessage(
            "message carries neither method nor result nor error".to_string(),
        ));
    }
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Incremental decoder for a newline-delimited JSON-RPC byte stream.
///
/// Bytes arrive in whatever chunks the pipe hands us; the decoder buffers
/// until a delimiter and yields every complete frame. Decoding is
/// independent of chunk boundaries.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append `bytes` and drain every complete frame.
    ///
    /// Each inner element is one frame: `Ok` for a parsed message,
    /// `Err(MalformedFrame)` for a frame that was delimited but not valid
    /// JSON. Blank frames (keep-alive newlines) are skipped. The outer
    /// `Err` is only `FrameTooLarge` and the connection must be torn down.
    pub fn feed(
        &mut self,
        bytes: &[u8],
    ) -> Result<Vec<Result<JsonRpcMessage, CodecError>>, CodecError> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = &self.buffer[start..end];
            start = end + 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_size {
                self.buffer.clear();
                return Err(CodecError::FrameTooLarge {
                    limit: self.max_frame_size,
                });
            }
            frames.push(serde_json::from_slice(line).map_err(CodecError::from));
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.max_frame_size {
            self.buffer.clear();
            return Err(CodecError::FrameTooLarge {
                limit: self.max_frame_size,
            });
        }
        Ok(frames)
    }
}
