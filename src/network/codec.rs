use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use encoding_rs::Encoding;

use super::BufferView;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Converts domain messages to and from wire bytes; owns the framing.
///
/// `decode` is called with a cursor positioned at the start of a candidate frame.
/// Returning `Ok(None)` means "incomplete": the session rewinds the cursor and
/// calls again once more bytes have arrived, so a decoder may read ahead freely.
pub trait Codec: Send + Sync + 'static {
    type Message: Send + 'static;

    fn initialize(&mut self, charset: &str) -> AppResult<()>;

    /// `Ok(None)` means there is nothing to send for this message.
    fn encode(&self, message: &Self::Message) -> AppResult<Option<Bytes>>;

    fn decode(&self, buffer: &mut BufferView<'_>) -> AppResult<Option<Self::Message>>;
}

pub type SharedCodec<M> = Arc<dyn Codec<Message = M>>;

const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;
const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Newline terminated text, `\r\n` accepted on input.
#[derive(Debug)]
pub struct LineCodec {
    encoding: &'static Encoding,
    max_line_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        LineCodec {
            encoding: encoding_rs::UTF_8,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec::default()
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> LineCodec {
        self.max_line_length = max_line_length;
        self
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }
}

impl Codec for LineCodec {
    type Message = String;

    fn initialize(&mut self, charset: &str) -> AppResult<()> {
        let encoding = Encoding::for_label(charset.trim().as_bytes())
            .ok_or_else(|| AppError::UnsupportedCharset(charset.to_string()))?;
        // UTF-16 and replacement encode as something else, lines would not round trip
        if encoding.output_encoding() != encoding {
            return Err(AppError::UnsupportedCharset(charset.to_string()));
        }
        self.encoding = encoding;
        Ok(())
    }

    /// Lines may not contain `\n` nor end with `\r`, neither survives decoding.
    fn encode(&self, message: &String) -> AppResult<Option<Bytes>> {
        if message.contains('\n') || message.ends_with('\r') {
            return Err(AppError::InvalidValue(
                "line contains a line terminator".to_string(),
            ));
        }
        let (encoded, _, had_errors) = self.encoding.encode(message);
        if had_errors {
            return Err(AppError::InvalidValue(format!(
                "message is not representable in {}",
                self.encoding.name()
            )));
        }
        let mut frame = BytesMut::with_capacity(encoded.len() + 1);
        frame.put_slice(&encoded);
        frame.put_u8(b'\n');
        Ok(Some(frame.freeze()))
    }

    fn decode(&self, buffer: &mut BufferView<'_>) -> AppResult<Option<String>> {
        let Some(end) = buffer.find(b'\n') else {
            if buffer.remaining() > self.max_line_length {
                return Err(AppError::FrameTooLarge(
                    buffer.remaining(),
                    self.max_line_length,
                ));
            }
            return Ok(None);
        };
        if end > self.max_line_length {
            return Err(AppError::FrameTooLarge(end, self.max_line_length));
        }
        let mut line = &buffer.chunk()[..end];
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let (text, had_errors) = self.encoding.decode_without_bom_handling(line);
        if had_errors {
            return Err(AppError::MalformedProtocol(format!(
                "line is not valid {}",
                self.encoding.name()
            )));
        }
        let text = text.into_owned();
        buffer.advance(end + 1);
        Ok(Some(text))
    }
}

/// Frames prefixed with a 4 byte big-endian body length.
#[derive(Debug)]
pub struct LengthFieldCodec {
    max_frame_size: usize,
}

impl Default for LengthFieldCodec {
    fn default() -> Self {
        LengthFieldCodec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl LengthFieldCodec {
    pub fn new(max_frame_size: usize) -> LengthFieldCodec {
        LengthFieldCodec { max_frame_size }
    }

    fn check(&self, buffer: &BufferView<'_>) -> AppResult<usize> {
        let Some(header) = buffer.peek(4) else {
            return Err(Incomplete);
        };
        let body_size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if body_size < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} less than 0",
                body_size
            )));
        }
        let body_size = body_size as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::FrameTooLarge(body_size, self.max_frame_size));
        }
        if buffer.remaining() < body_size + 4 {
            return Err(Incomplete);
        }
        Ok(body_size)
    }
}

impl Codec for LengthFieldCodec {
    type Message = Bytes;

    fn initialize(&mut self, _charset: &str) -> AppResult<()> {
        Ok(())
    }

    fn encode(&self, message: &Bytes) -> AppResult<Option<Bytes>> {
        if message.len() > self.max_frame_size {
            return Err(AppError::FrameTooLarge(message.len(), self.max_frame_size));
        }
        let mut frame = BytesMut::with_capacity(message.len() + 4);
        frame.put_i32(message.len() as i32);
        frame.put_slice(message);
        Ok(Some(frame.freeze()))
    }

    fn decode(&self, buffer: &mut BufferView<'_>) -> AppResult<Option<Bytes>> {
        // perform a check to ensure we have enough data
        match self.check(buffer) {
            Ok(body_size) => {
                buffer.advance(4);
                Ok(Some(buffer.copy_to_bytes(body_size)))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
