//! JSON codec: every value is one compact JSON document terminated by a
//! newline.

use futures::io::{AsyncBufReadExt as _, AsyncWriteExt as _};

use super::{BoxReader, BoxWriter, CodecError, CodecKind, CodecRead, CodecWrite, MAX_FRAME_LEN};
use crate::header::Header;

pub const JSON_CODEC_TAG: &str = "application/json";

pub(super) fn new(
    reader: BoxReader,
    writer: BoxWriter,
) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>) {
    (
        Box::new(JsonCodecRead { reader }),
        Box::new(JsonCodecWrite { writer }),
    )
}

struct JsonCodecRead {
    reader: BoxReader,
}

impl JsonCodecRead {
    /// Reads one newline-terminated value. `Ok(None)` if the stream ended
    /// before the first byte.
    async fn read_value(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut line = Vec::new();
        let count = self.reader.read_until(b'\n', &mut line).await?;
        if count == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(CodecError::UnexpectedEndOfStream);
        }
        if line.len() > MAX_FRAME_LEN as usize {
            return Err(CodecError::FrameTooLarge {
                len: line.len() as u64,
            });
        }
        Ok(Some(line))
    }
}

#[async_trait::async_trait]
impl CodecRead for JsonCodecRead {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    async fn read_header(&mut self) -> Result<Option<Header>, CodecError> {
        match self.read_value().await? {
            None => Ok(None),
            Some(data) => Ok(Some(CodecKind::Json.decode(&data)?)),
        }
    }

    async fn read_body(&mut self) -> Result<Vec<u8>, CodecError> {
        match self.read_value().await? {
            None => Err(CodecError::UnexpectedEndOfStream),
            Some(data) => Ok(data),
        }
    }
}

struct JsonCodecWrite {
    writer: BoxWriter,
}

#[async_trait::async_trait]
impl CodecWrite for JsonCodecWrite {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError> {
        let header_data = CodecKind::Json.encode(header)?;
        let mut frame = Vec::with_capacity(header_data.len() + body.len() + 2);
        frame.extend_from_slice(&header_data);
        frame.push(b'\n');
        frame.extend_from_slice(body);
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.writer.close().await?;
        Ok(())
    }
}
