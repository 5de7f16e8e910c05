//! Native binary codec: every value is a big-endian `u32` length prefix
//! followed by a bincode payload.

use bytes::BufMut as _;
use futures::io::AsyncWriteExt as _;

use super::{
    read_exact_or_eof, BoxReader, BoxWriter, CodecError, CodecKind, CodecRead, CodecWrite,
    MAX_FRAME_LEN,
};
use crate::header::Header;

pub const BINARY_CODEC_TAG: &str = "application/bincode";

pub(super) fn new(
    reader: BoxReader,
    writer: BoxWriter,
) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>) {
    (
        Box::new(BinaryCodecRead { reader }),
        Box::new(BinaryCodecWrite { writer }),
    )
}

struct BinaryCodecRead {
    reader: BoxReader,
}

impl BinaryCodecRead {
    /// Reads one length-prefixed value. `Ok(None)` if the stream ended
    /// before the length prefix.
    async fn read_value(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&mut self.reader, &mut len_buf).await? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len: len.into() });
        }
        let mut data = vec![0u8; len as usize];
        if !read_exact_or_eof(&mut self.reader, &mut data).await? && len > 0 {
            return Err(CodecError::UnexpectedEndOfStream);
        }
        Ok(Some(data))
    }
}

#[async_trait::async_trait]
impl CodecRead for BinaryCodecRead {
    fn kind(&self) -> CodecKind {
        CodecKind::Binary
    }

    async fn read_header(&mut self) -> Result<Option<Header>, CodecError> {
        match self.read_value().await? {
            None => Ok(None),
            Some(data) => Ok(Some(CodecKind::Binary.decode(&data)?)),
        }
    }

    async fn read_body(&mut self) -> Result<Vec<u8>, CodecError> {
        match self.read_value().await? {
            None => Err(CodecError::UnexpectedEndOfStream),
            Some(data) => Ok(data),
        }
    }
}

struct BinaryCodecWrite {
    writer: BoxWriter,
}

#[async_trait::async_trait]
impl CodecWrite for BinaryCodecWrite {
    fn kind(&self) -> CodecKind {
        CodecKind::Binary
    }

    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError> {
        let header_data = CodecKind::Binary.encode(header)?;
        let mut frame = bytes::BytesMut::with_capacity(8 + header_data.len() + body.len());
        put_value(&mut frame, &header_data)?;
        put_value(&mut frame, body)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.writer.close().await?;
        Ok(())
    }
}

fn put_value(frame: &mut bytes::BytesMut, data: &[u8]) -> Result<(), CodecError> {
    if data.len() > MAX_FRAME_LEN as usize {
        return Err(CodecError::FrameTooLarge {
            len: data.len() as u64,
        });
    }
    frame.put_u32(data.len() as u32);
    frame.put_slice(data);
    Ok(())
}
