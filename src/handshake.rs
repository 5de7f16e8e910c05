//! One-time connection preamble that selects the body codec.
//!
//! The preamble is always a single JSON line, regardless of the codec it
//! selects, so the peer can read it before anything format-specific is
//! negotiated.

use futures::io::{AsyncBufReadExt as _, AsyncWriteExt as _};

use crate::codec::{BoxReader, BoxWriter, CodecKind};

/// Every connection must open with this constant or it is rejected.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Connection preamble: magic constant plus the codec tag for all following
/// header/body frames. Sent exactly once, first.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: String,
}

impl Default for Options {
    fn default() -> Self {
        Self::with_codec(CodecKind::Binary)
    }
}

impl Options {
    pub fn with_codec(kind: CodecKind) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: kind.tag().to_string(),
        }
    }
}

/// Error establishing the connection preamble. Always connection-fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to read or write connection preamble")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
    #[error("malformed options preamble")]
    InvalidOptions(#[source] serde_json::Error),
    #[error("invalid magic number {value:#x}")]
    BadMagicNumber { value: u32 },
    #[error("unknown codec type {tag:?}")]
    UnknownCodec { tag: String },
    #[error("connection closed before options preamble")]
    UnexpectedEndOfStream,
}

pub(crate) async fn send_options(
    writer: &mut BoxWriter,
    options: &Options,
) -> Result<(), ProtocolError> {
    let mut data = serde_json::to_vec(options).map_err(ProtocolError::InvalidOptions)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one options line and validates the magic number. The codec
/// tag is validated by the caller against its registry.
pub(crate) async fn receive_options(reader: &mut BoxReader) -> Result<Options, ProtocolError> {
    let mut line = Vec::new();
    let count = reader.read_until(b'\n', &mut line).await?;
    if count == 0 {
        return Err(ProtocolError::UnexpectedEndOfStream);
    }
    let options: Options =
        serde_json::from_slice(&line).map_err(ProtocolError::InvalidOptions)?;
    if options.magic_number != MAGIC_NUMBER {
        return Err(ProtocolError::BadMagicNumber {
            value: options.magic_number,
        });
    }
    Ok(options)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::test_utils::SharedBuf;

    fn reader_over(data: Vec<u8>) -> BoxReader {
        Box::new(futures::io::Cursor::new(data))
    }

    #[async_std::test]
    async fn options_round_trip() {
        let buf = SharedBuf::default();
        let mut writer: BoxWriter = Box::new(buf.clone());
        let options = Options::with_codec(CodecKind::Json);
        send_options(&mut writer, &options).await.unwrap();

        let mut reader = reader_over(buf.take());
        let received = receive_options(&mut reader).await.unwrap();
        assert_eq!(received, options);
    }

    #[async_std::test]
    async fn bad_magic_number_rejected() {
        let buf = SharedBuf::default();
        let mut writer: BoxWriter = Box::new(buf.clone());
        let options = Options {
            magic_number: 0,
            ..Options::default()
        };
        send_options(&mut writer, &options).await.unwrap();

        let mut reader = reader_over(buf.take());
        match receive_options(&mut reader).await.unwrap_err() {
            ProtocolError::BadMagicNumber { value: 0 } => (),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[async_std::test]
    async fn empty_stream_rejected() {
        let mut reader = reader_over(Vec::new());
        match receive_options(&mut reader).await.unwrap_err() {
            ProtocolError::UnexpectedEndOfStream => (),
            err => panic!("unexpected error {:?}", err),
        }
    }
}
