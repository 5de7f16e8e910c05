//! Pluggable wire codecs that move [Header] records and opaque body values
//! across a byte stream.

use std::collections::HashMap;

use crate::header::Header;

mod binary;
mod json;

pub use binary::BINARY_CODEC_TAG;
pub use json::JSON_CODEC_TAG;

pub type BoxReader = Box<dyn futures::io::AsyncBufRead + Send + Unpin>;
pub type BoxWriter = Box<dyn futures::io::AsyncWrite + Send + Unpin>;

/// Largest accepted length for a single encoded header or body value.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Error reading or writing a header/body frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to read or write connection")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
    #[error("failed to encode value")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("failed to decode value")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("unexpected end of stream in the middle of a frame")]
    UnexpectedEndOfStream,
    #[error("frame of {len} bytes exceeds maximum frame size")]
    FrameTooLarge { len: u64 },
}

/// Wire format negotiated for a connection. Encodes and decodes individual
/// values in that format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Binary,
    Json,
}

impl CodecKind {
    pub fn tag(self) -> &'static str {
        match self {
            CodecKind::Binary => BINARY_CODEC_TAG,
            CodecKind::Json => JSON_CODEC_TAG,
        }
    }

    pub fn encode<T: serde::Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecKind::Binary => {
                bincode::serialize(value).map_err(|err| CodecError::Encode(Box::new(err)))
            }
            CodecKind::Json => {
                serde_json::to_vec(value).map_err(|err| CodecError::Encode(Box::new(err)))
            }
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::Binary => {
                bincode::deserialize(data).map_err(|err| CodecError::Decode(Box::new(err)))
            }
            CodecKind::Json => {
                serde_json::from_slice(data).map_err(|err| CodecError::Decode(Box::new(err)))
            }
        }
    }
}

/// Read half of a connection codec.
#[async_trait::async_trait]
pub trait CodecRead: Send {
    fn kind(&self) -> CodecKind;

    /// Reads the next frame header. Returns `Ok(None)` if the stream ended
    /// cleanly at a frame boundary.
    async fn read_header(&mut self) -> Result<Option<Header>, CodecError>;

    /// Reads the next body value and returns its raw encoded bytes.
    ///
    /// Exactly one encoded value is consumed even when the caller discards
    /// the result, so the frame boundaries stay synchronized.
    async fn read_body(&mut self) -> Result<Vec<u8>, CodecError>;
}

/// Write half of a connection codec.
#[async_trait::async_trait]
pub trait CodecWrite: Send {
    fn kind(&self) -> CodecKind;

    /// Writes a header and a pre-encoded body as two consecutive
    /// self-delimited values and flushes them together.
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError>;

    async fn close(&mut self) -> Result<(), CodecError>;
}

/// Constructor turning the two halves of a connection into a codec.
pub type NewCodecFn = fn(BoxReader, BoxWriter) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>);

/// Maps a codec tag from the connection preamble to its constructor.
///
/// Populated before any connection is served and read-only afterwards.
pub struct CodecRegistry {
    constructors: HashMap<String, NewCodecFn>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(BINARY_CODEC_TAG, binary::new);
        registry.register(JSON_CODEC_TAG, json::new);
        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl ToString, constructor: NewCodecFn) {
        self.constructors.insert(tag.to_string(), constructor);
    }

    pub fn get(&self, tag: &str) -> Option<NewCodecFn> {
        self.constructors.get(tag).copied()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("tags", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reads exactly `buf.len()` bytes. Returns `Ok(false)` if the stream ended
/// before the first byte, [CodecError::UnexpectedEndOfStream] if it ended
/// in between.
pub(crate) async fn read_exact_or_eof(
    reader: &mut BoxReader,
    buf: &mut [u8],
) -> Result<bool, CodecError> {
    use futures::io::AsyncReadExt as _;

    let mut filled = 0;
    while filled < buf.len() {
        let count = reader.read(&mut buf[filled..]).await?;
        if count == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CodecError::UnexpectedEndOfStream);
        }
        filled += count;
    }
    Ok(true)
}


#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::test_utils::SharedBuf;
    use super::*;

    fn reader_over(data: Vec<u8>) -> BoxReader {
        Box::new(futures::io::Cursor::new(data))
    }

    #[test_strategy::proptest]
    fn header_round_trip_binary(header: Header) {
        let data = CodecKind::Binary.encode(&header).unwrap();
        let decoded = CodecKind::Binary.decode::<Header>(&data).unwrap();
        prop_assert_eq!(decoded, header);
    }

    #[test_strategy::proptest]
    fn header_round_trip_json(header: Header) {
        let data = CodecKind::Json.encode(&header).unwrap();
        let decoded = CodecKind::Json.decode::<Header>(&data).unwrap();
        prop_assert_eq!(decoded, header);
    }

    async fn frame_round_trip(constructor: NewCodecFn, kind: CodecKind) {
        let buf = SharedBuf::default();
        let (_, mut write) = constructor(reader_over(Vec::new()), Box::new(buf.clone()));

        let header = Header::request("Arith.Add", 7);
        let body = kind.encode(&(3u32, 4u32)).unwrap();
        write.write(&header, &body).await.unwrap();
        write
            .write(&Header::request("Arith.Add", 8), &body)
            .await
            .unwrap();

        let (mut read, _) = constructor(reader_over(buf.take()), Box::new(SharedBuf::default()));
        assert_eq!(read.kind(), kind);
        let decoded_header = read.read_header().await.unwrap().unwrap();
        assert_eq!(decoded_header, header);
        let decoded_body = read.read_body().await.unwrap();
        let value = kind.decode::<(u32, u32)>(&decoded_body).unwrap();
        assert_eq!(value, (3, 4));

        // The second frame is still aligned even if its body is discarded.
        let second = read.read_header().await.unwrap().unwrap();
        assert_eq!(second.seq, 8);
        read.read_body().await.unwrap();
        assert_eq!(read.read_header().await.unwrap(), None);
    }

    #[async_std::test]
    async fn binary_frame_round_trip() {
        frame_round_trip(super::binary::new, CodecKind::Binary).await;
    }

    #[async_std::test]
    async fn json_frame_round_trip() {
        frame_round_trip(super::json::new, CodecKind::Json).await;
    }

    #[async_std::test]
    async fn binary_truncated_frame() {
        let buf = SharedBuf::default();
        let (_, mut write) = binary::new(reader_over(Vec::new()), Box::new(buf.clone()));
        write
            .write(&Header::request("Echo.Echo", 1), b"xx")
            .await
            .unwrap();

        let mut data = buf.take();
        data.truncate(data.len() - 1);
        let (mut read, _) = binary::new(reader_over(data), Box::new(SharedBuf::default()));
        read.read_header().await.unwrap().unwrap();
        match read.read_body().await.unwrap_err() {
            CodecError::UnexpectedEndOfStream => (),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[async_std::test]
    async fn json_malformed_header() {
        let (mut read, _) = json::new(
            reader_over(b"{not json}\n".to_vec()),
            Box::new(SharedBuf::default()),
        );
        match read.read_header().await.unwrap_err() {
            CodecError::Decode(_) => (),
            err => panic!("unexpected error {:?}", err),
        }
    }
}
