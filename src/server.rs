//! RPC server: accepts connections, reads request frames in arrival order
//! and dispatches each invocation on its own task.

use std::sync::Arc;

use futures::prelude::*;

use crate::codec::{
    BoxReader, BoxWriter, CodecError, CodecKind, CodecRead, CodecRegistry, CodecWrite,
};
use crate::handshake::{self, ProtocolError};
use crate::header::Header;
use crate::service::{RegisterError, Service, ServiceRegistry};

type SharedWrite = Arc<async_std::sync::Mutex<Box<dyn CodecWrite>>>;

/// RPC server. Cheap to clone; all clones share the same service and codec
/// registries.
#[derive(Clone, Debug, Default)]
pub struct Server {
    services: Arc<ServiceRegistry>,
    codecs: Arc<CodecRegistry>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server with a custom codec registry.
    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        Self {
            services: Arc::new(ServiceRegistry::new()),
            codecs: Arc::new(codecs),
        }
    }

    /// Registers a service. All registration happens before serving.
    pub fn register(&self, service: Service) -> Result<(), RegisterError> {
        self.services.register(service)
    }

    /// Accept loop: serves every incoming connection on its own task.
    pub async fn serve(&self, listener: async_std::net::TcpListener) -> anyhow::Result<()> {
        let mut incoming = listener.incoming();
        while let Some(stream) = incoming.next().await {
            let stream = stream?;
            let server = self.clone();
            async_std::task::spawn(async move {
                if let Err(error) = server.serve_connection(stream).await {
                    tracing::warn!(?error, "connection closed with error");
                }
            });
        }
        Ok(())
    }

    /// Serves one TCP connection to completion.
    pub async fn serve_connection(&self, stream: async_std::net::TcpStream) -> anyhow::Result<()> {
        let reader = Box::new(futures::io::BufReader::new(stream.clone()));
        self.serve_duplex(reader, Box::new(stream)).await
    }

    /// Serves one duplex byte stream: options handshake, then request frames
    /// until the stream ends.
    pub async fn serve_duplex(
        &self,
        mut reader: BoxReader,
        writer: BoxWriter,
    ) -> anyhow::Result<()> {
        let options = handshake::receive_options(&mut reader).await?;
        let constructor =
            self.codecs
                .get(&options.codec_type)
                .ok_or_else(|| ProtocolError::UnknownCodec {
                    tag: options.codec_type.clone(),
                })?;
        tracing::debug!(codec = %options.codec_type, "connection established");
        let (codec_read, codec_write) = constructor(reader, writer);
        self.handle(codec_read, codec_write).await
    }

    async fn handle(
        &self,
        mut codec_read: Box<dyn CodecRead>,
        codec_write: Box<dyn CodecWrite>,
    ) -> anyhow::Result<()> {
        let kind = codec_read.kind();
        let sending: SharedWrite = Arc::new(async_std::sync::Mutex::new(codec_write));
        let mut outstanding: Vec<async_std::task::JoinHandle<()>> = Vec::new();

        let result = loop {
            let header = match codec_read.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break Ok(()),
                Err(error) => break Err(anyhow::Error::new(error)),
            };
            tracing::trace!(?header, "request");

            // The body frame is consumed unconditionally so one bad request
            // cannot desynchronize the ones behind it.
            let body = match codec_read.read_body().await {
                Ok(body) => body,
                Err(error) => break Err(anyhow::Error::new(error)),
            };

            let descriptor = match header.split_service_method() {
                Ok((service, method)) => self
                    .services
                    .lookup(service, method)
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            let descriptor = match descriptor {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    if let Err(error) =
                        Self::send_error_response(&sending, &header, error, kind).await
                    {
                        break Err(anyhow::Error::new(error));
                    }
                    continue;
                }
            };

            let argument = match descriptor.decode_argument(kind, &body) {
                Ok(argument) => argument,
                Err(error) => {
                    let text = format!("invalid request body: {}", error);
                    if let Err(error) =
                        Self::send_error_response(&sending, &header, text, kind).await
                    {
                        break Err(anyhow::Error::new(error));
                    }
                    continue;
                }
            };

            // Dispatch on its own task so a slow handler never blocks
            // reading the requests behind it.
            let sending = Arc::clone(&sending);
            outstanding.push(async_std::task::spawn(async move {
                let mut reply = descriptor.new_reply();
                let (error, body) = match descriptor.invoke(argument, &mut reply) {
                    Ok(()) => match descriptor.encode_reply(kind, &reply) {
                        Ok(body) => (String::new(), body),
                        Err(err) => (
                            format!("failed to encode reply: {}", err),
                            empty_body(kind),
                        ),
                    },
                    Err(err) => (err.to_string(), empty_body(kind)),
                };
                let response = Header {
                    service_method: header.service_method,
                    seq: header.seq,
                    error,
                };
                let mut codec = sending.lock().await;
                if let Err(error) = codec.write(&response, &body).await {
                    tracing::warn!(seq = response.seq, ?error, "failed to send response");
                }
            }));
        };

        // Every dispatched request still gets its response before the
        // connection closes, even when reading stopped early.
        futures::future::join_all(outstanding).await;
        let mut codec_write = sending.lock().await;
        let _ = codec_write.close().await;
        result
    }

    async fn send_error_response(
        sending: &SharedWrite,
        request: &Header,
        error: String,
        kind: CodecKind,
    ) -> Result<(), CodecError> {
        tracing::debug!(seq = request.seq, %error, "request failed");
        let response = Header {
            service_method: request.service_method.clone(),
            seq: request.seq,
            error,
        };
        let mut codec = sending.lock().await;
        codec.write(&response, &empty_body(kind)).await
    }
}

/// Placeholder body for responses that carry only a header error. Still one
/// well-formed encoded value, so the client's body read stays aligned.
fn empty_body(kind: CodecKind) -> Vec<u8> {
    kind.encode(&()).unwrap_or_default()
}
