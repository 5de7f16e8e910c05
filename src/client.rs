//! RPC client: multiplexes concurrent calls over one connection and
//! correlates responses by sequence number.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::prelude::*;

use crate::codec::{BoxReader, BoxWriter, CodecError, CodecKind, CodecRead, CodecRegistry, CodecWrite};
use crate::handshake::{self, Options, ProtocolError};
use crate::header::Header;

/// Error resolving a single call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The client was closed by [Client::close].
    #[error("client is closed")]
    Closed,
    /// The connection was lost. Synthesized once per connection loss and
    /// delivered to every call that was still pending.
    #[error("connection is shut down")]
    Shutdown,
    /// The remote method returned an error. Only its text survives the wire.
    #[error("{0}")]
    Remote(String),
    #[error("failed to encode call argument")]
    Encode(#[source] CodecError),
    #[error("failed to send call")]
    Send(#[source] CodecError),
    #[error("failed to decode call reply")]
    Decode(#[source] CodecError),
    #[error("reply storage type mismatch")]
    ReplyTypeMismatch,
}

/// One RPC in flight. Delivered back on its completion queue once resolved,
/// at which point ownership returns to the caller.
pub struct Call {
    service_method: String,
    seq: u64,
    argument: Vec<u8>,
    reply: Box<dyn ReplySlot>,
    error: Option<RpcError>,
}

impl Call {
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Sequence number assigned when the call was registered.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    /// Consumes the call and returns its typed reply, or the error it
    /// resolved with.
    pub fn result<R: 'static>(self) -> Result<R, RpcError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.reply
            .into_any()
            .downcast::<R>()
            .map(|reply| *reply)
            .map_err(|_| RpcError::ReplyTypeMismatch)
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("service_method", &self.service_method)
            .field("seq", &self.seq)
            .field("error", &self.error)
            .finish()
    }
}

trait ReplySlot: Send {
    fn decode(&mut self, kind: CodecKind, data: &[u8]) -> Result<(), CodecError>;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

struct TypedReply<R>(R);

impl<R> ReplySlot for TypedReply<R>
where
    R: serde::de::DeserializeOwned + Send + 'static,
{
    fn decode(&mut self, kind: CodecKind, data: &[u8]) -> Result<(), CodecError> {
        self.0 = kind.decode(data)?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        Box::new(self.0)
    }
}

/// Completion side of the queue a resolved [Call] is delivered on.
///
/// Cloneable so several calls can share one queue. Carries its capacity so
/// [Client::go] can reject unbuffered queues, which would deadlock delivery.
#[derive(Clone)]
pub struct CompletionQueue {
    sender: mpsc::Sender<Call>,
    capacity: usize,
}

/// Creates a completion queue with room for `capacity` resolved calls.
pub fn completion_queue(capacity: usize) -> (CompletionQueue, mpsc::Receiver<Call>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (CompletionQueue { sender, capacity }, receiver)
}

const DEFAULT_COMPLETION_CAPACITY: usize = 10;

struct PendingCall {
    call: Call,
    done: mpsc::Sender<Call>,
}

struct State {
    /// Next sequence number to assign. Starts at 1; 0 is reserved.
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    kind: CodecKind,
    /// Guards the write half so one frame's header and body are never
    /// interleaved with another call's. Kept separate from `state` so state
    /// reads are not serialized behind network writes.
    sending: async_std::sync::Mutex<Box<dyn CodecWrite>>,
    state: std::sync::Mutex<State>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// RPC client over one connection.
///
/// A single client may be shared between tasks; concurrent calls are
/// multiplexed and their responses matched back by sequence number.
pub struct Client {
    shared: Arc<Shared>,
    reader_handle: async_std::task::JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("kind", &self.shared.kind)
            .field("reader_handle", &self.reader_handle)
            .finish()
    }
}

impl Client {
    /// Connects to a server, performs the options handshake and spawns the
    /// background response reader.
    pub async fn dial(
        addr: impl async_std::net::ToSocketAddrs,
        options: Options,
    ) -> Result<Self, ProtocolError> {
        let stream = async_std::net::TcpStream::connect(addr).await?;
        let reader = Box::new(futures::io::BufReader::new(stream.clone()));
        Self::new(reader, Box::new(stream), options, &CodecRegistry::default()).await
    }

    /// Builds a client over an established duplex connection.
    ///
    /// Writes the options preamble first, so the server learns the body
    /// codec before any frame is sent.
    pub async fn new(
        reader: BoxReader,
        writer: BoxWriter,
        options: Options,
        codecs: &CodecRegistry,
    ) -> Result<Self, ProtocolError> {
        let constructor =
            codecs
                .get(&options.codec_type)
                .ok_or_else(|| ProtocolError::UnknownCodec {
                    tag: options.codec_type.clone(),
                })?;
        let mut writer = writer;
        handshake::send_options(&mut writer, &options).await?;
        let (codec_read, codec_write) = constructor(reader, writer);
        let shared = Arc::new(Shared {
            kind: codec_write.kind(),
            sending: async_std::sync::Mutex::new(codec_write),
            state: std::sync::Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let reader_handle =
            async_std::task::spawn(Self::receive(codec_read, Arc::clone(&shared)));
        Ok(Self {
            shared,
            reader_handle,
        })
    }

    /// True until the client is closed or the connection is lost.
    pub fn is_available(&self) -> bool {
        let state = self.shared.state();
        !state.closing && !state.shutdown
    }

    /// Issues a call asynchronously and returns as soon as the request frame
    /// is written. The resolved [Call] is delivered on `done`, or on a
    /// private queue if none is supplied.
    ///
    /// Panics if `done` has zero capacity: delivery into an unbuffered queue
    /// would block the response reader forever.
    pub async fn go<A, R>(
        &self,
        service_method: &str,
        argument: &A,
        done: Option<CompletionQueue>,
    ) -> Result<(), RpcError>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned + Default + Send + 'static,
    {
        let done = match done {
            Some(done) => {
                assert!(
                    done.capacity > 0,
                    "rpc client: completion queue has zero capacity"
                );
                done.sender
            }
            None => completion_queue(DEFAULT_COMPLETION_CAPACITY).0.sender,
        };
        let argument = self.shared.kind.encode(argument).map_err(RpcError::Encode)?;
        let call = Call {
            service_method: service_method.to_string(),
            seq: 0,
            argument,
            reply: Box::new(TypedReply(R::default())),
            error: None,
        };
        self.send(call, done).await
    }

    /// Issues a call and waits for its reply.
    pub async fn call<A, R>(&self, service_method: &str, argument: &A) -> Result<R, RpcError>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned + Default + Send + 'static,
    {
        let (done, mut receiver) = completion_queue(1);
        self.go::<A, R>(service_method, argument, Some(done)).await?;
        let call = receiver.next().await.ok_or(RpcError::Shutdown)?;
        call.result()
    }

    /// Closes the client. Calls issued afterwards fail immediately; calls
    /// already pending resolve when the connection winds down.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.shared.state();
            if state.closing {
                return Err(RpcError::Closed);
            }
            if state.shutdown {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let mut codec = self.shared.sending.lock().await;
        codec.close().await.map_err(RpcError::Send)?;
        Ok(())
    }

    /// Waits for the background reader to finish. It finishes once the
    /// connection is closed or lost.
    pub async fn join(self) {
        self.reader_handle.await
    }

    async fn send(&self, mut call: Call, done: mpsc::Sender<Call>) -> Result<(), RpcError> {
        let mut codec = self.shared.sending.lock().await;

        let (seq, header, argument) = {
            let mut state = self.shared.state();
            if state.closing {
                return Err(RpcError::Closed);
            }
            if state.shutdown {
                return Err(RpcError::Shutdown);
            }
            call.seq = state.seq;
            state.seq += 1;
            let header = Header::request(&call.service_method, call.seq);
            let argument = std::mem::take(&mut call.argument);
            let seq = call.seq;
            state.pending.insert(seq, PendingCall { call, done });
            (seq, header, argument)
        };

        if let Err(error) = codec.write(&header, &argument).await {
            // The response may have raced us here; only complete the call if
            // it is still pending.
            let removed = self.shared.state().pending.remove(&seq);
            if let Some(PendingCall { mut call, mut done }) = removed {
                call.error = Some(RpcError::Send(error));
                let _ = done.send(call).await;
            }
        }
        Ok(())
    }

    /// Background reader: one continuous task for the connection's lifetime.
    #[tracing::instrument(skip(codec, shared))]
    async fn receive(mut codec: Box<dyn CodecRead>, shared: Arc<Shared>) {
        let kind = codec.kind();
        loop {
            let header = match codec.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(?error, "failed to read response header");
                    break;
                }
            };
            tracing::trace!(?header, "received response");

            let pending = shared.state().pending.remove(&header.seq);
            match pending {
                None => {
                    // Usually means the send partially failed and the call
                    // was already evicted. The body must still be consumed.
                    tracing::warn!(seq = header.seq, "no matching pending call");
                    if let Err(error) = codec.read_body().await {
                        tracing::warn!(?error, "failed to read response body");
                        break;
                    }
                }
                Some(PendingCall { mut call, mut done }) if header.is_error() => {
                    let body = codec.read_body().await;
                    call.error = Some(RpcError::Remote(header.error));
                    let _ = done.send(call).await;
                    if let Err(error) = body {
                        tracing::warn!(?error, "failed to read response body");
                        break;
                    }
                }
                Some(PendingCall { mut call, mut done }) => match codec.read_body().await {
                    Ok(data) => {
                        if let Err(error) = call.reply.decode(kind, &data) {
                            call.error = Some(RpcError::Decode(error));
                        }
                        let _ = done.send(call).await;
                    }
                    Err(error) => {
                        call.error = Some(RpcError::Decode(error));
                        let _ = done.send(call).await;
                        break;
                    }
                },
            }
        }
        Self::terminate_calls(&shared).await;
    }

    /// Broadcasts the shutdown error to every call still pending. Takes the
    /// sending lock before the state lock, the same order as `send`.
    async fn terminate_calls(shared: &Shared) {
        let _sending = shared.sending.lock().await;
        let drained = {
            let mut state = shared.state();
            state.shutdown = true;
            state.pending.drain().map(|(_, pending)| pending).collect::<Vec<_>>()
        };
        for PendingCall { mut call, mut done } in drained {
            call.error = Some(RpcError::Shutdown);
            let _ = done.send(call).await;
        }
    }
}
