//! Minimal request/response RPC over a single duplex connection.
//!
//! A server registers services whose methods take an argument and fill in a
//! reply; clients invoke them by `"Service.Method"` name, synchronously with
//! [Client::call] or asynchronously with [Client::go]. Concurrent calls are
//! multiplexed over the one connection and correlated by sequence number.
//! The wire format for headers and bodies is negotiated per connection
//! through a one-time JSON preamble; binary (bincode) and JSON codecs are
//! built in and more can be added through [CodecRegistry].
mod client;
mod codec;
mod handshake;
mod header;
mod server;
mod service;

#[doc(inline)]
pub use client::{completion_queue, Call, Client, CompletionQueue, RpcError};

#[doc(inline)]
pub use codec::{
    BoxReader, BoxWriter, CodecError, CodecKind, CodecRead, CodecRegistry, CodecWrite, NewCodecFn,
    BINARY_CODEC_TAG, JSON_CODEC_TAG, MAX_FRAME_LEN,
};

#[doc(inline)]
pub use handshake::{Options, ProtocolError, MAGIC_NUMBER};

#[doc(inline)]
pub use header::{Header, InvalidServiceMethod};

#[doc(inline)]
pub use server::Server;

#[doc(inline)]
pub use service::{
    LookupError, MethodDescriptor, RegisterError, Service, ServiceBuilder, ServiceRegistry,
};
