//! End-to-end client/server tests over localhost TCP.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use seqrpc::{
    completion_queue, Client, CodecKind, Options, RpcError, Server, Service, MAGIC_NUMBER,
};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

struct Arith;

fn arith_server() -> Server {
    let server = Server::new();
    server
        .register(
            Service::build("Arith", Arith)
                .unwrap()
                .method("Add", |_arith: &Arith, args: AddArgs, reply: &mut i64| {
                    *reply = args.a + args.b;
                    Ok(())
                })
                .method("Boom", |_arith: &Arith, (): (), _reply: &mut i64| {
                    Err(anyhow::anyhow!("boom"))
                })
                .method(
                    "Tag",
                    |_arith: &Arith, key: String, reply: &mut HashMap<String, u64>| {
                        reply.insert(key, 1);
                        Ok(())
                    },
                )
                .finish(),
        )
        .unwrap();
    server
}

async fn start_server() -> std::net::SocketAddr {
    let listener = async_std::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = arith_server();
    async_std::task::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn connect() -> Client {
    let addr = start_server().await;
    Client::dial(addr, Options::default()).await.unwrap()
}

#[async_std::test]
async fn arith_add() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let client = connect().await;
    let reply: i64 = client.call("Arith.Add", &AddArgs { a: 3, b: 4 }).await?;
    assert_eq!(reply, 7);
    Ok(())
}

#[async_std::test]
async fn arith_add_json_codec() -> anyhow::Result<()> {
    let addr = start_server().await;
    let client = Client::dial(addr, Options::with_codec(CodecKind::Json)).await?;
    let reply: i64 = client.call("Arith.Add", &AddArgs { a: 20, b: 22 }).await?;
    assert_eq!(reply, 42);
    Ok(())
}

#[async_std::test]
async fn remote_error_carries_text() {
    let client = connect().await;
    let err = client
        .call::<_, i64>("Arith.Boom", &())
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(text) => assert_eq!(text, "boom"),
        err => panic!("unexpected error {:?}", err),
    }
}

#[async_std::test]
async fn sequence_numbers_strictly_increase() {
    let client = connect().await;
    let count = 8;
    let (done, receiver) = completion_queue(count);
    for i in 0..count {
        let args = AddArgs { a: i as i64, b: 1 };
        client
            .go::<_, i64>("Arith.Add", &args, Some(done.clone()))
            .await
            .unwrap();
    }
    drop(done);

    let calls = receiver.collect::<Vec<_>>().await;
    assert_eq!(calls.len(), count);
    let mut seqs = calls.iter().map(|call| call.seq()).collect::<Vec<_>>();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=count as u64).collect::<Vec<_>>());
}

#[async_std::test]
async fn unknown_service_and_method() -> anyhow::Result<()> {
    let client = connect().await;

    let err = client
        .call::<_, i64>("Mult.Add", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(text) => assert_eq!(text, "can't find service 'Mult'"),
        err => panic!("unexpected error {:?}", err),
    }

    let err = client
        .call::<_, i64>("Arith.Sub", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(text) => assert_eq!(text, "can't find method 'Arith.Sub'"),
        err => panic!("unexpected error {:?}", err),
    }

    // The connection survives failed lookups.
    let reply: i64 = client.call("Arith.Add", &AddArgs { a: 1, b: 1 }).await?;
    assert_eq!(reply, 2);
    Ok(())
}

#[async_std::test]
async fn map_replies_are_independent() {
    let client = Arc::new(connect().await);

    let first = {
        let client = Arc::clone(&client);
        async_std::task::spawn(async move {
            client
                .call::<_, HashMap<String, u64>>("Arith.Tag", &"first".to_string())
                .await
                .unwrap()
        })
    };
    let second = {
        let client = Arc::clone(&client);
        async_std::task::spawn(async move {
            client
                .call::<_, HashMap<String, u64>>("Arith.Tag", &"second".to_string())
                .await
                .unwrap()
        })
    };

    let (first, second) = futures::join!(first, second);
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["first"]);
    assert_eq!(second.keys().collect::<Vec<_>>(), vec!["second"]);
}

#[async_std::test]
#[should_panic(expected = "completion queue has zero capacity")]
async fn zero_capacity_queue_is_rejected() {
    let client = connect().await;
    let (done, _receiver) = completion_queue(0);
    let _ = client
        .go::<_, i64>("Arith.Add", &AddArgs { a: 1, b: 1 }, Some(done))
        .await;
}

#[async_std::test]
async fn calls_after_close_fail_fast() {
    let client = connect().await;
    client.close().await.unwrap();

    match client.close().await.unwrap_err() {
        RpcError::Closed => (),
        err => panic!("unexpected error {:?}", err),
    }
    match client
        .call::<_, i64>("Arith.Add", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err()
    {
        RpcError::Closed => (),
        err => panic!("unexpected error {:?}", err),
    }
    assert!(!client.is_available());
}

#[async_std::test]
async fn pending_calls_complete_on_connection_loss() {
    let _ = tracing_subscriber::fmt::try_init();

    // A peer that accepts the handshake, reads three whole request frames
    // and then drops the connection without responding.
    let listener = async_std::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    async_std::task::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = futures::io::BufReader::new(stream);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        for _ in 0..3 {
            // One header value and one body value per request.
            read_binary_value(&mut reader).await;
            read_binary_value(&mut reader).await;
        }
        // Dropping the stream here severs the connection.
    });

    let client = Client::dial(addr, Options::default()).await.unwrap();
    let (done, receiver) = completion_queue(3);
    for i in 0..3 {
        client
            .go::<_, i64>("Arith.Add", &AddArgs { a: i, b: i }, Some(done.clone()))
            .await
            .unwrap();
    }
    drop(done);

    let calls = async_std::future::timeout(Duration::from_secs(5), receiver.collect::<Vec<_>>())
        .await
        .expect("pending calls did not complete");
    assert_eq!(calls.len(), 3);
    for call in calls {
        match call.result::<i64>().unwrap_err() {
            RpcError::Shutdown => (),
            err => panic!("unexpected error {:?}", err),
        }
    }
    assert!(!client.is_available());
}

async fn read_binary_value(reader: &mut (impl futures::io::AsyncRead + Unpin)) {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await.unwrap();
    let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut data).await.unwrap();
}

#[async_std::test]
async fn bad_magic_number_is_connection_fatal() {
    let addr = start_server().await;
    let options = Options {
        magic_number: 0,
        ..Options::default()
    };
    let client = Client::dial(addr, options).await.unwrap();

    let err = client
        .call::<_, i64>("Arith.Add", &AddArgs { a: 3, b: 4 })
        .await
        .unwrap_err();
    match err {
        RpcError::Shutdown | RpcError::Send(_) => (),
        err => panic!("unexpected error {:?}", err),
    }
}

#[test]
fn default_options_carry_the_magic_number() {
    assert_eq!(Options::default().magic_number, MAGIC_NUMBER);
}

#[async_std::test]
async fn unknown_codec_tag_rejected_before_io() {
    let addr = start_server().await;
    let options = Options {
        codec_type: "application/xml".to_string(),
        ..Options::default()
    };
    match Client::dial(addr, options).await {
        Err(seqrpc::ProtocolError::UnknownCodec { tag }) => {
            assert_eq!(tag, "application/xml")
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
}
