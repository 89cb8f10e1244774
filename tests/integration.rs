//! Integration tests for pipeline-share.
//!
//! Each test binds a real server on an ephemeral loopback port and talks to
//! it through the public client API or raw framed I/O.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::IgnoredAny;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use pipeline_share::codec::MsgPackCodec;
use pipeline_share::pipeline::{read_snapshot, write_snapshot, Pipeline, PipelineLoader};
use pipeline_share::protocol::{
    build_frame, Header, Request, RequestEnvelope, Response, NOT_INITIALIZED_MESSAGE, SHUTDOWN_MESSAGE,
};
use pipeline_share::transport::{recv_frame, send_frame, Transfer, TransferConfig};
use pipeline_share::{Client, ClientBuilder, Server, ServerConfig, ServerState, ShareError};

async fn start_server<O>(
    state: Arc<ServerState<O>>,
    config: ServerConfig,
) -> (SocketAddr, JoinHandle<pipeline_share::Result<()>>)
where
    O: Serialize + Send + Sync + 'static,
{
    let server = Server::bind(config.host("127.0.0.1").port(0), state)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    (addr, tokio::spawn(server.serve()))
}

fn client_for(addr: SocketAddr) -> ClientBuilder {
    Client::builder()
        .host("127.0.0.1")
        .port(addr.port())
        .retry_delay(Duration::from_millis(50))
}

fn blob(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

/// Staging files are removed when the transfer call returns, which on the
/// server side can trail the client's receive slightly.
async fn wait_until_empty(dir: &Path) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = std::fs::read_dir(dir).unwrap().count();
        if remaining == 0 {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} staging files left in {}",
            remaining,
            dir.display()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Accepts `limit` bytes, then fails every write.
struct FailingWriter {
    accepted: usize,
    limit: usize,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.accepted >= self.limit {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer went away",
            )));
        }
        let n = buf.len().min(self.limit - self.accepted);
        self.accepted += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_fetch_payload_larger_than_chunk() {
    let staging = tempfile::tempdir().unwrap();
    let transfer = TransferConfig::default()
        .chunk_size(64 * 1024)
        .staging_dir(staging.path());
    let object = blob(3 * 1024 * 1024 + 17);

    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, _server) =
        start_server(state, ServerConfig::default().transfer(transfer.clone())).await;

    let fetched: Bytes = client_for(addr)
        .transfer(transfer)
        .build()
        .fetch()
        .await
        .unwrap();

    assert_eq!(fetched, object);
    wait_until_empty(staging.path()).await;
}

#[tokio::test]
async fn test_fetch_empty_object() {
    let state = Arc::new(ServerState::with_object(Bytes::new()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let fetched: Bytes = client_for(addr).build().fetch().await.unwrap();
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn test_fetch_pipeline_from_weights_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("model.bin");
    std::fs::write(&weights, blob(10_000)).unwrap();

    let pipeline = PipelineLoader::new(&weights).lang_code("b").load().unwrap();
    let snapshot = dir.path().join("pipeline.snapshot");
    write_snapshot(&snapshot, &pipeline).unwrap();
    let restored = read_snapshot(&snapshot).unwrap();
    assert_eq!(restored, pipeline);

    let state = Arc::new(ServerState::with_object(restored));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let fetched: Pipeline = client_for(addr).build().fetch().await.unwrap();
    assert_eq!(fetched, pipeline);
    assert_eq!(fetched.weights_len(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_get_identical_copies() {
    let object = blob(256 * 1024);
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let client = client_for(addr).build();
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.fetch::<Bytes>().await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), object);
    }
}

#[tokio::test]
async fn test_requests_on_one_connection_answered_in_order() {
    let object = Bytes::from_static(b"shared");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, server) = start_server(state, ServerConfig::default()).await;

    let mut connection = client_for(addr).build().connect().await.unwrap();

    let first: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(first.into_payload().unwrap(), object);

    let second: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(second.into_payload().unwrap(), object);

    let ack: Response<IgnoredAny> = connection.request(Request::Shutdown).await.unwrap();
    match ack {
        Response::Success { message, .. } => assert_eq!(message.as_deref(), Some(SHUTDOWN_MESSAGE)),
        other => panic!("expected shutdown ack, got {:?}", other),
    }

    // The handler closes the connection after acknowledging shutdown.
    assert!(connection.request::<Bytes>(Request::GetObject).await.is_err());

    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("accept loop should stop after shutdown")
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_leaves_open_connections_serving() {
    let object = Bytes::from_static(b"still here");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, server) = start_server(state.clone(), ServerConfig::default()).await;

    let client = client_for(addr).build();
    let mut survivor = client.connect().await.unwrap();

    let message = client.shutdown_server().await.unwrap();
    assert_eq!(message.as_deref(), Some(SHUTDOWN_MESSAGE));
    assert!(!state.is_running());

    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let response: Response<Bytes> = survivor.request(Request::GetObject).await.unwrap();
    assert_eq!(response.into_payload().unwrap(), object);
}

#[tokio::test]
async fn test_shutdown_handle_stops_accept_loop() {
    let state = Arc::new(ServerState::with_object(Bytes::new()));
    let (addr, server) = start_server(state.clone(), ServerConfig::default()).await;

    state.shutdown_handle().shutdown();

    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_retries_exhausted_against_closed_port() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let delay = Duration::from_millis(50);
    let client = Client::builder()
        .host("127.0.0.1")
        .port(port)
        .max_retries(3)
        .retry_delay(delay)
        .connect_timeout(Duration::from_millis(500))
        .build();

    let started = Instant::now();
    let err = client.fetch::<Bytes>().await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ShareError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    // Two pauses between three attempts, none after the last.
    assert!(elapsed >= delay * 2);
    assert!(elapsed < delay * 3 + Duration::from_millis(1500));
}

#[tokio::test]
async fn test_fetch_makes_exactly_max_retries_attempts() {
    // Accepts and immediately drops every connection.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let err = client_for(addr)
        .max_retries(3)
        .connect_timeout(Duration::from_millis(500))
        .build()
        .fetch::<Bytes>()
        .await
        .unwrap_err();
    assert!(matches!(err, ShareError::RetriesExhausted { attempts: 3, .. }));

    // Every attempt completed its handshake before fetch returned; give the
    // accept task time to observe the backlog, then check nothing extra came.
    let deadline = Instant::now() + Duration::from_secs(2);
    while accepted.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[test]
fn test_client_binary_exits_nonzero_when_retries_exhausted() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = Command::new(env!("CARGO_BIN_EXE_pipeline-client"))
        .args(["--host", "127.0.0.1", "--port", &port.to_string(), "--timeout", "0.5"])
        .args(["fetch", "--retries", "2", "--retry-delay", "0.05"])
        .env_remove("PIPELINE_SHARE_HOST")
        .env_remove("PIPELINE_SHARE_PORT")
        .env_remove("PIPELINE_SHARE_RETRIES")
        .env_remove("PIPELINE_SHARE_STAGING_DIR")
        .env("RUST_LOG", "off")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_get_object_before_install_is_error() {
    let state: Arc<ServerState<Bytes>> = Arc::new(ServerState::new());
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let mut connection = client_for(addr).build().connect().await.unwrap();
    let response: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(response, Response::error(NOT_INITIALIZED_MESSAGE));

    let err = client_for(addr)
        .max_retries(2)
        .build()
        .fetch::<Bytes>()
        .await
        .unwrap_err();
    match err {
        ShareError::RetriesExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(last_error, NOT_INITIALIZED_MESSAGE);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_succeeds_once_object_installed() {
    let state: Arc<ServerState<Bytes>> = Arc::new(ServerState::new());
    let (addr, _server) = start_server(state.clone(), ServerConfig::default()).await;

    let installer = {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            state.install(Bytes::from_static(b"late"))
        })
    };

    let fetched: Bytes = client_for(addr)
        .max_retries(20)
        .build()
        .fetch()
        .await
        .unwrap();

    assert!(installer.await.unwrap());
    assert_eq!(fetched, Bytes::from_static(b"late"));
}

#[tokio::test]
async fn test_unknown_and_untyped_requests_keep_connection_open() {
    #[derive(Serialize)]
    struct Untyped {
        hello: u8,
    }

    let object = Bytes::from_static(b"ok");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;
    let mut connection = client_for(addr).build().connect().await.unwrap();

    let unknown: Response<Bytes> = connection
        .request_raw(RequestEnvelope::with_kind("reboot"))
        .await
        .unwrap();
    match unknown {
        Response::Error { message } => assert!(message.contains("reboot")),
        other => panic!("expected error response, got {:?}", other),
    }

    let untyped: Response<Bytes> = connection
        .request_raw(Untyped { hello: 1 })
        .await
        .unwrap();
    assert!(!untyped.is_success());

    let alias: Response<Bytes> = connection
        .request_raw(RequestEnvelope::with_kind("get_pipeline"))
        .await
        .unwrap();
    assert_eq!(alias.into_payload().unwrap(), object);

    let response: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(response.into_payload().unwrap(), object);
}

#[tokio::test]
async fn test_non_string_type_keeps_connection_open() {
    #[derive(Serialize)]
    struct NumericType {
        #[serde(rename = "type")]
        kind: u32,
    }

    let object = Bytes::from_static(b"ok");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;
    let mut connection = client_for(addr).build().connect().await.unwrap();

    let rejected: Response<Bytes> = connection
        .request_raw(NumericType { kind: 5 })
        .await
        .unwrap();
    match rejected {
        Response::Error { message } => assert!(message.contains("expected a string")),
        other => panic!("expected error response, got {:?}", other),
    }

    let response: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(response.into_payload().unwrap(), object);
}

#[tokio::test]
async fn test_request_trickled_byte_by_byte() {
    let object = Bytes::from_static(b"patient");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let request = MsgPackCodec::encode(&Request::GetObject).unwrap();
    let frame = build_frame(&request, u32::MAX).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for byte in &frame {
        stream.write_all(std::slice::from_ref(byte)).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let transfer = Transfer::new(TransferConfig::default());
    let response: Response<Bytes> = transfer.recv_message(&mut stream).await.unwrap().unwrap();
    assert_eq!(response.into_payload().unwrap(), object);
}

#[tokio::test]
async fn test_undecodable_request_closes_connection() {
    let state = Arc::new(ServerState::with_object(Bytes::new()));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;
    let config = TransferConfig::default();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // 0xc1 is never used in MsgPack.
    send_frame(&mut stream, &[0xc1], &config).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), recv_frame(&mut stream, &config))
        .await
        .unwrap();
    assert!(matches!(reply, Ok(None)));
}

#[tokio::test]
async fn test_idle_connection_closed_after_request_timeout() {
    let object = Bytes::from_static(b"timely");
    let state = Arc::new(ServerState::with_object(object.clone()));
    let config = ServerConfig::default().request_timeout(Some(Duration::from_millis(100)));
    let (addr, _server) = start_server(state, config).await;

    let mut connection = client_for(addr).build().connect().await.unwrap();
    let response: Response<Bytes> = connection.request(Request::GetObject).await.unwrap();
    assert_eq!(response.into_payload().unwrap(), object);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(connection.request::<Bytes>(Request::GetObject).await.is_err());
}

#[tokio::test]
async fn test_failed_send_removes_staging_file() {
    let staging = tempfile::tempdir().unwrap();
    let transfer = Transfer::new(
        TransferConfig::default()
            .chunk_size(256)
            .staging_dir(staging.path()),
    );
    let mut writer = FailingWriter {
        accepted: 0,
        limit: 1000,
    };

    let result = transfer.send_message(&mut writer, blob(64 * 1024)).await;

    assert!(matches!(result, Err(ShareError::Io(_))));
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_truncated_receive_removes_staging_file() {
    let staging = tempfile::tempdir().unwrap();
    let transfer = Transfer::new(TransferConfig::default().staging_dir(staging.path()));

    let mut wire = Header::new(100).encode().to_vec();
    wire.extend_from_slice(&[0u8; 10]);

    let result: pipeline_share::Result<Option<Bytes>> =
        transfer.recv_message(&mut wire.as_slice()).await;

    match result {
        Err(ShareError::ConnectionClosedMidFrame { expected, received }) => {
            assert_eq!(expected, 100);
            assert_eq!(received, 10);
        }
        other => panic!("expected ConnectionClosedMidFrame, got {:?}", other),
    }
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_oversized_response_is_rejected_by_client() {
    let state = Arc::new(ServerState::with_object(blob(4096)));
    let (addr, _server) = start_server(state, ServerConfig::default()).await;

    let err = client_for(addr)
        .max_retries(1)
        .transfer(TransferConfig::default().max_payload_size(1024))
        .build()
        .fetch::<Bytes>()
        .await
        .unwrap_err();

    match err {
        ShareError::RetriesExhausted { last_error, .. } => {
            assert!(last_error.contains("exceeds maximum"), "{}", last_error)
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}
