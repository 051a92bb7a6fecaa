//! Directory server integration tests over a real loopback listener.

use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use futures::sink::SinkExt;

use shoal::config::{ServerConfig, ServerGeneral};
use shoal::protocol::MessageCodec;
use shoal::server::{Directory, DirectoryHandle};
use shoal::ShoalResult;

type Client = Framed<TcpStream, MessageCodec>;

struct TestServer {
    handle: DirectoryHandle,
    addr: SocketAddr,
    task: JoinHandle<ShoalResult<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let config = ServerConfig {
            general: ServerGeneral {
                bind_address: "127.0.0.1:0".into(),
                database_path: dir.path().join("index.db"),
            },
        };

        let directory = Directory::bind(&config).unwrap();
        let addr = directory.local_addr().unwrap();
        let handle = directory.handle();
        let task = tokio::spawn(directory.up());

        Self {
            handle,
            addr,
            task,
            _dir: dir,
        }
    }

    async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }

    /// Polls until the hostname is no longer listed as active.
    async fn wait_for_departure(&self, hostname: &str) {
        for _ in 0..40 {
            if self.handle.ping(hostname).is_empty() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("session {} never deregistered", hostname);
    }
}

async fn connect(addr: SocketAddr) -> Client {
    Framed::new(TcpStream::connect(addr).await.unwrap(), MessageCodec)
}

async fn send_recv(client: &mut Client, message: Value) -> Value {
    client.send(&message).await.unwrap();
    client
        .next()
        .await
        .expect("server closed the stream")
        .expect("reply frame decodes")
}

async fn connect_with_hello(addr: SocketAddr, hostname: &str, p2p_port: u16) -> Client {
    let mut client = connect(addr).await;

    let reply = send_recv(
        &mut client,
        json!({"action": "hello", "hostname": hostname, "p2p_port": p2p_port}),
    )
    .await;

    assert_eq!(reply["status"], "success");
    assert_eq!(reply["message"], "Hello from server!");

    client
}

#[tokio::test]
async fn first_message_must_be_hello() {
    let server = TestServer::start().await;

    let mut client = connect(server.addr).await;
    let reply = send_recv(
        &mut client,
        json!({"action": "publish", "lname": "/tmp/a.txt", "fname": "a.txt"}),
    )
    .await;

    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Expected hello message");

    // Session is gone; no active row was created.
    assert!(client.next().await.is_none());
    assert!(server.handle.list_active().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn hello_with_missing_fields_is_rejected() {
    let server = TestServer::start().await;

    let mut client = connect(server.addr).await;
    let reply = send_recv(&mut client, json!({"action": "hello", "hostname": "alpha"})).await;

    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Expected hello message");
    assert!(client.next().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn publish_fetch_roundtrip_with_teardown() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    let reply = send_recv(
        &mut alpha,
        json!({
            "action": "publish",
            "lname": "/tmp/a.txt",
            "fname": "a.txt",
            "file_size": 12,
            "last_modified": "2024-11-04T00:00:00Z",
        }),
    )
    .await;
    assert_eq!(reply["status"], "created");
    assert_eq!(reply["result"], "inserted");

    let mut beta = connect_with_hello(server.addr, "beta", 5000).await;

    let reply = send_recv(&mut beta, json!({"action": "fetch", "fname": "a.txt"})).await;
    assert_eq!(reply["status"], "success");

    let peer_list = reply["peer_list"].as_array().unwrap();
    assert_eq!(peer_list.len(), 1);
    assert_eq!(
        peer_list[0],
        json!({
            "fname": "a.txt",
            "hostname": "alpha",
            "ip": "127.0.0.1",
            "port": 4000,
            "lname": "/tmp/a.txt",
            "file_size": 12,
            "last_modified": "2024-11-04T00:00:00Z",
        }),
    );

    // Alpha leaves; its rows and active entry vanish together.
    drop(alpha);
    server.wait_for_departure("alpha").await;

    let reply = send_recv(&mut beta, json!({"action": "fetch", "fname": "a.txt"})).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["peer_list"], json!([]));
    assert!(server.handle.discover("alpha").unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn republish_conflict_then_overwrite() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    let reply = send_recv(
        &mut alpha,
        json!({"action": "publish", "lname": "/a/r.pdf", "fname": "r.pdf"}),
    )
    .await;
    assert_eq!(reply["status"], "created");

    let reply = send_recv(
        &mut alpha,
        json!({
            "action": "publish",
            "lname": "/b/r.pdf",
            "fname": "r.pdf",
            "allow_overwrite": false,
        }),
    )
    .await;
    assert_eq!(reply["status"], "conflict");
    assert_eq!(reply["existing_lname"], "/a/r.pdf");

    let reply = send_recv(
        &mut alpha,
        json!({
            "action": "publish",
            "lname": "/b/r.pdf",
            "fname": "r.pdf",
            "allow_overwrite": true,
        }),
    )
    .await;
    assert_eq!(reply["status"], "updated");
    assert_eq!(reply["result"], "updated");

    // One row, carrying the new path.
    let reply = send_recv(&mut alpha, json!({"action": "fetch", "fname": "r.pdf"})).await;
    let peer_list = reply["peer_list"].as_array().unwrap();
    assert_eq!(peer_list.len(), 1);
    assert_eq!(peer_list[0]["lname"], "/b/r.pdf");

    server.stop().await;
}

#[tokio::test]
async fn republish_unchanged_is_reported() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    let publish = json!({
        "action": "publish",
        "lname": "/tmp/a.txt",
        "fname": "a.txt",
        "file_size": 12,
        "last_modified": "2024-11-04T00:00:00Z",
    });

    let reply = send_recv(&mut alpha, publish.clone()).await;
    assert_eq!(reply["status"], "created");

    let reply = send_recv(&mut alpha, publish).await;
    assert_eq!(reply["status"], "unchanged");

    // Same path with changed metadata updates in place instead.
    let reply = send_recv(
        &mut alpha,
        json!({
            "action": "publish",
            "lname": "/tmp/a.txt",
            "fname": "a.txt",
            "file_size": 13,
            "last_modified": "2024-11-05T00:00:00Z",
        }),
    )
    .await;
    assert_eq!(reply["status"], "updated");

    server.stop().await;
}

#[tokio::test]
async fn missing_fields_and_unknown_actions_keep_the_session() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    let reply = send_recv(&mut alpha, json!({"action": "publish", "fname": "a.txt"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Missing lname or fname");

    let reply = send_recv(&mut alpha, json!({"action": "fetch"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Missing fname");

    let reply = send_recv(&mut alpha, json!({"action": "frobnicate"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Invalid action");

    // A data-stream action has no business on the control stream.
    let reply = send_recv(&mut alpha, json!({"action": "get_file", "lname": "/tmp/a"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Invalid action");

    // The session survived all of it.
    let reply = send_recv(&mut alpha, json!({"action": "ping"})).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["message"], "pong");

    server.stop().await;
}

#[tokio::test]
async fn non_object_body_keeps_the_session() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    alpha.send(&json!(["not", "an", "object"])).await.unwrap();
    let reply = alpha.next().await.unwrap().unwrap();
    assert_eq!(reply["status"], "error");

    let reply = send_recv(&mut alpha, json!({"action": "ping"})).await;
    assert_eq!(reply["message"], "pong");

    server.stop().await;
}

#[tokio::test]
async fn shared_files_are_aggregated_per_alias() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;
    let mut beta = connect_with_hello(server.addr, "beta", 5000).await;

    send_recv(
        &mut alpha,
        json!({
            "action": "publish",
            "lname": "/a/a.txt",
            "fname": "a.txt",
            "file_size": 10,
            "last_modified": "2024-11-03T00:00:00Z",
        }),
    )
    .await;
    send_recv(
        &mut beta,
        json!({
            "action": "publish",
            "lname": "/b/a.txt",
            "fname": "a.txt",
            "file_size": 20,
            "last_modified": "2024-11-04T00:00:00Z",
        }),
    )
    .await;

    let reply = send_recv(&mut alpha, json!({"action": "list_shared_files"})).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(
        reply["files"],
        json!([{
            "fname": "a.txt",
            "peer_count": 2,
            "file_size": 20,
            "last_modified": "2024-11-04T00:00:00Z",
        }]),
    );

    server.stop().await;
}

#[tokio::test]
async fn admin_interface_tracks_sessions_and_files() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;
    let _alpha2 = connect_with_hello(server.addr, "alpha", 4001).await;
    let _beta = connect_with_hello(server.addr, "beta", 5000).await;

    send_recv(
        &mut alpha,
        json!({"action": "publish", "lname": "/a/z.txt", "fname": "z.txt"}),
    )
    .await;
    send_recv(
        &mut alpha,
        json!({"action": "publish", "lname": "/a/a.txt", "fname": "a.txt"}),
    )
    .await;

    assert_eq!(
        server.handle.discover("alpha").unwrap(),
        vec!["a.txt".to_string(), "z.txt".to_string()],
    );
    assert!(server.handle.discover("gamma").unwrap().is_empty());

    // Two simultaneous instances of one hostname.
    let mut online = server.handle.ping("alpha");
    online.sort();
    assert_eq!(
        online,
        vec![("127.0.0.1".to_string(), 4000), ("127.0.0.1".to_string(), 4001)],
    );
    assert!(server.handle.ping("gamma").is_empty());

    let active = server.handle.list_active();
    assert_eq!(active.len(), 3);
    assert_eq!(active[0].0, "alpha");
    assert_eq!(active[1], ("alpha".to_string(), "127.0.0.1".to_string(), 4001));
    assert_eq!(active[2].0, "beta");

    server.stop().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_drains_sessions() {
    let server = TestServer::start().await;

    let mut alpha = connect_with_hello(server.addr, "alpha", 4000).await;

    server.handle.shutdown();
    server.handle.shutdown();

    // The session winds down on its own; the stream ends without a reply.
    assert!(alpha.next().await.is_none());

    server.wait_for_departure("alpha").await;
    let _ = server.task.await;
}
