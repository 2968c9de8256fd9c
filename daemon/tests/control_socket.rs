//! Control socket tests against a server bound in a temp dir, with images
//! served by an in-memory registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cont_core::config::DaemonConfig;
use cont_daemon::{CommandHandler, ControlServer, DaemonContext};
use cont_runtime::oci::{AnonymousCredentials, Digest, ImageReference, MemoryTransport};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const APP: &str = "example.registry/library/app:latest";

struct TestDaemon {
    _tmp: TempDir,
    socket: PathBuf,
    store_dir: PathBuf,
    transport: Arc<MemoryTransport>,
    shutdown: CancellationToken,
    task: JoinHandle<cont_core::Result<()>>,
}

impl TestDaemon {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(customize: impl FnOnce(&mut DaemonConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = DaemonConfig {
            socket_path: tmp.path().join("run/cont.sock"),
            store_dir: tmp.path().join("store"),
            default_image: APP.to_string(),
            max_line_bytes: 64,
            shutdown_grace_secs: 5,
            ..Default::default()
        };
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config.containers.insert(
            "ghost".to_string(),
            "example.registry/library/ghost:1".to_string(),
        );
        customize(&mut config);

        let transport = Arc::new(MemoryTransport::new());
        transport.publish_image(&ImageReference::parse(APP).unwrap(), &[b"layer-1", b"layer-2"]);

        let socket = config.socket_path.clone();
        let store_dir = config.store_dir.clone();
        let server = ControlServer::from_config(&config).unwrap();
        let context = DaemonContext::with_transport(
            config,
            transport.clone(),
            Arc::new(AnonymousCredentials),
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            server.serve(CommandHandler::new(Arc::new(context)), shutdown.clone()),
        );

        Self {
            _tmp: tmp,
            socket,
            store_dir,
            transport,
            shutdown,
            task,
        }
    }

    async fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.socket).await.unwrap();
        let (read, write) = stream.into_split();
        Client {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn stop(self) -> PathBuf {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.socket
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches('\n').to_string())
    }

    async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await.unwrap()
    }
}

#[tokio::test]
async fn test_socket_mode_and_teardown() {
    let daemon = TestDaemon::start().await;
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&daemon.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);

    let socket = daemon.stop().await;
    assert!(!socket.exists());
    assert!(UnixStream::connect(&socket).await.is_err());
}

#[tokio::test]
async fn test_responses_are_ordered() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let requests = ["hello", "stop web", "start foo bar", "status?", "stop", "bye"];
    for line in requests {
        client.send(line).await;
    }

    let mut responses = Vec::new();
    for _ in requests {
        responses.push(client.recv().await.unwrap());
    }

    assert_eq!(responses[0], "Received: hello");
    assert_eq!(responses[1], "stopping container web");
    assert!(responses[2].starts_with("error: malformed: "));
    assert_eq!(responses[3], "Received: status?");
    assert!(responses[4].starts_with("error: malformed: "));
    assert_eq!(responses[5], "Received: bye");

    // Malformed commands take no action
    assert_eq!(daemon.transport.fetch_count(), 0);
    daemon.stop().await;
}

#[tokio::test]
async fn test_start_pulls_image_once() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let line = client.request("start mycontainer").await;
    assert!(line.starts_with("starting container mycontainer"), "{line}");
    assert!(line.contains(APP), "{line}");
    assert!(line.contains(&daemon.store_dir.display().to_string()), "{line}");
    assert_eq!(daemon.transport.fetch_count(), 4);

    for layer in [&b"layer-1"[..], &b"layer-2"[..]] {
        let blob = daemon
            .store_dir
            .join("blobs/sha256")
            .join(Digest::of(layer).hex());
        assert!(blob.is_file());
    }

    // Served from the store the second time
    let line = client.request("start other").await;
    assert!(line.starts_with("starting container other"), "{line}");
    assert_eq!(daemon.transport.fetch_count(), 4);
    daemon.stop().await;
}

#[tokio::test]
async fn test_pull_failure_is_reported() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let line = client.request("start ghost").await;
    assert!(line.starts_with("error: resolution: "), "{line}");

    // The session stays usable
    assert_eq!(client.request("ping").await, "Received: ping");
    daemon.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_share_one_copy() {
    let daemon = TestDaemon::start().await;
    daemon.transport.set_fetch_delay(Duration::from_millis(20));

    let mut a = daemon.connect().await;
    let mut b = daemon.connect().await;
    let (ra, rb) = tokio::join!(a.request("start alpha"), b.request("start beta"));

    assert!(ra.starts_with("starting container alpha"), "{ra}");
    assert!(rb.starts_with("starting container beta"), "{rb}");
    assert_eq!(daemon.transport.fetch_count(), 4);
    daemon.stop().await;
}

#[tokio::test]
async fn test_overlong_line_is_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let line = client.request(&"x".repeat(200)).await;
    assert!(line.starts_with("error: malformed: "), "{line}");
    assert_eq!(client.request("after").await, "Received: after");
    daemon.stop().await;
}

#[tokio::test]
async fn test_disconnect_does_not_affect_others() {
    let daemon = TestDaemon::start().await;

    let mut first = daemon.connect().await;
    assert_eq!(first.request("one").await, "Received: one");
    drop(first);

    let mut second = daemon.connect().await;
    assert_eq!(second.request("two").await, "Received: two");
    daemon.stop().await;
}

#[tokio::test]
async fn test_pull_completes_after_client_disconnects() {
    let daemon = TestDaemon::start().await;
    daemon.transport.set_fetch_delay(Duration::from_millis(100));

    let mut client = daemon.connect().await;
    client.send("start mycontainer").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    let index = daemon.store_dir.join("index.json");
    let tagged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let contents = tokio::fs::read_to_string(&index).await.unwrap_or_default();
            if contents.contains(APP) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(tagged.is_ok(), "image was never tagged");
    assert_eq!(daemon.transport.fetch_count(), 4);

    // Served from the store for the next client
    let mut other = daemon.connect().await;
    let line = other.request("start again").await;
    assert!(line.starts_with("starting container again"), "{line}");
    assert_eq!(daemon.transport.fetch_count(), 4);
    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_idle_sessions() {
    let daemon = TestDaemon::start_with(|config| config.shutdown_grace_secs = 1).await;
    let mut client = daemon.connect().await;
    assert_eq!(client.request("hi").await, "Received: hi");

    daemon.shutdown.cancel();
    assert_eq!(client.recv().await, None);
    daemon.stop().await;
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let tmp = TempDir::new().unwrap();
    let stale = tmp.path().join("run/cont.sock");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"left over").unwrap();

    let daemon = TestDaemon::start_with(|config| config.socket_path = stale.clone()).await;
    let mut client = daemon.connect().await;
    assert_eq!(client.request("hi").await, "Received: hi");
    daemon.stop().await;
}
