//! Unix-socket control server.
//!
//! Accepts connections on a Unix domain socket and runs one session task per
//! connection. A session reads newline-delimited commands and writes exactly
//! one response line per command, in order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cont_core::config::DaemonConfig;
use cont_core::error::{ContError, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handler::CommandHandler;
use crate::protocol::Response;

/// Process-unique connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live control-plane session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    /// Peer process credentials, e.g. `pid=42 uid=0`
    pub remote: String,
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    fn accept(stream: &UnixStream) -> Self {
        let remote = match stream.peer_cred() {
            Ok(cred) => match cred.pid() {
                Some(pid) => format!("pid={} uid={}", pid, cred.uid()),
                None => format!("uid={}", cred.uid()),
            },
            Err(_) => "unknown".to_string(),
        };
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            opened_at: Utc::now(),
        }
    }
}

/// Removes the socket file when dropped.
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = %self.path.display(), "Removed control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                socket = %self.path.display(),
                error = %e,
                "Failed to remove control socket"
            ),
        }
    }
}

/// Control-plane server bound to a Unix socket.
pub struct ControlServer {
    listener: UnixListener,
    guard: SocketGuard,
    max_line_bytes: usize,
    shutdown_grace: Duration,
}

impl ControlServer {
    /// Bind the control socket.
    ///
    /// A stale socket file at `path` is removed first. The socket is then
    /// chmod'ed to `mode` so local clients can connect. Every failure is a
    /// listen error.
    pub fn bind(path: &Path, mode: u32) -> Result<Self> {
        let listen_error = |message: String| ContError::ListenError {
            path: path.to_path_buf(),
            message,
        };

        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(socket = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(listen_error(format!("Failed to remove stale socket: {}", e))),
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    listen_error(format!(
                        "Failed to create socket directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| listen_error(format!("Failed to bind: {}", e)))?;
        let guard = SocketGuard {
            path: path.to_path_buf(),
        };

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| listen_error(format!("Failed to set permissions {:o}: {}", mode, e)))?;

        tracing::info!(
            socket = %path.display(),
            mode = %format_args!("{:o}", mode),
            "Unix socket server started"
        );

        let defaults = DaemonConfig::default();
        Ok(Self {
            listener,
            guard,
            max_line_bytes: defaults.max_line_bytes,
            shutdown_grace: Duration::from_secs(defaults.shutdown_grace_secs),
        })
    }

    /// Bind using the socket path, mode and limits from the daemon config.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        Ok(Self::bind(&config.socket_path, config.socket_mode)?
            .with_max_line_bytes(config.max_line_bytes)
            .with_shutdown_grace(Duration::from_secs(config.shutdown_grace_secs)))
    }

    /// Longest accepted request line, excluding the newline.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// How long shutdown waits for open sessions.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.guard.path
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// On return the listener is closed and the socket file removed. Open
    /// sessions finish their current command and are given the configured
    /// grace period to end. The wait is bounded: a pull still running when
    /// the grace period expires is abandoned once the caller drops the
    /// runtime, and its partial writes are swept from `ingest/` the next time
    /// the store is opened.
    pub async fn serve(self, handler: CommandHandler, shutdown: CancellationToken) -> Result<()> {
        let ControlServer {
            listener,
            guard,
            max_line_bytes,
            shutdown_grace,
        } = self;
        let handler = Arc::new(handler);
        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let connection = Connection::accept(&stream);
                        tracing::debug!(
                            connection_id = connection.id,
                            remote = %connection.remote,
                            "Accepted connection"
                        );
                        sessions.spawn(run_session(
                            stream,
                            connection,
                            handler.clone(),
                            shutdown.clone(),
                            max_line_bytes,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        tracing::info!("Shutting down control server");
        drop(listener);
        drop(guard);

        sessions.close();
        if tokio::time::timeout(shutdown_grace, sessions.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                open_sessions = sessions.len(),
                grace_secs = shutdown_grace.as_secs(),
                "Sessions still open after shutdown grace period"
            );
        }
        Ok(())
    }
}

/// Serve one connection until EOF, an I/O error, a failed write or shutdown.
async fn run_session(
    stream: UnixStream,
    connection: Connection,
    handler: Arc<CommandHandler>,
    shutdown: CancellationToken,
    max_line_bytes: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_bytes));
    let mut responses = FramedWrite::new(write_half, LinesCodec::new());
    let mut handled: u64 = 0;
    let mut after_decode_error = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };

        let response = match next {
            // The framed reader yields a single `None` after a decode error
            // and then resumes reading.
            None if after_decode_error => {
                after_decode_error = false;
                continue;
            }
            None => break,
            Some(Ok(line)) => handler.handle(connection.id, &line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                after_decode_error = true;
                tracing::warn!(
                    connection_id = connection.id,
                    max_line_bytes,
                    "Invalid message: line too long"
                );
                Response::Error(ContError::MalformedCommand(format!(
                    "line exceeds {} bytes",
                    max_line_bytes
                )))
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::debug!(connection_id = connection.id, error = %e, "Read failed");
                break;
            }
        };

        if let Err(e) = responses.send(response.to_string()).await {
            tracing::warn!(connection_id = connection.id, error = %e, "Write failed, closing connection");
            break;
        }
        handled += 1;
    }

    let open_for = Utc::now() - connection.opened_at;
    tracing::debug!(
        connection_id = connection.id,
        remote = %connection.remote,
        commands = handled,
        open_ms = open_for.num_milliseconds(),
        "Connection closed"
    );
}
