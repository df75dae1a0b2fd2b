//! UNIX socket listener for the echo backend.
//!
//! Owns the socket file, accepts connections and runs one exchange per
//! connection: read a frame, split it at the first blank line, write the body
//! back, close.

use crate::config::{Config, Dispatch};
use crate::framing::Framing;
use crate::stats::{Counters, Snapshot};
use bytes::BytesMut;
use socket2::{Domain, SockAddr, Socket, Type};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long in-flight concurrent exchanges may run after a stop request.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Fatal listener startup errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("socket '{}' is already in use: {source}", .path.display())]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to start listener on '{}': {source}", .path.display())]
    Startup { path: PathBuf, source: io::Error },
}

/// A failed exchange that was not caused by the peer going away.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// How a completed exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// The body was written back in full.
    Echoed { bytes: usize },
    /// Strict framing found no separator; nothing was written.
    Unmatched,
    /// The peer disconnected before the body could be written.
    PeerGone,
}

/// The bound socket and its file.
struct Endpoint {
    listener: Option<UnixListener>,
    path: PathBuf,
}

impl Endpoint {
    /// Close the socket and unlink its file. Safe to call more than once.
    fn close(&mut self) {
        if self.listener.take().is_some() {
            unlink_socket(&self.path);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Source of accepted connections.
pub(crate) trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl Accept for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> impl Future<Output = io::Result<UnixStream>> + Send {
        async move { UnixListener::accept(self).await.map(|(stream, _)| stream) }
    }
}

/// How accepted connections are run.
#[derive(Debug, Clone, Copy)]
struct Handling {
    dispatch: Dispatch,
    max_connections: usize,
    framing: Framing,
}

/// Requests a listener to stop. Cloneable; stopping twice is a no-op.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Echo listener bound to a UNIX domain socket.
pub struct EchoListener {
    endpoint: Endpoint,
    handling: Handling,
    counters: Arc<Counters>,
    stop: Arc<watch::Sender<bool>>,
}

impl EchoListener {
    /// Bind the socket at `config.socket` and start listening.
    ///
    /// A leftover socket file is removed first unless a live listener still
    /// answers on it.
    pub async fn start(config: &Config) -> Result<Self, ListenerError> {
        let path = config.socket.clone();

        remove_stale_socket(&path).await?;

        let listener = bind(&path, config.backlog).map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                ListenerError::Bind {
                    path: path.clone(),
                    source,
                }
            } else {
                ListenerError::Startup {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        info!(socket = %path.display(), backlog = config.backlog, "Listening");

        let (tx, _) = watch::channel(false);
        Ok(EchoListener {
            endpoint: Endpoint {
                listener: Some(listener),
                path,
            },
            handling: Handling {
                dispatch: config.dispatch,
                max_connections: config.max_connections,
                framing: config.framing,
            },
            counters: Arc::new(Counters::new()),
            stop: Arc::new(tx),
        })
    }

    pub fn path(&self) -> &Path {
        &self.endpoint.path
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop),
        }
    }

    /// Close a listener that is not serving.
    pub fn stop(mut self) {
        self.endpoint.close();
    }

    /// Serve on a background task.
    pub fn spawn(self) -> ServerHandle {
        ServerHandle {
            stop: self.stop_handle(),
            task: tokio::spawn(self.serve()),
        }
    }

    /// Accept and handle connections until stopped.
    ///
    /// Accept errors are logged and skipped. On return the socket is closed
    /// and its file removed.
    pub async fn serve(mut self) -> Snapshot {
        let mut stop_rx = self.stop.subscribe();

        if let Some(listener) = self.endpoint.listener.as_ref() {
            accept_loop(listener, self.handling, &self.counters, &mut stop_rx).await;
        }
        self.endpoint.close();

        let snapshot = self.counters.snapshot();
        info!(
            total = snapshot.total,
            sent = snapshot.sent,
            accept_failures = snapshot.accept_failures,
            "Listener stopped"
        );
        snapshot
    }
}

/// Accept and dispatch connections until a stop is requested.
async fn accept_loop<A: Accept>(
    acceptor: &A,
    handling: Handling,
    counters: &Arc<Counters>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let limit = Arc::new(Semaphore::new(handling.max_connections));
    let mut tasks = JoinSet::new();
    let mut next_conn: u64 = 0;

    info!(dispatch = ?handling.dispatch, "Accepting connections");

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = stopped(stop_rx) => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = stopped(stop_rx) => break,
            accepted = acceptor.accept() => accepted,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                counters.record_accept_failure();
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        next_conn += 1;
        let conn = next_conn;
        debug!(conn, "New connection");

        match handling.dispatch {
            Dispatch::Sequential => {
                let exchange = handle_connection(stream, handling.framing, counters);
                tokio::select! {
                    _ = stopped(stop_rx) => {
                        debug!(conn, "Exchange interrupted by shutdown");
                        break;
                    }
                    result = exchange => log_exchange(conn, result),
                }
                drop(permit);
            }
            Dispatch::Concurrent => {
                let framing = handling.framing;
                let counters = Arc::clone(counters);
                tasks.spawn(async move {
                    log_exchange(conn, handle_connection(stream, framing, &counters).await);
                    drop(permit);
                });

                // Reap finished handlers
                while tasks.try_join_next().is_some() {}
            }
        }
    }

    drain(&mut tasks).await;
}

/// A listener serving on a background task.
pub struct ServerHandle {
    stop: StopHandle,
    task: JoinHandle<Snapshot>,
}

impl ServerHandle {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the listener and wait until its socket file is gone.
    pub async fn stop(self) -> Result<Snapshot, JoinError> {
        self.stop.stop();
        self.task.await
    }
}

/// Run one exchange on `stream`: read a frame, echo its body, close.
///
/// `total` is counted once the read returns, whatever its result; `sent`
/// only when the whole body was written. A write that fails because the peer
/// disconnected is reported as [`Exchange::PeerGone`]; other I/O failures
/// are returned as errors. The stream is dropped, and so closed, on every
/// path.
pub async fn handle_connection<S>(
    mut stream: S,
    framing: Framing,
    counters: &Counters,
) -> Result<Exchange, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(framing.read_size);

    let read = framing.read_frame(&mut stream, &mut buffer).await;
    counters.record_received();
    let n = read.map_err(ExchangeError::Read)?;
    trace!(bytes = n, "Frame received");

    let body = match framing.split(&buffer) {
        Ok(frame) => frame.body,
        Err(e) => {
            trace!(error = %e, "Skipping echo");
            return Ok(Exchange::Unmatched);
        }
    };

    let written = async {
        stream.write_all(body).await?;
        stream.flush().await
    }
    .await;

    match written {
        Ok(()) => {
            counters.record_sent();
            Ok(Exchange::Echoed { bytes: body.len() })
        }
        Err(e) if is_disconnect(&e) => Ok(Exchange::PeerGone),
        Err(e) => Err(ExchangeError::Write(e)),
    }
}

/// Errors produced by writing to a connection the peer already closed.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

fn log_exchange(conn: u64, result: Result<Exchange, ExchangeError>) {
    match result {
        Ok(Exchange::Echoed { bytes }) => trace!(conn, bytes, "Echoed body"),
        Ok(Exchange::Unmatched) => debug!(conn, "No separator in frame, nothing echoed"),
        Ok(Exchange::PeerGone) => debug!(conn, "Peer closed before echo"),
        Err(e @ ExchangeError::Read(_)) => debug!(conn, error = %e, "Connection error"),
        Err(e) => warn!(conn, error = %e, "Connection error"),
    }
    trace!(conn, "Connection closed");
}

/// Resolves once a stop has been requested.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Give in-flight handlers a grace period, then abort the rest.
async fn drain(tasks: &mut JoinSet<()>) {
    if tasks.is_empty() {
        return;
    }

    debug!(in_flight = tasks.len(), "Waiting for in-flight connections");
    let finished = tokio::time::timeout(DRAIN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(in_flight = tasks.len(), "Aborting connections still in flight");
        tasks.shutdown().await;
    }
}

/// What a connect attempt says about an existing socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    /// A listener accepted or queued the connection, or its backlog is full.
    Live,
    /// Nothing is listening, or there is no file at all.
    Stale,
}

fn classify_connect(result: io::Result<()>) -> io::Result<SocketState> {
    match result {
        Ok(()) => Ok(SocketState::Live),
        Err(e) => match e.kind() {
            io::ErrorKind::WouldBlock => Ok(SocketState::Live),
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => Ok(SocketState::Stale),
            _ => Err(e),
        },
    }
}

/// Remove a socket file left behind by a previous run.
///
/// A successful connect reaches the live listener as an empty connection, so
/// it shows up there as one zero-byte exchange.
async fn remove_stale_socket(path: &Path) -> Result<(), ListenerError> {
    let connected = UnixStream::connect(path).await.map(drop);
    let startup = |source| ListenerError::Startup {
        path: path.to_path_buf(),
        source,
    };

    if classify_connect(connected).map_err(startup)? == SocketState::Live {
        return Err(ListenerError::Bind {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "a live listener answered"),
        });
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(startup(source)),
    }
}

/// Create a listening UNIX stream socket with an explicit backlog.
fn bind(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    bind_socket(socket, path, backlog)
}

/// Bind `socket` to `path` and listen. The socket file is removed again if
/// any step after the bind fails.
fn bind_socket(socket: Socket, path: &Path, backlog: i32) -> io::Result<UnixListener> {
    socket.bind(&SockAddr::unix(path)?)?;

    let listening = socket
        .listen(backlog)
        .and_then(|()| socket.set_nonblocking(true))
        .and_then(|()| UnixListener::from_std(std::os::unix::net::UnixListener::from(socket)));

    if listening.is_err() {
        unlink_socket(path);
    }
    listening
}

/// Unlink a socket file, logging anything but its absence.
fn unlink_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FramePolicy, ReadMode};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::{Builder, Mock};

    /// Hands out scripted accept results, then requests a stop.
    struct ScriptedAcceptor {
        script: Mutex<VecDeque<io::Result<Mock>>>,
        stop: watch::Sender<bool>,
    }

    impl Accept for ScriptedAcceptor {
        type Stream = Mock;

        fn accept(&self) -> impl Future<Output = io::Result<Mock>> + Send {
            let next = self.script.lock().unwrap().pop_front();
            if next.is_none() {
                self.stop.send_replace(true);
            }
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }
    }

    fn socket_config(dir: &TempDir) -> Config {
        Config::for_socket(dir.path().join("server.socket"))
    }

    async fn exchange(path: &Path, request: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_handle_echoes_body() {
        let counters = Counters::new();
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nhello")
            .write(b"hello")
            .build();

        let outcome = handle_connection(stream, Framing::default(), &counters)
            .await
            .unwrap();
        assert_eq!(outcome, Exchange::Echoed { bytes: 5 });
        assert_eq!(counters.snapshot().total, 1);
        assert_eq!(counters.snapshot().sent, 1);
    }

    #[tokio::test]
    async fn test_handle_strict_skips_write() {
        let counters = Counters::new();
        let framing = Framing {
            policy: FramePolicy::Strict,
            ..Framing::default()
        };
        let stream = Builder::new().read(b"no separator here").build();

        let outcome = handle_connection(stream, framing, &counters).await.unwrap();
        assert_eq!(outcome, Exchange::Unmatched);
        assert_eq!(counters.snapshot().total, 1);
        assert_eq!(counters.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn test_handle_broken_pipe_is_peer_gone() {
        let counters = Counters::new();
        let stream = Builder::new()
            .read(b"h\r\n\r\nbody")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        let outcome = handle_connection(stream, Framing::default(), &counters)
            .await
            .unwrap();
        assert_eq!(outcome, Exchange::PeerGone);
        assert_eq!(counters.snapshot().total, 1);
        assert_eq!(counters.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn test_handle_other_write_error_is_reported() {
        let counters = Counters::new();
        let stream = Builder::new()
            .read(b"h\r\n\r\nbody")
            .write_error(io::Error::from(io::ErrorKind::PermissionDenied))
            .build();

        let err = handle_connection(stream, Framing::default(), &counters)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Write(_)));
        assert_eq!(counters.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn test_handle_read_error_still_counts() {
        let counters = Counters::new();
        let stream = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let err = handle_connection(stream, Framing::default(), &counters)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Read(_)));
        assert_eq!(counters.snapshot().total, 1);
        assert_eq!(counters.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn test_echo_http_request() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let reply = exchange(&config.socket, b"GET / HTTP/1.1\r\nHost: x\r\n\r\nhello").await;
        assert_eq!(reply, b"hello");

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.accept_failures, 0);
        assert!(!config.socket.exists());
    }

    #[tokio::test]
    async fn test_empty_body_and_missing_separator() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        assert!(exchange(&config.socket, b"\r\n\r\n").await.is_empty());
        assert!(exchange(&config.socket, b"GET / HTTP/1.1\r\nHost: x\r\n").await.is_empty());
        // Still serving
        assert_eq!(exchange(&config.socket, b"h\r\n\r\nok").await, b"ok");

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.sent, 3);
    }

    #[tokio::test]
    async fn test_strict_policy_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = socket_config(&dir);
        config.framing.policy = FramePolicy::Strict;
        let server = EchoListener::start(&config).await.unwrap().spawn();

        assert!(exchange(&config.socket, b"partial header").await.is_empty());

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.sent, 0);
    }

    #[tokio::test]
    async fn test_zero_byte_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        drop(UnixStream::connect(&config.socket).await.unwrap());
        assert!(exchange(&config.socket, b"").await.is_empty());
        assert_eq!(exchange(&config.socket, b"h\r\n\r\nnext").await, b"next");

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 3);
    }

    #[tokio::test]
    async fn test_single_read_truncates_large_frame() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let mut request = b"h\r\n\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(4995));

        let mut stream = UnixStream::connect(&config.socket).await.unwrap();
        stream.write_all(&request).await.unwrap();

        // The server closes with 904 request bytes unread, which reaches the
        // client as a reset after the echoed bytes.
        let mut reply = vec![0u8; 4096 - 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert!(reply.iter().all(|&b| b == b'a'));

        let mut rest = Vec::new();
        match stream.read_to_end(&mut rest).await {
            Ok(_) => assert!(rest.is_empty()),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_reset_before_echo() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        // Nothing between the write and the drop yields to the server task,
        // so the client is gone before the echo is attempted.
        let mut stream = UnixStream::connect(&config.socket).await.unwrap();
        stream.write_all(b"h\r\n\r\nbye").await.unwrap();
        drop(stream);

        assert_eq!(exchange(&config.socket, b"h\r\n\r\nhello").await, b"hello");

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.sent, 1);
    }

    #[tokio::test]
    async fn test_restart_on_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);

        let server = EchoListener::start(&config).await.unwrap().spawn();
        assert_eq!(exchange(&config.socket, b"\r\n\r\none").await, b"one");
        server.stop().await.unwrap();
        assert!(!config.socket.exists());

        let server = EchoListener::start(&config).await.unwrap().spawn();
        assert_eq!(exchange(&config.socket, b"\r\n\r\ntwo").await, b"two");
        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 1);
    }

    #[tokio::test]
    async fn test_stop_is_prompt_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let handle = server.stop_handle();
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        let snapshot = tokio::time::timeout(Duration::from_secs(1), server.stop())
            .await
            .expect("serve did not return")
            .unwrap();
        assert_eq!(snapshot.total, 0);
        assert!(!config.socket.exists());
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let _silent = UnixStream::connect(&config.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), server.stop())
            .await
            .expect("serve did not return")
            .unwrap();
        assert!(!config.socket.exists());
    }

    #[tokio::test]
    async fn test_stop_without_serving_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);

        let listener = EchoListener::start(&config).await.unwrap();
        assert!(listener.path().exists());
        listener.stop();
        assert!(!config.socket.exists());
    }

    #[tokio::test]
    async fn test_live_listener_is_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);

        let _first = EchoListener::start(&config).await.unwrap();
        let err = EchoListener::start(&config).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert!(config.socket.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);

        // Bound but dropped: the file stays behind with nobody listening.
        drop(std::os::unix::net::UnixListener::bind(&config.socket).unwrap());
        assert!(config.socket.exists());

        let server = EchoListener::start(&config).await.unwrap().spawn();
        assert_eq!(exchange(&config.socket, b"\r\n\r\nfresh").await, b"fresh");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unremovable_path_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(&dir);
        std::fs::create_dir(&config.socket).unwrap();
        std::fs::write(config.socket.join("keep"), b"x").unwrap();

        let err = EchoListener::start(&config).await.err().unwrap();
        assert!(matches!(err, ListenerError::Startup { .. }));
    }

    #[tokio::test]
    async fn test_missing_directory_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_socket(dir.path().join("missing").join("server.socket"));

        let err = EchoListener::start(&config).await.err().unwrap();
        assert!(matches!(err, ListenerError::Startup { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = socket_config(&dir);
        config.dispatch = Dispatch::Concurrent;
        config.max_connections = 4;
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let mut clients = JoinSet::new();
        for i in 0..8 {
            let path = config.socket.clone();
            clients.spawn(async move {
                let body = format!("client-{i}");
                let request = format!("POST / HTTP/1.1\r\n\r\n{body}");
                (body, exchange(&path, request.as_bytes()).await)
            });
        }
        while let Some(result) = clients.join_next().await {
            let (body, reply) = result.unwrap();
            assert_eq!(reply, body.as_bytes());
        }

        let snapshot = server.stop().await.unwrap();
        assert_eq!(snapshot.total, 8);
        assert_eq!(snapshot.sent, 8);
        assert_eq!(snapshot.accept_failures, 0);
    }

    #[tokio::test]
    async fn test_until_separator_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = socket_config(&dir);
        config.framing.read_mode = ReadMode::UntilSeparator;
        let server = EchoListener::start(&config).await.unwrap().spawn();

        let mut stream = UnixStream::connect(&config.socket).await.unwrap();
        stream.write_all(b"Host: x\r\n\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"\nsplit").await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"split");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_errors_are_skipped() {
        let (tx, mut rx) = watch::channel(false);
        let acceptor = ScriptedAcceptor {
            script: Mutex::new(VecDeque::from([
                Err(io::Error::from_raw_os_error(24)),
                Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                Ok(Builder::new()
                    .read(b"h\r\n\r\nstill up")
                    .write(b"still up")
                    .build()),
            ])),
            stop: tx,
        };
        let counters = Arc::new(Counters::new());
        let handling = Handling {
            dispatch: Dispatch::Sequential,
            max_connections: 1,
            framing: Framing::default(),
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            accept_loop(&acceptor, handling, &counters, &mut rx),
        )
        .await
        .expect("accept loop did not stop");

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.accept_failures, 2);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.sent, 1);
    }

    #[test]
    fn test_classify_connect() {
        assert_eq!(classify_connect(Ok(())).unwrap(), SocketState::Live);
        assert_eq!(
            classify_connect(Err(io::ErrorKind::WouldBlock.into())).unwrap(),
            SocketState::Live
        );
        assert_eq!(
            classify_connect(Err(io::ErrorKind::ConnectionRefused.into())).unwrap(),
            SocketState::Stale
        );
        assert_eq!(
            classify_connect(Err(io::ErrorKind::NotFound.into())).unwrap(),
            SocketState::Stale
        );
        assert!(classify_connect(Err(io::ErrorKind::PermissionDenied.into())).is_err());
    }

    #[tokio::test]
    async fn test_full_backlog_is_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = socket_config(&dir);
        config.backlog = 1;

        let _first = EchoListener::start(&config).await.unwrap();
        let mut queued = Vec::new();
        for _ in 0..64 {
            match UnixStream::connect(&config.socket).await {
                Ok(stream) => queued.push(stream),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
        }

        let err = EchoListener::start(&config).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert!(config.socket.exists());
    }

    #[test]
    fn test_failed_listen_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dgram.socket");

        // Datagram sockets bind fine but cannot listen.
        let socket = Socket::new(Domain::UNIX, Type::DGRAM, None).unwrap();
        assert!(bind_socket(socket, &path, 10).is_err());
        assert!(!path.exists());
    }
}
