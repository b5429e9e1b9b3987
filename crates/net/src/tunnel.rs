//! The Tunnel Listener (spec.md §4.4): one per host TCP port, accepting
//! TCP clients and bridging each to a fresh vsock connection through the
//! guest's tunnel multiplexer.
//!
//! Grounded on `capsa_net::port_forward::PortForwarder`'s shape — a
//! `JoinHandle`-owning struct whose `stop()` aborts the accept loop and
//! whose `Drop` calls `stop()` — generalized from L2/L3 NAT forwarding to
//! a per-connection vsock handshake + bridge.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use vmbridge_core::{GuestEndpoint, OwnedFdConnection, RuntimeError, RuntimeErrorPhase};

use crate::vsock;

/// Timeout for opening the vsock connection and completing the handshake
/// (spec.md §4.4 step 2, and the §9 open-question resolution for an
/// unterminated handshake reply).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const HANDSHAKE_READ_MAX: usize = 255;

/// The host OS listen backlog (spec.md §4.4 "Concurrency").
const LISTEN_BACKLOG: u32 = 128;

/// Reports a [`RuntimeError`] from a failed or terminated forward.
pub type ErrorSink = Arc<dyn Fn(RuntimeError) + Send + Sync>;

/// Accepts TCP connections on `host_port` and bridges each to
/// `guest_port` on the guest's tunnel multiplexer (spec.md §4.4).
///
/// One instance per host port, matching the listener state machine
/// `Idle -> Listening -> Stopping -> Stopped`: construction is `Idle`,
/// [`TunnelListener::start`] moves to `Listening`, and drop/[`stop`]
/// moves through `Stopping` to `Stopped`.
///
/// [`stop`]: TunnelListener::stop
pub struct TunnelListener {
    host_port: u16,
    guest_port: u16,
    accept_task: Option<JoinHandle<()>>,
    connection_tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl TunnelListener {
    /// Binds `127.0.0.1:host_port` and starts the accept loop
    /// (spec.md §4.4 "Listener state machine").
    pub async fn start(
        host_port: u16,
        guest_port: u16,
        endpoint: Arc<dyn GuestEndpoint>,
        error_sink: ErrorSink,
    ) -> std::io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([127, 0, 0, 1], host_port)))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        let connection_tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>> =
            Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let tasks_for_loop = connection_tasks.clone();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            host_port,
            guest_port,
            endpoint,
            error_sink,
            tasks_for_loop,
        ));

        Ok(Self {
            host_port,
            guest_port,
            accept_task: Some(accept_task),
            connection_tasks,
        })
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn guest_port(&self) -> u16 {
        self.guest_port
    }

    /// Cancels the accept loop, closes the listening socket, and drains
    /// outstanding connection tasks (spec.md §4.4 "Stop").
    pub async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        let mut tasks = self.connection_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Ok(mut tasks) = self.connection_tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    host_port: u16,
    guest_port: u16,
    endpoint: Arc<dyn GuestEndpoint>,
    error_sink: ErrorSink,
    connection_tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(host_port, error = %e, "tunnel accept error");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(host_port, error = %e, "failed to set TCP_NODELAY");
        }

        let endpoint = endpoint.clone();
        let error_sink = error_sink.clone();
        let task = tokio::spawn(async move {
            handle_connection(stream, host_port, guest_port, endpoint.as_ref(), &error_sink).await;
        });

        let mut tasks = connection_tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Drives one accepted connection through the per-connection state
/// machine (spec.md §4.4 "State machine per connection").
async fn handle_connection(
    stream: TcpStream,
    host_port: u16,
    guest_port: u16,
    endpoint: &dyn GuestEndpoint,
    error_sink: &ErrorSink,
) {
    tracing::debug!(host_port, guest_port, "accepted tunnel connection");

    // Connecting.
    let guest_conn = match vsock::connect(endpoint, vmbridge_core::ports::TUNNEL, HANDSHAKE_TIMEOUT).await {
        Ok(conn) => conn,
        Err(e) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::ConnectToGuest,
                e.to_string(),
            ));
            return;
        }
    };

    // Handshake: Write.
    let mut handle = match vsock::async_handle(guest_conn.as_ref()) {
        Ok(h) => h,
        Err(e) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::ConnectToGuest,
                e.to_string(),
            ));
            return;
        }
    };

    let request = format!("CONNECT {guest_port}\r\n");
    let write_result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handle.write_all(request.as_bytes())).await;
    match write_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::HandshakeWrite,
                e.to_string(),
            ));
            return;
        }
        Err(_) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::HandshakeWrite,
                "timed out writing handshake",
            ));
            return;
        }
    }

    // Handshake: Read.
    let mut buf = vec![0u8; HANDSHAKE_READ_MAX];
    let read_result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handle.read(&mut buf)).await;
    let n = match read_result {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::HandshakeRead,
                e.to_string(),
            ));
            return;
        }
        Err(_) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::HandshakeRead,
                "timed out waiting for handshake reply",
            ));
            return;
        }
    };

    // Handshake: Validate.
    let reply = String::from_utf8_lossy(&buf[..n]);
    let reply = reply.trim();
    if reply != "OK" {
        let message = if let Some(reason) = reply.strip_prefix("ERROR ") {
            reason.to_string()
        } else {
            format!("unexpected handshake reply: {reply:?}")
        };
        error_sink(RuntimeError::new(
            host_port,
            guest_port,
            RuntimeErrorPhase::HandshakeProtocol,
            message,
        ));
        return;
    }

    // Bridging.
    drop(handle);
    let host_fd: OwnedFd = match stream.into_std() {
        Ok(std_stream) => {
            // SAFETY: `into_raw_fd` hands off the socket we just took
            // ownership of; no one else holds this descriptor.
            unsafe { OwnedFd::from_raw_fd(std_stream.into_raw_fd()) }
        }
        Err(e) => {
            error_sink(RuntimeError::new(
                host_port,
                guest_port,
                RuntimeErrorPhase::Bridge,
                e.to_string(),
            ));
            return;
        }
    };
    let host_conn = OwnedFdConnection::new(host_fd);

    if let Err(e) = vsock::pipe_bidirectional(&host_conn, guest_conn.as_ref()).await {
        error_sink(RuntimeError::new(
            host_port,
            guest_port,
            RuntimeErrorPhase::Bridge,
            e.to_string(),
        ));
    }

    tracing::debug!(host_port, guest_port, "tunnel connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_dev_transport::TcpEndpoint;

    /// A tiny guest stand-in that speaks the tunnel multiplexer protocol:
    /// reads `CONNECT <port>\r\n`, replies `OK\r\n`, then echoes bytes.
    async fn spawn_fake_multiplexer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 255];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let line = String::from_utf8_lossy(&buf[..n]);
                    if line.starts_with("CONNECT ") {
                        let _ = stream.write_all(b"OK\r\n").await;
                        let (mut r, mut w) = stream.into_split();
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn bridges_host_client_through_handshake_to_guest_echo() {
        let multiplexer_port = spawn_fake_multiplexer().await;
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(
            TcpEndpoint::new().with_port(vmbridge_core::ports::TUNNEL, multiplexer_port),
        );

        let host_port = {
            // Reserve an ephemeral port by binding once, then reuse the number.
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let last_error = Arc::new(std::sync::Mutex::new(None));
        let last_error_clone = last_error.clone();
        let sink: ErrorSink = Arc::new(move |err| {
            *last_error_clone.lock().unwrap() = Some(err);
        });

        let mut listener = TunnelListener::start(host_port, 9999, endpoint, sink)
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", host_port)).await.unwrap();
        client.write_all(b"hello guest").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"hello guest");
        assert!(last_error.lock().unwrap().is_none());

        listener.stop().await;
    }

    #[tokio::test]
    async fn reports_connect_failure_when_guest_refuses() {
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(TcpEndpoint::new());

        let host_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let last_error = Arc::new(std::sync::Mutex::new(None));
        let last_error_clone = last_error.clone();
        let sink: ErrorSink = Arc::new(move |err| {
            *last_error_clone.lock().unwrap() = Some(err);
        });

        let mut listener = TunnelListener::start(host_port, 22, endpoint, sink)
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", host_port)).await.unwrap();
        let _ = client.write_all(b"x").await;
        drop(client);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            last_error.lock().unwrap().as_ref().map(|e| e.phase),
            Some(RuntimeErrorPhase::ConnectToGuest)
        ));

        listener.stop().await;
    }
}
