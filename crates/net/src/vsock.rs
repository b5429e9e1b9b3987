//! The Vsock Transport (spec.md §4.1).
//!
//! Grounded on `capsa::apple::vz::vsock::bridge_connection`'s
//! `AsyncFd`-based nonblocking copy loop, generalized from a
//! Unix-socket-specific function into one that operates over any
//! [`VsockConnection`] (native or dev-transport).

use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use vmbridge_core::{AsyncOwnedFd, GuestEndpoint, TransportError, VsockConnection};

/// 64 KiB, per spec.md §4.1 "Buffer size for copy is 64 KiB."
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Opens a vsock connection to `port` on `endpoint`, submitting the
/// connect to the endpoint's own serialized executor (spec.md §4.1).
pub async fn connect(
    endpoint: &dyn GuestEndpoint,
    port: u32,
    timeout: Duration,
) -> Result<Box<dyn VsockConnection>, TransportError> {
    endpoint.connect(port, timeout).await
}

/// Wraps a [`VsockConnection`] for async nonblocking I/O.
///
/// Dups the descriptor so the async handle has independent ownership
/// from the connection object; the connection's own `Drop` still closes
/// the original descriptor when it goes out of scope.
pub fn async_handle(conn: &dyn VsockConnection) -> Result<AsyncOwnedFd, TransportError> {
    let dup = nix::unistd::dup(conn.as_raw_fd()).map_err(|e| TransportError::Syscall {
        op: "dup",
        errno: e as i32,
    })?;
    // SAFETY: `dup` returned a freshly duplicated, valid, open descriptor
    // that nothing else owns yet.
    let owned = unsafe { OwnedFd::from_raw_fd(dup) };
    AsyncOwnedFd::new(owned).map_err(TransportError::from)
}

/// One nonblocking read of up to `max_bytes`. `None` means EOF
/// (spec.md §4.1).
pub async fn read_once(
    handle: &mut AsyncOwnedFd,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut buf = vec![0u8; max_bytes];
    match handle.read(&mut buf).await {
        Ok(0) => Ok(None),
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(e) => Err(TransportError::from(e)),
    }
}

/// Writes every byte of `bytes`, treating `EPIPE`/`ECONNRESET` as a
/// clean peer close (spec.md §4.1).
pub async fn write_all(handle: &mut AsyncOwnedFd, bytes: &[u8]) -> Result<(), TransportError> {
    handle.write_all(bytes).await.map_err(TransportError::from)
}

/// Half-closes the write side of `conn` to propagate EOF to the peer
/// (spec.md §4.1, §4.3 step 3 "half-close the write side").
pub fn shutdown_write(conn: &dyn VsockConnection) -> Result<(), TransportError> {
    nix::sys::socket::shutdown(conn.as_raw_fd(), nix::sys::socket::Shutdown::Write).map_err(|e| {
        TransportError::Syscall {
            op: "shutdown",
            errno: e as i32,
        }
    })
}

/// Concurrently copies `a` -> `b` and `b` -> `a` until either side EOFs
/// or disconnects; after each direction finishes it half-closes the
/// write side of the *opposite* descriptor to propagate EOF
/// (spec.md §4.1).
pub async fn pipe_bidirectional(
    a: &dyn VsockConnection,
    b: &dyn VsockConnection,
) -> Result<(), TransportError> {
    let a_handle = async_handle(a)?;
    let b_handle = async_handle(b)?;

    let (a_read, a_write) = tokio::io::split(a_handle);
    let (b_read, b_write) = tokio::io::split(b_handle);

    let a_to_b = copy_and_half_close(a_read, b_write, b);
    let b_to_a = copy_and_half_close(b_read, a_write, a);

    let (r1, r2) = tokio::join!(a_to_b, b_to_a);
    r1.and(r2)
}

async fn copy_and_half_close(
    mut src: ReadHalf<AsyncOwnedFd>,
    mut dst: WriteHalf<AsyncOwnedFd>,
    dst_conn: &dyn VsockConnection,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let err = TransportError::from(e);
                if matches!(err, TransportError::Closed) {
                    break;
                }
                return Err(err);
            }
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            let err = TransportError::from(e);
            if matches!(err, TransportError::Closed) {
                break;
            }
            return Err(err);
        }
    }
    // Half-close is best-effort: the peer may already have gone away.
    let _ = shutdown_write(dst_conn);
    Ok(())
}

/// Sets a raw descriptor to nonblocking mode, as required before
/// bridging (spec.md §4.1).
pub fn set_nonblocking(fd: std::os::fd::RawFd) -> Result<(), TransportError> {
    let flags =
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(|e| TransportError::Syscall {
            op: "fcntl(F_GETFL)",
            errno: e as i32,
        })?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(|e| {
        TransportError::Syscall {
            op: "fcntl(F_SETFL)",
            errno: e as i32,
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, RawFd};

    struct PipeEnd(OwnedFd);
    impl VsockConnection for PipeEnd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    #[tokio::test]
    async fn read_once_returns_none_on_eof() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        set_nonblocking(read_fd.as_raw_fd()).unwrap();
        drop(write_fd);

        let mut handle = AsyncOwnedFd::new(read_fd).unwrap();
        let result = read_once(&mut handle, 1024).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_once_returns_bytes_written() {
        use tokio::io::AsyncWriteExt;

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        set_nonblocking(read_fd.as_raw_fd()).unwrap();
        set_nonblocking(write_fd.as_raw_fd()).unwrap();

        let mut reader = AsyncOwnedFd::new(read_fd).unwrap();
        let mut writer = AsyncOwnedFd::new(write_fd).unwrap();
        writer.write_all(b"hello").await.unwrap();

        let result = read_once(&mut reader, 1024).await.unwrap();
        assert_eq!(result, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn pipe_bidirectional_relays_both_directions_in_order() {
        use std::io::{Read, Write};
        use std::os::unix::net::UnixStream;

        // Two independent pairs: (actor1 <-> bridge_a) and (bridge_b <-> actor2).
        // pipe_bidirectional(bridge_a, bridge_b) should relay actor1's bytes
        // to actor2 and vice versa, exactly like the tunnel bridge relays a
        // host TCP client to the guest multiplexer connection (S1).
        let (actor1_fd, bridge_a_fd) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();
        let (bridge_b_fd, actor2_fd) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();

        let mut actor1 = UnixStream::from(actor1_fd);
        let mut actor2 = UnixStream::from(actor2_fd);

        let bridge_a = PipeEnd(bridge_a_fd);
        let bridge_b = PipeEnd(bridge_b_fd);
        let bridge_task =
            tokio::spawn(async move { pipe_bidirectional(&bridge_a, &bridge_b).await });

        actor1.write_all(b"ping").unwrap();
        actor1.shutdown(std::net::Shutdown::Write).unwrap();
        actor2.write_all(b"pong").unwrap();
        actor2.shutdown(std::net::Shutdown::Write).unwrap();

        let recv_on_actor2 = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            actor2.read_to_end(&mut buf).unwrap();
            buf
        });
        let recv_on_actor1 = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            actor1.read_to_end(&mut buf).unwrap();
            buf
        });

        bridge_task.await.unwrap().unwrap();
        assert_eq!(recv_on_actor2.await.unwrap(), b"ping");
        assert_eq!(recv_on_actor1.await.unwrap(), b"pong");
    }
}
