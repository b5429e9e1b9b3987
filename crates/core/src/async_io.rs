//! Nonblocking fd <-> tokio bridging primitives.
//!
//! Every vsock connection in this fabric is, at the syscall level, a raw
//! file descriptor. These wrappers put a descriptor in nonblocking mode
//! once and then expose it as an ordinary `AsyncRead`/`AsyncWrite`, retrying
//! on `EAGAIN` the way a cooperative scheduler expects.

use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn poll_read_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<std::io::Result<()>> {
    loop {
        let mut guard = match fd.poll_read_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        let raw_fd = fd.get_ref().as_raw_fd();
        let unfilled = buf.initialize_unfilled();

        match nix::unistd::read(raw_fd, unfilled) {
            Ok(n) => {
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Poll::Ready(Err(std::io::Error::from_raw_os_error(e as i32))),
        }
    }
}

fn poll_write_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<std::io::Result<usize>> {
    loop {
        let mut guard = match fd.poll_write_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        match nix::unistd::write(fd.get_ref(), buf) {
            Ok(n) => return Poll::Ready(Ok(n)),
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Poll::Ready(Err(std::io::Error::from_raw_os_error(e as i32))),
        }
    }
}

/// An owned file descriptor exposed as `AsyncRead + AsyncWrite`.
///
/// Closes the descriptor on drop (via `OwnedFd`), which is the single
/// point of ownership the fabric relies on instead of a "keep it alive"
/// convention.
pub struct AsyncOwnedFd(AsyncFd<OwnedFd>);

impl AsyncOwnedFd {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self(AsyncFd::new(fd)?))
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.get_ref().as_raw_fd()
    }
}

impl AsyncRead for AsyncOwnedFd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        poll_read_fd(&self.0, cx, buf)
    }
}

impl AsyncWrite for AsyncOwnedFd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        poll_write_fd(&self.0, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A pair of independently owned read/write descriptors exposed as a
/// single `AsyncRead + AsyncWrite` stream.
///
/// Used when a single logical connection's read half and write half are
/// driven by different tasks (the tunnel bridge, §5 shared resource
/// policy) but still need to be half-closable independently.
pub struct AsyncPipe {
    read_fd: AsyncFd<OwnedFd>,
    write_fd: AsyncFd<OwnedFd>,
}

impl AsyncPipe {
    pub fn new(read_fd: OwnedFd, write_fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(read_fd.as_raw_fd())?;
        set_nonblocking(write_fd.as_raw_fd())?;
        Ok(Self {
            read_fd: AsyncFd::new(read_fd)?,
            write_fd: AsyncFd::new(write_fd)?,
        })
    }
}

impl AsyncRead for AsyncPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        poll_read_fd(&self.read_fd, cx, buf)
    }
}

impl AsyncWrite for AsyncPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        poll_write_fd(&self.write_fd, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn set_nonblocking(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn async_owned_fd_can_create_from_pipe() {
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        let async_fd = AsyncOwnedFd::new(read_fd);
        assert!(async_fd.is_ok());
    }

    #[tokio::test]
    async fn async_pipe_can_create_from_pipe_pair() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let async_pipe = AsyncPipe::new(read_fd, write_fd);
        assert!(async_pipe.is_ok());
    }

    #[tokio::test]
    async fn async_owned_fd_reads_written_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut reader = AsyncOwnedFd::new(read_fd).unwrap();
        let mut writer = AsyncOwnedFd::new(write_fd).unwrap();

        writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
