//! The §4.1/§7 transport error taxonomy, shared by every crate that
//! touches a raw vsock fd.

/// Errors produced by the vsock transport layer (spec.md §4.1).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("connection closed after {received} of {expected} expected bytes")]
    EofBeforeExpected { expected: usize, received: usize },

    #[error("operation interrupted")]
    Interrupted,

    #[error("operation would block")]
    WouldBlock,

    #[error("syscall {op} failed: {errno}")]
    Syscall { op: &'static str, errno: i32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to connect to guest: {0}")]
    ConnectFailed(String),

    #[error("operation timed out")]
    Timeout,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => TransportError::WouldBlock,
            std::io::ErrorKind::Interrupted => TransportError::Interrupted,
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ if is_expected_disconnect_io(&err) => TransportError::Closed,
            _ => TransportError::Syscall {
                op: "io",
                errno: err.raw_os_error().unwrap_or(-1),
            },
        }
    }
}

/// True for the errno family spec.md §7 classifies as an "expected
/// disconnect": the peer went away, not a bug and not worth surfacing as
/// a `RuntimeError`.
pub fn is_expected_disconnect(errno: nix::errno::Errno) -> bool {
    use nix::errno::Errno;
    matches!(
        errno,
        Errno::EPIPE
            | Errno::ECONNRESET
            | Errno::ENOTCONN
            | Errno::ESHUTDOWN
            | Errno::ECONNABORTED
            | Errno::ETIMEDOUT
            | Errno::EHOSTUNREACH
            | Errno::ENETUNREACH
    )
}

fn is_expected_disconnect_io(err: &std::io::Error) -> bool {
    err.raw_os_error()
        .map(nix::errno::Errno::from_raw)
        .is_some_and(is_expected_disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_disconnect_errnos_are_recognized() {
        assert!(is_expected_disconnect(nix::errno::Errno::EPIPE));
        assert!(is_expected_disconnect(nix::errno::Errno::ECONNRESET));
        assert!(!is_expected_disconnect(nix::errno::Errno::EINVAL));
    }

    #[test]
    fn io_error_would_block_maps_to_transport_would_block() {
        let err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert!(matches!(TransportError::from(err), TransportError::WouldBlock));
    }

    #[test]
    fn io_error_eof_maps_to_closed() {
        let err = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(TransportError::from(err), TransportError::Closed));
    }
}
