//! The native `Virtualization.framework` backend: a [`GuestEndpoint`]
//! over a running VM's `VZVirtioSocketDevice`.
//!
//! Grounded on `capsa-apple-vz`'s `VsockBridge` (`crates/apple/vz/src/vsock.rs`)
//! for the pattern of keeping a raw, dup'd Objective-C object pointer
//! alive across threads behind a `Send + Sync` wrapper, and on the
//! `connectToPort:completionHandler:` dispatch-then-channel shape used
//! by host-initiated vsock connects in the wider example pack (a
//! `dispatch` main-queue hop bridging the framework's async completion
//! block to a `tokio::sync::oneshot`).
//!
//! `VZVirtioSocketDevice` only supports the *listener* direction
//! (guest connects out, host accepts) through `VsockListenerDelegate`
//! in the teacher crate; the request/tunnel/health/event fabric here
//! needs the opposite direction — host connects in — which the
//! framework exposes as `connectToPort:completionHandler:`.

#![cfg(target_os = "macos")]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use block2::RcBlock;
use objc2::rc::Retained;
use objc2_foundation::NSError;
use objc2_virtualization::{VZVirtioSocketConnection, VZVirtioSocketDevice};
use tokio::sync::oneshot;
use tracing::debug;

use vmbridge_core::{GuestEndpoint, TransportError, VsockConnection};

/// Wraps a raw Objective-C object pointer that is safe to send across
/// threads because the pointed-to object is reference-counted by the
/// framework and we only ever pass it back to framework calls, never
/// dereference it ourselves outside `unsafe` blocks that re-derive the
/// typed reference (capsa's `SendableObjcPtr`).
struct SendableObjcPtr(*const std::ffi::c_void);

// SAFETY: the Objective-C object behind this pointer is ref-counted by
// the Virtualization framework; we hold it only to keep it retained for
// this endpoint's lifetime and to re-derive a typed reference on each
// call, same assumption as `capsa_apple_vz::vsock::SendableObjcPtr`.
unsafe impl Send for SendableObjcPtr {}
unsafe impl Sync for SendableObjcPtr {}

/// A [`GuestEndpoint`] backed by a live `VZVirtioSocketDevice`.
///
/// Construct one per running VM, from the socket device taken off
/// `VZVirtualMachine.socketDevices` after the VM configuration step.
pub struct NativeEndpoint {
    device: SendableObjcPtr,
}

impl NativeEndpoint {
    /// # Safety
    /// `device` must be the VM's live `VZVirtioSocketDevice`, retained
    /// for at least as long as the returned `NativeEndpoint`.
    pub unsafe fn new(device: Retained<VZVirtioSocketDevice>) -> Self {
        Self {
            device: SendableObjcPtr(Retained::into_raw(device) as *const std::ffi::c_void),
        }
    }
}

impl Drop for NativeEndpoint {
    fn drop(&mut self) {
        // SAFETY: this pointer was produced by `Retained::into_raw` in
        // `new` and never handed to anyone else, so reconstituting and
        // dropping it here balances that retain exactly once.
        unsafe {
            let _ = Retained::from_raw(self.device.0 as *mut VZVirtioSocketDevice);
        }
    }
}

#[async_trait]
impl GuestEndpoint for NativeEndpoint {
    async fn connect(
        &self,
        port: u32,
        timeout: Duration,
    ) -> Result<Box<dyn VsockConnection>, TransportError> {
        let (tx, rx) = oneshot::channel::<Result<RawFd, String>>();
        let tx = Mutex::new(Some(tx));
        let device_addr = self.device.0 as usize;

        let completion = RcBlock::new(
            move |conn: *mut VZVirtioSocketConnection, err: *mut NSError| {
                let result = unsafe { fd_from_completion(conn, err) };
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            },
        );

        // VZVirtualMachine and everything reachable from it must only be
        // touched on the main queue (capsa_apple_vz::backend's module
        // doc: "VZVirtualMachine is not thread-safe").
        dispatch::Queue::main().exec_async(move || {
            // SAFETY: `device_addr` was derived from a live, retained
            // VZVirtioSocketDevice in `new` and this endpoint outlives
            // the dispatched block, since `connect` holds `&self`.
            let device = unsafe { &*(device_addr as *const VZVirtioSocketDevice) };
            unsafe { device.connectToPort_completionHandler(port, &completion) };
        });

        let fd = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectFailed("vsock completion channel closed".into()))?
            .map_err(TransportError::ConnectFailed)?;

        debug!(port, fd, "connected to guest vsock port");
        // SAFETY: `fd` is a freshly dup'd descriptor from
        // `fd_from_completion`, owned exclusively by this caller.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Box::new(NativeConnection(owned)))
    }
}

/// # Safety
/// `conn` and `err` must be the raw pointers handed to a
/// `connectToPort:completionHandler:` completion block: at most one
/// non-null, both valid for the duration of this call.
unsafe fn fd_from_completion(
    conn: *mut VZVirtioSocketConnection,
    err: *mut NSError,
) -> Result<RawFd, String> {
    if !err.is_null() {
        let desc = unsafe { (*err).localizedDescription() };
        return Err(desc.to_string());
    }
    if conn.is_null() {
        return Err("vsock connection is null".to_string());
    }
    let fd = unsafe { (*conn).fileDescriptor() };
    // The connection object owns and closes the original fd when it is
    // released on the main queue after this block returns; dup so we
    // keep an independent handle.
    let dup_fd = unsafe { libc::dup(fd) };
    if dup_fd < 0 {
        return Err(format!(
            "dup(vsock fd) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(dup_fd)
}

struct NativeConnection(OwnedFd);

impl VsockConnection for NativeConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_of_a_live_fd_yields_an_independent_owned_descriptor() {
        // NSError/VZVirtioSocketConnection construction requires a live
        // Virtualization runtime, so the completion-handler branches are
        // exercised end to end only on real hardware; what's worth
        // unit-testing here without one is the dup/ownership bookkeeping
        // `fd_from_completion` and `connect` rely on.
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;
        unsafe { libc::close(write_fd) };

        let dup_fd = unsafe { libc::dup(read_fd) };
        assert!(dup_fd >= 0);
        unsafe { libc::close(read_fd) };

        let owned = unsafe { OwnedFd::from_raw_fd(dup_fd) };
        assert_eq!(owned.as_raw_fd(), dup_fd);
    }
}
