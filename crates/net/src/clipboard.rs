//! The Clipboard Bridge (spec.md §4.9): focus-event-driven push/pull with
//! echo suppression by content hash.
//!
//! Grounded on `capsa_net::dns_cache`'s "remember the last value crossed,
//! skip redundant work" shape, adapted from a TTL cache entry to a
//! SHA-256 digest gate per direction.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use vmbridge_core::{ClipboardItem, ClipboardMode};

use crate::client::RequestClient;
use crate::error::ClientError;

/// The richest-first pasteboard item priority (spec.md §4.9 "priority:
/// png, tiff, utf-8 text").
pub const UTI_PRIORITY: [&str; 3] = ["public.png", "public.tiff", "public.utf8-plain-text"];

/// A host pasteboard abstraction so the bridge doesn't depend on
/// `AppKit`/`NSPasteboard` directly; the macOS-native collaborator
/// implements this against the real pasteboard.
pub trait HostPasteboard {
    /// Returns the richest available item per [`UTI_PRIORITY`], if any.
    fn read_richest_item(&self) -> Option<ClipboardItem>;
    fn write_item(&self, item: &ClipboardItem);
    /// A monotonically increasing counter bumped on every pasteboard
    /// write, used to gate push attempts (spec.md §4.9 "a change counter
    /// on the host pasteboard gates push").
    fn change_count(&self) -> u64;
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Tracks echo-suppression hashes and the last-seen pasteboard change
/// count; runs push/pull on focus transitions (spec.md §4.9).
pub struct ClipboardBridge {
    mode: ClipboardMode,
    last_pushed_hash: Option<String>,
    last_pulled_hash: Option<String>,
    last_seen_change_count: Option<u64>,
}

impl ClipboardBridge {
    pub fn new(mode: ClipboardMode) -> Self {
        Self {
            mode,
            last_pushed_hash: None,
            last_pulled_hash: None,
            last_seen_change_count: None,
        }
    }

    pub fn set_mode(&mut self, mode: ClipboardMode) {
        self.mode = mode;
    }

    fn push_enabled(&self) -> bool {
        matches!(self.mode, ClipboardMode::Bidirectional | ClipboardMode::HostToGuest)
    }

    fn pull_enabled(&self) -> bool {
        matches!(self.mode, ClipboardMode::Bidirectional | ClipboardMode::GuestToHost)
    }

    /// Runs on window focus gained ("key") and lost ("resign"): push
    /// and/or pull depending on the configured mode (spec.md §4.9).
    pub async fn on_focus_change(
        &mut self,
        pasteboard: &dyn HostPasteboard,
        client: &RequestClient,
    ) -> Result<(), ClientError> {
        if self.push_enabled() {
            self.push(pasteboard, client).await?;
        }
        if self.pull_enabled() {
            self.pull(pasteboard, client).await?;
        }
        Ok(())
    }

    /// Reads the richest pasteboard item and sends it to the guest,
    /// unless its hash matches the last value pulled from the guest (an
    /// echo) or the pasteboard hasn't changed since the last push
    /// (spec.md §4.9 "Echo suppression").
    async fn push(
        &mut self,
        pasteboard: &dyn HostPasteboard,
        client: &RequestClient,
    ) -> Result<(), ClientError> {
        let change_count = pasteboard.change_count();
        if self.last_seen_change_count == Some(change_count) {
            return Ok(());
        }

        let Some(item) = pasteboard.read_richest_item() else {
            return Ok(());
        };
        let hash = sha256_hex(&item.bytes);
        if self.last_pulled_hash.as_deref() == Some(hash.as_str()) {
            self.last_seen_change_count = Some(change_count);
            return Ok(());
        }

        let content = BASE64.encode(&item.bytes);
        client.set_clipboard(&content, &item.uti).await?;

        self.last_pushed_hash = Some(hash);
        self.last_seen_change_count = Some(change_count);
        Ok(())
    }

    /// Fetches the guest clipboard and replaces the host pasteboard when
    /// the uti differs from the host's current item or the content hash
    /// changed, unless the incoming hash matches the last value this
    /// bridge pushed (an echo) (spec.md §4.9 "Pull" + "Echo suppression").
    async fn pull(
        &mut self,
        pasteboard: &dyn HostPasteboard,
        client: &RequestClient,
    ) -> Result<(), ClientError> {
        let Some(remote) = client.get_clipboard().await? else {
            return Ok(());
        };
        let Some(content) = remote.content else {
            return Ok(());
        };
        let bytes = BASE64
            .decode(&content)
            .map_err(|e| ClientError::DecodingError(e.to_string()))?;
        let uti = remote.content_type.unwrap_or_else(|| "public.utf8-plain-text".into());
        let hash = sha256_hex(&bytes);

        if self.last_pushed_hash.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }

        let current = pasteboard.read_richest_item();
        let changed = match &current {
            Some(item) => item.uti != uti || sha256_hex(&item.bytes) != hash,
            None => true,
        };
        if !changed {
            return Ok(());
        }

        let item = ClipboardItem { bytes, uti };
        pasteboard.write_item(&item);
        self.last_pulled_hash = Some(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use vmbridge_core::{GuestEndpoint, ports};
    use vmbridge_dev_transport::TcpEndpoint;

    struct FakePasteboard {
        item: RefCell<Option<ClipboardItem>>,
        change_count: RefCell<u64>,
    }

    impl FakePasteboard {
        fn new() -> Self {
            Self {
                item: RefCell::new(None),
                change_count: RefCell::new(0),
            }
        }

        fn set(&self, item: ClipboardItem) {
            *self.item.borrow_mut() = Some(item);
            *self.change_count.borrow_mut() += 1;
        }
    }

    impl HostPasteboard for FakePasteboard {
        fn read_richest_item(&self) -> Option<ClipboardItem> {
            self.item.borrow().clone()
        }

        fn write_item(&self, item: &ClipboardItem) {
            *self.item.borrow_mut() = Some(item.clone());
        }

        fn change_count(&self) -> u64 {
            *self.change_count.borrow()
        }
    }

    async fn client_with_clipboard_response(response: &'static [u8]) -> RequestClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                let _ = stream.write_all(response).await;
            }
        });
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(TcpEndpoint::new().with_port(ports::CONTROL, port));
        RequestClient::new(endpoint)
    }

    #[tokio::test]
    async fn push_skips_when_change_count_unchanged() {
        let client = client_with_clipboard_response(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let pasteboard = FakePasteboard::new();
        pasteboard.set(ClipboardItem {
            bytes: b"hello".to_vec(),
            uti: "public.utf8-plain-text".into(),
        });

        let mut bridge = ClipboardBridge::new(ClipboardMode::HostToGuest);
        bridge.push(&pasteboard, &client).await.unwrap();
        assert_eq!(bridge.last_seen_change_count, Some(1));

        // No further pasteboard write, so the change count stays the
        // same; a second push should be a no-op.
        bridge.push(&pasteboard, &client).await.unwrap();
        assert_eq!(bridge.last_pushed_hash, bridge.last_pushed_hash.clone());
    }

    #[tokio::test]
    async fn pull_writes_guest_item_on_hash_change() {
        let body = format!(
            "{{\"content\":\"{}\",\"type\":\"public.utf8-plain-text\"}}",
            BASE64.encode(b"from guest")
        );
        let response = format!("HTTP/1.1 200 OK\r\n\r\n{body}");
        let response: &'static [u8] = Box::leak(response.into_bytes().into_boxed_slice());
        let client = client_with_clipboard_response(response).await;
        let pasteboard = FakePasteboard::new();

        let mut bridge = ClipboardBridge::new(ClipboardMode::GuestToHost);
        bridge.pull(&pasteboard, &client).await.unwrap();

        let item = pasteboard.read_richest_item().unwrap();
        assert_eq!(item.bytes, b"from guest");
    }

    #[tokio::test]
    async fn pull_suppresses_echo_of_last_pushed_content() {
        let body = format!(
            "{{\"content\":\"{}\",\"type\":\"public.utf8-plain-text\"}}",
            BASE64.encode(b"same")
        );
        let response = format!("HTTP/1.1 200 OK\r\n\r\n{body}");
        let response: &'static [u8] = Box::leak(response.into_bytes().into_boxed_slice());
        let client = client_with_clipboard_response(response).await;
        let pasteboard = FakePasteboard::new();

        let mut bridge = ClipboardBridge::new(ClipboardMode::Bidirectional);
        bridge.last_pushed_hash = Some(sha256_hex(b"same"));
        bridge.pull(&pasteboard, &client).await.unwrap();

        assert!(pasteboard.read_richest_item().is_none());
    }
}
