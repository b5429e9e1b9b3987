//! The Event Stream Reader (spec.md §4.6): a reconnect loop per event
//! port that frames newline-delimited JSON and dispatches by `type`.
//!
//! Grounded on `capsa_net::dns_cache`'s "own the leftover state across
//! calls, update shared state through a callback" shape, adapted from a
//! TTL cache to a line-framing byte accumulator, and on the
//! `RuntimeError` error-sink callback convention used by the supervisor
//! (spec.md §4.5) for routing discrete events without dropping any of a
//! burst (a `watch` cell would lose all but the last of several events
//! read in one chunk).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use vmbridge_core::{AsyncOwnedFd, Event, GuestEndpoint, TransportError, ports};

use crate::vsock;

const READ_CHUNK: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked once per successfully parsed event line, on the caller's
/// executor (spec.md §4.6 step 3 "route to the associated observable
/// state").
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Rejects `urls` entries whose scheme is not a web URL (spec.md §4.6
/// "a host-side filter rejects entries whose scheme is not a web URL").
fn is_web_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Runs the reconnect-and-dispatch loop for one event port, invoking
/// `sink` for every successfully parsed [`Event`]. Aborting the returned
/// `JoinHandle` exits the loop (spec.md §4.6 step 4 "cancellation of the
/// outer task exits the loop").
pub fn spawn(endpoint: Arc<dyn GuestEndpoint>, sink: EventSink) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_once(endpoint.as_ref(), &sink).await {
                tracing::debug!(error = %e, "event stream connection ended");
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

/// Holds one event connection open for its lifetime (spec.md §4.6 step
/// 1) and dispatches lines until a read returns `<= 0`.
async fn run_once(endpoint: &dyn GuestEndpoint, sink: &EventSink) -> Result<(), TransportError> {
    let conn = vsock::connect(endpoint, ports::EVENT, CONNECT_TIMEOUT).await?;
    let mut handle = vsock::async_handle(conn.as_ref())?;

    let mut leftover = Vec::new();
    loop {
        match read_some(&mut handle).await? {
            None => return Ok(()),
            Some(bytes) => {
                leftover.extend_from_slice(&bytes);
                dispatch_complete_lines(&mut leftover, sink);
            }
        }
    }
}

async fn read_some(handle: &mut AsyncOwnedFd) -> Result<Option<Vec<u8>>, TransportError> {
    let mut buf = vec![0u8; READ_CHUNK];
    match handle.read(&mut buf).await {
        Ok(0) => Ok(None),
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(e) => Err(TransportError::from(e)),
    }
}

/// Splits `buffer` on LF, dispatching each complete line and leaving any
/// trailing partial line in place for the next read (spec.md §4.6 steps
/// 2-3).
fn dispatch_complete_lines(buffer: &mut Vec<u8>, sink: &EventSink) {
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Event>(line) {
            Ok(mut event) => {
                if let Event::Urls { urls } = &mut event {
                    urls.retain(|u| is_web_url(u));
                }
                sink(event);
            }
            Err(e) => tracing::debug!(error = %e, "failed to parse event line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sink: EventSink = Arc::new(move |event| events_clone.lock().unwrap().push(event));
        (sink, events)
    }

    #[test]
    fn dispatch_splits_multiple_lines_and_keeps_partial_tail() {
        let (sink, events) = collecting_sink();
        let mut buffer = br#"{"type":"log","message":"a"}
{"type":"log","message":"b"}
{"type":"log","parti"#
            .to_vec();

        dispatch_complete_lines(&mut buffer, &sink);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Log { message } if message == "a"));
        assert!(matches!(&events[1], Event::Log { message } if message == "b"));
        assert_eq!(buffer, br#"{"type":"log","parti"#.to_vec());
    }

    #[test]
    fn urls_event_filters_non_web_schemes() {
        let (sink, events) = collecting_sink();
        let mut buffer =
            br#"{"type":"urls","urls":["https://example.com","file:///etc/passwd","http://ok"]}
"#
            .to_vec();

        dispatch_complete_lines(&mut buffer, &sink);

        let events = events.lock().unwrap();
        match &events[0] {
            Event::Urls { urls } => {
                assert_eq!(
                    urls,
                    &vec!["https://example.com".to_string(), "http://ok".to_string()]
                );
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ports_event_accepts_legacy_integer_form() {
        let (sink, events) = collecting_sink();
        let mut buffer = br#"{"type":"ports","ports":[80,443]}
"#
        .to_vec();

        dispatch_complete_lines(&mut buffer, &sink);

        let events = events.lock().unwrap();
        match &events[0] {
            Event::Ports { ports } => assert_eq!(ports.0.len(), 2),
            _ => panic!("wrong variant"),
        }
    }
}
