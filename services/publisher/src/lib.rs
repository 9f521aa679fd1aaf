//! Author-side publisher pipeline (spec §4.4).
//!
//! Subscribes to [`share_storage::StorageWriteEvent`]; writes to keys
//! outside a shared session, or whose session has no secret registered yet,
//! are dropped. Writes for a shared session are coalesced per key (last
//! value wins while a POST for that key is in flight) and relayed to the
//! coordinator with a single in-flight POST at a time.

use share_bus::{Bus, Subscription};
use share_protocol::{is_session_key, validate_key, PublishEnvelope, DEFAULT_COORDINATOR_URL};
use share_storage::StorageWriteEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The author's local record of which sessions are shared and under what
/// secret. Populated by a `share_create` flow (out of scope here) and
/// consulted by the pipeline to decide whether a write should be relayed.
#[derive(Default)]
pub struct SharedSessions {
    secrets: RwLock<HashMap<String, String>>,
}

impl SharedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_secret(&self, ses_id: impl Into<String>, secret: impl Into<String>) {
        self.secrets.write().unwrap().insert(ses_id.into(), secret.into());
    }

    pub fn secret_for(&self, ses_id: &str) -> Option<String> {
        self.secrets.read().unwrap().get(ses_id).cloned()
    }

    pub fn forget(&self, ses_id: &str) {
        self.secrets.write().unwrap().remove(ses_id);
    }
}

struct PendingState {
    values: HashMap<String, serde_json::Value>,
    queue: VecDeque<String>,
    shutting_down: bool,
}

/// The author-side publisher pipeline.
pub struct PublisherPipeline {
    state: Arc<Mutex<PendingState>>,
    notify: Arc<Notify>,
    dispatcher: Option<JoinHandle<()>>,
    _subscription: Subscription,
}

impl PublisherPipeline {
    /// Subscribe to `bus` and start the serial dispatch task that POSTs to
    /// `coordinator_url` (default [`DEFAULT_COORDINATOR_URL`] when `None`).
    pub fn new(
        bus: &Bus,
        shared: Arc<SharedSessions>,
        client: reqwest::Client,
        coordinator_url: Option<String>,
    ) -> Self {
        let state = Arc::new(Mutex::new(PendingState {
            values: HashMap::new(),
            queue: VecDeque::new(),
            shutting_down: false,
        }));
        let notify = Arc::new(Notify::new());
        let coordinator_url = coordinator_url.unwrap_or_else(|| DEFAULT_COORDINATOR_URL.to_owned());

        let dispatch_state = state.clone();
        let dispatch_notify = notify.clone();
        let dispatcher = tokio::spawn(dispatch_loop(
            dispatch_state,
            dispatch_notify,
            shared.clone(),
            client,
            coordinator_url,
        ));

        let enqueue_state = state.clone();
        let enqueue_notify = notify.clone();
        let subscription = bus.subscribe::<StorageWriteEvent, _>(move |event| {
            enqueue(&enqueue_state, &enqueue_notify, event);
        });

        PublisherPipeline {
            state,
            notify,
            dispatcher: Some(dispatcher),
            _subscription: subscription,
        }
    }

    /// Number of keys currently awaiting dispatch (for tests/observability).
    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Drain whatever is pending, abandoning anything left after `deadline`
    /// (spec §4.4: "drains the pending map with a bounded deadline (default
    /// 5s)").
    pub async fn shutdown(mut self, deadline: Duration) {
        self.state.lock().unwrap().shutting_down = true;
        let state = self.state.clone();
        let drained = tokio::time::timeout(deadline, async move {
            loop {
                if state.lock().unwrap().queue.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("publisher pipeline shutdown deadline elapsed with pending writes abandoned");
        }
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}

fn enqueue(state: &Arc<Mutex<PendingState>>, notify: &Notify, event: &StorageWriteEvent) {
    if !is_session_key(&event.key) {
        return;
    }
    let Ok(_) = validate_key(&event.key) else {
        debug!(key = %event.key, "dropping write for malformed key");
        return;
    };
    let mut state = state.lock().unwrap();
    if state.shutting_down {
        return;
    }
    let is_new = !state.values.contains_key(&event.key);
    state.values.insert(event.key.clone(), event.content.clone());
    if is_new {
        state.queue.push_back(event.key.clone());
    }
    drop(state);
    notify.notify_one();
}

async fn dispatch_loop(
    state: Arc<Mutex<PendingState>>,
    notify: Arc<Notify>,
    shared: Arc<SharedSessions>,
    client: reqwest::Client,
    coordinator_url: String,
) {
    loop {
        let next = {
            let mut state = state.lock().unwrap();
            match state.queue.pop_front() {
                Some(key) => state.values.remove(&key).map(|content| (key, content)),
                None => None,
            }
        };
        let Some((key, content)) = next else {
            notify.notified().await;
            continue;
        };
        let Ok(family) = validate_key(&key) else {
            continue;
        };
        let ses_id = family.ses_id().to_owned();
        let Some(secret) = shared.secret_for(&ses_id) else {
            debug!(%ses_id, "dropping write for session with no registered secret");
            continue;
        };
        let envelope = PublishEnvelope {
            session_id: ses_id.clone(),
            secret,
            key: key.clone(),
            content,
        };
        match client
            .post(format!("{coordinator_url}/share_sync"))
            .timeout(Duration::from_secs(10))
            .json(&envelope)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(%key, "relayed write to coordinator");
            }
            Ok(resp) => {
                warn!(%key, status = %resp.status(), "coordinator rejected share_sync");
            }
            Err(err) => {
                warn!(%key, error = %err, "share_sync POST failed, will not be retried");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use share_storage::Storage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn non_session_keys_are_dropped_without_registering_a_secret() {
        let bus = Bus::new();
        let shared = Arc::new(SharedSessions::new());
        let pipeline = PublisherPipeline::new(
            &bus,
            shared.clone(),
            reqwest::Client::new(),
            Some("http://127.0.0.1:1".to_owned()),
        );
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), bus, &[]).unwrap();
        storage.write_json("internal/bookkeeping", &json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.pending_len(), 0);
    }

    #[tokio::test]
    async fn writes_for_unshared_sessions_are_queued_then_dropped_at_dispatch() {
        let bus = Bus::new();
        let shared = Arc::new(SharedSessions::new());
        let pipeline = PublisherPipeline::new(
            &bus,
            shared,
            reqwest::Client::new(),
            Some("http://127.0.0.1:1".to_owned()),
        );
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), bus, &[]).unwrap();
        storage
            .write_json("session/info/ses_unshared1", &json!({"title": "x"}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Dispatcher picks it up and drops it since no secret is registered;
        // it must not wedge the queue.
        assert_eq!(pipeline.pending_len(), 0);
    }

    /// A minimal hand-rolled HTTP/1.1 responder, in the accept-loop shape
    /// `rt_test_utils::MockWsServer` uses for the websocket uplink: bind to
    /// port 0, spawn one task per connection, read the request, wait
    /// `delay` before replying, so a caller can hold a POST "in flight" on
    /// demand instead of racing real network latency.
    async fn slow_http_server(delay: Duration, hits: Arc<AtomicUsize>) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let mut content_length = 0usize;
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") else {
                            continue;
                        };
                        let headers = String::from_utf8_lossy(&buf[..header_end]);
                        content_length = headers
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        let already = buf.len() - (header_end + 4);
                        if already >= content_length {
                            break;
                        }
                    }
                    tokio::time::sleep(delay).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                });
            }
        });
        addr
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[tokio::test]
    async fn coalesces_rapid_writes_to_the_same_key() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = slow_http_server(Duration::from_millis(300), hits.clone()).await;

        let bus = Bus::new();
        let shared = Arc::new(SharedSessions::new());
        shared.set_secret("ses_coalesce1", "s3cr3t");

        let pipeline = PublisherPipeline::new(
            &bus,
            shared,
            reqwest::Client::new(),
            Some(format!("http://{addr}")),
        );
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), bus, &[]).unwrap();

        storage
            .write_json("session/info/ses_coalesce1", &json!({"n": 1}))
            .unwrap();
        // Give the dispatcher time to pop this write and put its POST in
        // flight against the slow server, without waiting for it to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.pending_len(), 0, "first write should be in flight, not pending");

        for n in 2..=3 {
            storage
                .write_json("session/info/ses_coalesce1", &json!({"n": n}))
                .unwrap();
        }
        // Both writes land while the first POST is still in flight (it sleeps
        // 300ms); they must collapse to a single queued entry (P6).
        assert_eq!(pipeline.pending_len(), 1);

        // Let the in-flight POST finish and the coalesced one get dispatched.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(pipeline.pending_len(), 0);
        assert_eq!(
            hits.load(Ordering::SeqCst),
            2,
            "exactly one POST for the first write and one for the coalesced n=3 value"
        );
    }

    #[tokio::test]
    async fn shutdown_abandons_whatever_remains_after_the_deadline() {
        let bus = Bus::new();
        let shared = Arc::new(SharedSessions::new());
        let pipeline = PublisherPipeline::new(
            &bus,
            shared,
            reqwest::Client::new(),
            // Unroutable address: every POST will hang or fail slowly, so
            // the queue is guaranteed non-empty at shutdown.
            Some("http://10.255.255.1:1".to_owned()),
        );
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), bus, &[]).unwrap();
        for n in 0..5 {
            storage
                .write_json(&format!("session/info/ses_shutdown{n}"), &json!({"n": n}))
                .unwrap();
        }
        pipeline.shutdown(Duration::from_millis(50)).await;
    }
}
