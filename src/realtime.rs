//! Realtime subscription to profile-update events.
//!
//! The backend pushes row changes over a websocket.  [`RealtimeChannel`] is
//! the seam: it opens one logical [`Subscription`] per call, filtered to a
//! friend-id set.  The production implementation, [`WsRealtimeChannel`],
//! connects with `tokio-tungstenite` and filters client-side since the
//! backend pushes whole-table changes.
//!
//! Callers never hold two subscriptions at once: the session controller
//! tears the current one down before opening the next.  Dropping a
//! [`Subscription`] aborts its feed task, so no channel outlives its
//! consumer.  Transport failures reconnect with bounded exponential
//! backoff; once the budget is exhausted the stream ends.

use std::collections::HashSet;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::location_sync::ProfileChange;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Factory for realtime subscriptions.
pub trait RealtimeChannel: Send + Sync {
    /// Open a subscription for profile updates of the given friends.
    ///
    /// An empty id set returns an already-closed subscription: no socket is
    /// opened and the value is safe to discard without further teardown.
    fn open(&self, friend_ids: HashSet<String>) -> Subscription;
}

/// A live stream of decoded profile updates.
pub struct Subscription {
    events: mpsc::Receiver<ProfileChange>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    /// A subscription whose stream has already ended.
    pub fn closed() -> Self {
        let (_tx, events) = mpsc::channel(1);
        Self { events, task: None }
    }

    /// Wrap an externally fed receiver.  Used by in-process channel fakes.
    pub fn from_receiver(events: mpsc::Receiver<ProfileChange>) -> Self {
        Self { events, task: None }
    }

    fn with_task(events: mpsc::Receiver<ProfileChange>, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<ProfileChange> {
        self.events.recv().await
    }

    /// Tear the subscription down.  After this returns no further event is
    /// delivered and no network resource remains open.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Frame routing
// ---------------------------------------------------------------------------

/// Decode one websocket text frame into a profile update for a watched
/// friend.
///
/// Only `update` events on the `users` table are consumed.  Anything else —
/// other tables, other operations, malformed frames, rows for ids outside
/// `friend_ids` — returns `None`.
fn route_frame(text: &str, friend_ids: &HashSet<String>) -> Option<ProfileChange> {
    let frame: serde_json::Value = serde_json::from_str(text).ok()?;
    if frame.get("table")?.as_str()? != "users" {
        return None;
    }
    if !frame.get("type")?.as_str()?.eq_ignore_ascii_case("update") {
        return None;
    }
    let change = ProfileChange::decode(frame.get("record")?)?;
    friend_ids.contains(&change.id).then_some(change)
}

// ---------------------------------------------------------------------------
// Websocket implementation
// ---------------------------------------------------------------------------

/// [`RealtimeChannel`] over the backend's websocket change feed.
pub struct WsRealtimeChannel {
    ws_url: String,
    api_key: String,
}

impl WsRealtimeChannel {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl RealtimeChannel for WsRealtimeChannel {
    fn open(&self, friend_ids: HashSet<String>) -> Subscription {
        if friend_ids.is_empty() {
            return Subscription::closed();
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let url = format!("{}?apikey={}", self.ws_url, self.api_key);
        let task = tokio::spawn(feed_loop(url, friend_ids, tx));
        Subscription::with_task(rx, task)
    }
}

/// Connect, subscribe, and forward decoded updates until the receiver is
/// dropped or the reconnect budget runs out.
async fn feed_loop(url: String, friend_ids: HashSet<String>, tx: mpsc::Sender<ProfileChange>) {
    let mut attempts = 0u32;
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                attempts = 0;
                backoff_secs = INITIAL_BACKOFF_SECS;
                crate::cvlog!("realtime: connected ({} watched id(s))", friend_ids.len());

                let (mut write, mut read) = ws_stream.split();

                // Ask the backend for change events on the users table.  The
                // id filter is advisory; we re-filter every frame locally.
                let join = serde_json::json!({
                    "type": "subscribe",
                    "table": "users",
                    "ids": friend_ids.iter().collect::<Vec<_>>(),
                });
                if let Ok(text) = serde_json::to_string(&join) {
                    let _ = write.send(WsMessage::Text(text)).await;
                }

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            if let Some(change) = route_frame(&text, &friend_ids) {
                                if tx.send(change).await.is_err() {
                                    // Subscriber gone — tear down silently.
                                    return;
                                }
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Err(e) => {
                            crate::cvlog!("realtime: stream error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                crate::cvlog!(
                    "realtime: connect failed (retry in {}s): {}",
                    backoff_secs,
                    e
                );
            }
        }

        attempts += 1;
        if attempts >= RECONNECT_ATTEMPTS {
            crate::cvlog!(
                "realtime: giving up after {} attempt(s); stream ends",
                attempts
            );
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}
