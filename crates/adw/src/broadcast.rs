//! Broadcast Hub (C9).
//!
//! Fans run-state changes out to WebSocket subscribers over axum's `ws`
//! extractor, one `tokio::sync::broadcast` channel per topic. A topic is
//! a run id; subscribing to the reserved topic `"_all"` receives every
//! run's events. Late subscribers get a snapshot envelope first so they
//! don't have to reconstruct state from a partial event stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use adw_types::{PhaseQueueEntry, RunId};

const CHANNEL_CAPACITY: usize = 256;
const ALL_TOPIC: &str = "_all";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "envelope", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Sent once, immediately after a subscriber connects, carrying
    /// whatever queue state is currently known for the requested topic.
    Snapshot {
        version: u64,
        entries: Vec<PhaseQueueEntry>,
    },
    /// One phase queue row changed.
    Update {
        version: u64,
        entry: PhaseQueueEntry,
    },
}

struct Topic {
    tx: broadcast::Sender<BroadcastMessage>,
    version: u64,
}

#[derive(Clone)]
pub struct BroadcastHub {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn topic_entry<'a>(
        topics: &'a mut HashMap<String, Topic>,
        name: &str,
    ) -> &'a mut Topic {
        topics.entry(name.to_string()).or_insert_with(|| Topic {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            version: 0,
        })
    }

    /// Publish an update for `run_id`, fanning it out to both the
    /// run-specific topic and the catch-all `"_all"` topic.
    pub fn publish(&self, run_id: &RunId, entry: PhaseQueueEntry) {
        let mut topics = self.topics.lock().expect("broadcast hub mutex poisoned");

        let run_topic = Self::topic_entry(&mut topics, run_id);
        run_topic.version += 1;
        let msg = BroadcastMessage::Update {
            version: run_topic.version,
            entry: entry.clone(),
        };
        let _ = run_topic.tx.send(msg);

        let all_topic = Self::topic_entry(&mut topics, ALL_TOPIC);
        all_topic.version += 1;
        let _ = all_topic.tx.send(BroadcastMessage::Update {
            version: all_topic.version,
            entry,
        });
    }

    fn subscribe(&self, topic: &str) -> (broadcast::Receiver<BroadcastMessage>, u64) {
        let mut topics = self.topics.lock().expect("broadcast hub mutex poisoned");
        let t = Self::topic_entry(&mut topics, topic);
        (t.tx.subscribe(), t.version)
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/ws/{topic}", get(ws_handler))
            .with_state(self)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<BroadcastHub>,
    Path(topic): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, topic))
}

async fn handle_socket(mut socket: WebSocket, hub: BroadcastHub, topic: String) {
    let (mut rx, version) = hub.subscribe(&topic);

    let snapshot = BroadcastMessage::Snapshot {
        version,
        entries: Vec::new(),
    };
    if send_json(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(update) => {
                        if send_json(&mut socket, &update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, msg: &BroadcastMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("BroadcastMessage always serializes");
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use adw_types::{PhaseName, QueueStatus};

    fn entry() -> PhaseQueueEntry {
        PhaseQueueEntry::new("run-1-p1".into(), "run-1".into(), None, PhaseName::Plan, Utc::now())
            .unwrap()
    }

    #[test]
    fn publish_increments_version_per_topic() {
        let hub = BroadcastHub::new();
        let (mut rx, _) = hub.subscribe("run-1");
        hub.publish(&"run-1".to_string(), entry());
        let msg = rx.try_recv().unwrap();
        match msg {
            BroadcastMessage::Update { version, .. } => assert_eq!(version, 1),
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn publish_fans_out_to_catch_all_topic() {
        let hub = BroadcastHub::new();
        let (mut rx_all, _) = hub.subscribe(ALL_TOPIC);
        hub.publish(&"run-1".to_string(), entry());
        assert!(rx_all.try_recv().is_ok());
    }

    #[test]
    fn subscribe_before_any_publish_starts_at_version_zero() {
        let hub = BroadcastHub::new();
        let (_, version) = hub.subscribe("run-x");
        assert_eq!(version, 0);
    }

    #[test]
    fn independent_topics_do_not_cross_contaminate() {
        let hub = BroadcastHub::new();
        let (mut rx_a, _) = hub.subscribe("run-a");
        hub.publish(&"run-b".to_string(), entry());
        assert!(rx_a.try_recv().is_err());
    }
}
