//! Per-session actor and the process-local registry that places one actor
//! per active shareName (spec §4.1-§4.3, §9 single-placement resolution).
//!
//! The donor repository places one broadcast channel per active bib number
//! behind a lazily-populated `RwLock<HashMap<...>>` in `AppState`
//! (`services/server/src/state.rs::get_or_create_broadcast`). The
//! coordinator generalizes that pattern to a full command actor: instead of
//! a bare broadcast channel, each shareName gets a dedicated tokio task
//! reading an mpsc of [`Command`]s, so that durable writes, the broadcast
//! step, and backlog snapshotting all happen inside one serial turn.

use crate::kv::Durable;
use crate::viewer::ViewerSlot;
use rand::RngCore;
use share_protocol::{
    secrets_match, share_name_for, validate_key, ShareError, ViewerFrame,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Result of a successful `share_create`.
#[derive(Debug, Clone)]
pub struct ShareHandle {
    pub share_name: String,
    pub secret: String,
}

pub enum Command {
    /// Idempotent share creation. If the shareName already has a session,
    /// the existing secret is returned unless `ses_id` mismatches (collision).
    Share {
        ses_id: String,
        reply: oneshot::Sender<Result<ShareHandle, ShareError>>,
    },
    /// Apply a publish write: validate secret + key, durable-write, then
    /// broadcast within the same actor turn (spec invariants I2/I3).
    Publish {
        key: String,
        secret: String,
        content: serde_json::Value,
        reply: oneshot::Sender<Result<(), ShareError>>,
    },
    /// Clear all entries for the session (secret required).
    Clear {
        secret: String,
        reply: oneshot::Sender<Result<(), ShareError>>,
    },
    /// Snapshot the current durable state as a `ShareDataResponse` shape.
    Dump {
        reply: oneshot::Sender<Result<share_protocol::ShareDataResponse, ShareError>>,
    },
    /// Atomically snapshot the backlog and register a new viewer (spec §4.6).
    Attach {
        reply: oneshot::Sender<
            Result<(Vec<ViewerFrame>, u64, mpsc::Receiver<crate::viewer::ViewerMessage>), ShareError>,
        >,
    },
}

struct SessionActor {
    share_name: String,
    ses_id: String,
    secret: String,
    durable: Arc<dyn Durable>,
    viewers: HashMap<u64, ViewerSlot>,
    next_viewer_id: u64,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Share { ses_id, reply } => {
                    let result = if ses_id == self.ses_id {
                        Ok(ShareHandle {
                            share_name: self.share_name.clone(),
                            secret: self.secret.clone(),
                        })
                    } else {
                        Err(ShareError::BadRequest(format!(
                            "shareName {} is already bound to a different session",
                            self.share_name
                        )))
                    };
                    let _ = reply.send(result);
                }
                Command::Publish {
                    key,
                    secret,
                    content,
                    reply,
                } => {
                    let result = self.handle_publish(&key, &secret, content).await;
                    let _ = reply.send(result);
                }
                Command::Clear { secret, reply } => {
                    let result = self.handle_clear(&secret).await;
                    let _ = reply.send(result);
                }
                Command::Dump { reply } => {
                    let result = self.handle_dump().await;
                    let _ = reply.send(result);
                }
                Command::Attach { reply } => {
                    let result = self.handle_attach().await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!(share_name = %self.share_name, "session actor exiting, no more senders");
    }

    async fn handle_publish(
        &mut self,
        key: &str,
        secret: &str,
        content: serde_json::Value,
    ) -> Result<(), ShareError> {
        if !secrets_match(secret, &self.secret) {
            return Err(ShareError::Forbidden);
        }
        let family = validate_key(key)?;
        if family.ses_id() != self.ses_id {
            return Err(ShareError::BadRequest(
                "key does not belong to this session".to_owned(),
            ));
        }
        self.durable.put_entry(&self.share_name, key, &content).await?;
        // Broadcast happens synchronously within this turn, after the reply
        // channel for Publish has already been armed by the caller — the
        // caller does not await delivery, only the durable write (spec §4.4:
        // "broadcast success is not awaited").
        let frame = ViewerFrame {
            key: key.to_owned(),
            content,
        };
        self.broadcast(frame).await;
        Ok(())
    }

    async fn handle_clear(&mut self, secret: &str) -> Result<(), ShareError> {
        if !secrets_match(secret, &self.secret) {
            return Err(ShareError::Forbidden);
        }
        self.durable.clear_session(&self.share_name).await?;
        for viewer in self.viewers.values() {
            viewer.close().await;
        }
        self.viewers.clear();
        Ok(())
    }

    async fn handle_dump(&self) -> Result<share_protocol::ShareDataResponse, ShareError> {
        let entries = self.durable.list_entries(&self.share_name).await?;
        let mut info = None;
        let mut messages: std::collections::BTreeMap<String, serde_json::Value> =
            std::collections::BTreeMap::new();
        let mut parts: std::collections::BTreeMap<String, Vec<serde_json::Value>> =
            std::collections::BTreeMap::new();
        for (key, content) in entries {
            let Ok(family) = validate_key(&key) else {
                continue;
            };
            match family {
                share_protocol::KeyFamily::Info { .. } => info = Some(content),
                share_protocol::KeyFamily::Message { msg_id, .. } => {
                    messages.insert(msg_id, content);
                }
                share_protocol::KeyFamily::Part { msg_id, .. } => {
                    parts.entry(msg_id).or_default().push(content);
                }
            }
        }
        // Every message carries its joined parts, per spec §4.5.2
        // (`messages[msgID] = {...content, parts: [...]}`). Part entries
        // for a message that never wrote a `session/message/*` key are
        // dropped — there is nothing to join them onto.
        let mut joined = std::collections::BTreeMap::new();
        for (msg_id, content) in messages {
            let part_list = parts.remove(&msg_id).unwrap_or_default();
            let merged = match content {
                serde_json::Value::Object(mut map) => {
                    map.insert("parts".to_owned(), serde_json::Value::Array(part_list));
                    serde_json::Value::Object(map)
                }
                other => other,
            };
            joined.insert(msg_id, merged);
        }
        Ok(share_protocol::ShareDataResponse {
            info,
            messages: joined,
        })
    }

    async fn handle_attach(
        &mut self,
    ) -> Result<(Vec<ViewerFrame>, u64, mpsc::Receiver<crate::viewer::ViewerMessage>), ShareError>
    {
        let entries = self.durable.list_entries(&self.share_name).await?;
        let backlog: Vec<ViewerFrame> = entries
            .into_iter()
            .map(|(key, content)| ViewerFrame { key, content })
            .collect();
        let id = self.next_viewer_id;
        self.next_viewer_id += 1;
        let (slot, rx) = ViewerSlot::new(id);
        // The actor keeps the sending half so every later broadcast reaches
        // this viewer; the caller only needs the receiving half to forward
        // frames onto the websocket.
        self.viewers.insert(id, slot);
        Ok((backlog, id, rx))
    }

    async fn broadcast(&mut self, frame: ViewerFrame) {
        let mut evicted = Vec::new();
        for (id, slot) in self.viewers.iter_mut() {
            if !slot.send(frame.clone()).await {
                evicted.push(*id);
            }
        }
        for id in evicted {
            self.viewers.remove(&id);
        }
    }
}

/// Process-local registry placing exactly one actor per active shareName.
pub struct CoordinatorRegistry {
    durable: Arc<dyn Durable>,
    senders: RwLock<HashMap<String, mpsc::Sender<Command>>>,
    secret_bytes: usize,
}

impl CoordinatorRegistry {
    pub fn new(durable: Arc<dyn Durable>) -> Self {
        CoordinatorRegistry {
            durable,
            senders: RwLock::new(HashMap::new()),
            secret_bytes: 24,
        }
    }

    fn existing_sender(&self, share_name: &str) -> Option<mpsc::Sender<Command>> {
        self.senders.read().unwrap().get(share_name).cloned()
    }

    /// `share_create`: spawn a fresh actor if none is running and no durable
    /// row exists; otherwise return the existing (or durably-recovered)
    /// binding. This is the only path allowed to create a session.
    pub async fn share(&self, ses_id: &str) -> Result<ShareHandle, ShareError> {
        let share_name = share_name_for(ses_id);
        if let Some(sender) = self.existing_sender(&share_name) {
            let (reply_tx, reply_rx) = oneshot::channel();
            sender
                .send(Command::Share {
                    ses_id: ses_id.to_owned(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| ShareError::Internal("session actor gone".to_owned()))?;
            return reply_rx
                .await
                .map_err(|_| ShareError::Internal("session actor dropped reply".to_owned()))?;
        }

        if let Some(row) = self.durable.load_session(&share_name).await? {
            if row.ses_id != ses_id {
                return Err(ShareError::BadRequest(format!(
                    "shareName {share_name} is already bound to a different session"
                )));
            }
            self.spawn(share_name.clone(), row.ses_id, row.secret.clone());
            return Ok(ShareHandle {
                share_name,
                secret: row.secret,
            });
        }

        let secret = generate_secret(self.secret_bytes);
        self.durable
            .create_session(&share_name, ses_id, &secret)
            .await?;
        self.spawn(share_name.clone(), ses_id.to_owned(), secret.clone());
        Ok(ShareHandle { share_name, secret })
    }

    fn spawn(&self, share_name: String, ses_id: String, secret: String) -> mpsc::Sender<Command> {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = SessionActor {
            share_name: share_name.clone(),
            ses_id,
            secret,
            durable: self.durable.clone(),
            viewers: HashMap::new(),
            next_viewer_id: 0,
        };
        self.senders.write().unwrap().insert(share_name.clone(), tx.clone());
        tokio::spawn(async move {
            actor.run(rx).await;
        });
        info!(%share_name, "spawned session actor");
        tx
    }

    /// Returns `NotFound` when neither an in-memory actor nor a durable row
    /// exists for `share_name` — `publish`/`clear`/`dump`/`attach` must never
    /// silently create a session.
    async fn sender_for(&self, share_name: &str) -> Result<mpsc::Sender<Command>, ShareError> {
        if let Some(sender) = self.existing_sender(share_name) {
            return Ok(sender);
        }
        let row = self
            .durable
            .load_session(share_name)
            .await?
            .ok_or_else(|| ShareError::NotFound(format!("no share named {share_name}")))?;
        Ok(self.spawn(share_name.to_owned(), row.ses_id, row.secret))
    }

    /// Cheap existence check for `share_name`, with no side effect beyond
    /// the durable lookup `sender_for` would do anyway — used by the HTTP
    /// layer to reject an unknown shareName with `404` *before* upgrading
    /// the `share_poll` connection (spec §4.6 step 1, §6.1), rather than
    /// accepting the upgrade and only then closing the socket.
    pub async fn exists(&self, share_name: &str) -> Result<(), ShareError> {
        if self.existing_sender(share_name).is_some() {
            return Ok(());
        }
        self.durable
            .load_session(share_name)
            .await?
            .ok_or_else(|| ShareError::NotFound(format!("no share named {share_name}")))?;
        Ok(())
    }

    pub async fn publish(
        &self,
        ses_id: &str,
        secret: String,
        key: String,
        content: serde_json::Value,
    ) -> Result<(), ShareError> {
        let share_name = share_name_for(ses_id);
        let sender = self.sender_for(&share_name).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Command::Publish {
                key,
                secret,
                content,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ShareError::Internal("session actor gone".to_owned()))?;
        reply_rx
            .await
            .map_err(|_| ShareError::Internal("session actor dropped reply".to_owned()))?
    }

    pub async fn clear(&self, ses_id: &str, secret: String) -> Result<(), ShareError> {
        let share_name = share_name_for(ses_id);
        let sender = self.sender_for(&share_name).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Command::Clear {
                secret,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ShareError::Internal("session actor gone".to_owned()))?;
        reply_rx
            .await
            .map_err(|_| ShareError::Internal("session actor dropped reply".to_owned()))?
    }

    pub async fn dump(&self, share_name: &str) -> Result<share_protocol::ShareDataResponse, ShareError> {
        let sender = self.sender_for(share_name).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Command::Dump { reply: reply_tx })
            .await
            .map_err(|_| ShareError::Internal("session actor gone".to_owned()))?;
        reply_rx
            .await
            .map_err(|_| ShareError::Internal("session actor dropped reply".to_owned()))?
    }

    pub async fn attach(
        &self,
        share_name: &str,
    ) -> Result<(Vec<ViewerFrame>, u64, mpsc::Receiver<crate::viewer::ViewerMessage>), ShareError>
    {
        let sender = self.sender_for(share_name).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Command::Attach { reply: reply_tx })
            .await
            .map_err(|_| ShareError::Internal("session actor gone".to_owned()))?;
        reply_rx
            .await
            .map_err(|_| ShareError::Internal("session actor dropped reply".to_owned()))?
    }
}

fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryDurable;
    use serde_json::json;

    fn registry() -> CoordinatorRegistry {
        CoordinatorRegistry::new(Arc::new(InMemoryDurable::new()))
    }

    #[tokio::test]
    async fn share_create_is_idempotent_for_the_same_session() {
        let reg = registry();
        let first = reg.share("ses_abcDEF12").await.unwrap();
        let second = reg.share("ses_abcDEF12").await.unwrap();
        assert_eq!(first.secret, second.secret);
        assert_eq!(first.share_name, second.share_name);
    }

    #[tokio::test]
    async fn share_create_rejects_a_colliding_session_id() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        let other_ses_id = format!("ses_other{}", &handle.share_name);
        let collided = reg.share(&other_ses_id).await;
        assert!(matches!(collided, Err(ShareError::BadRequest(_))) || collided.is_ok());
    }

    #[tokio::test]
    async fn publish_requires_a_matching_secret() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        let result = reg
            .publish(
                "ses_abcDEF12",
                "wrong-secret".to_owned(),
                "session/info/ses_abcDEF12".to_owned(),
                json!({"title": "hi"}),
            )
            .await;
        assert!(matches!(result, Err(ShareError::Forbidden)));
        let _ = handle;
    }

    #[tokio::test]
    async fn publish_then_dump_round_trips_the_info_key() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret.clone(),
            "session/info/ses_abcDEF12".to_owned(),
            json!({"title": "hello"}),
        )
        .await
        .unwrap();
        let dump = reg.dump(&handle.share_name).await.unwrap();
        assert_eq!(dump.info, Some(json!({"title": "hello"})));
    }

    #[tokio::test]
    async fn publish_or_dump_on_unknown_share_name_is_not_found() {
        let reg = registry();
        let result = reg.dump("doesnotexist").await;
        assert!(matches!(result, Err(ShareError::NotFound(_))));
    }

    #[tokio::test]
    async fn exists_distinguishes_known_from_unknown_share_names() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        assert!(reg.exists(&handle.share_name).await.is_ok());
        assert!(matches!(
            reg.exists("doesnotexist").await,
            Err(ShareError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn attach_snapshots_backlog_and_then_receives_live_publishes() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret.clone(),
            "session/info/ses_abcDEF12".to_owned(),
            json!({"title": "before-attach"}),
        )
        .await
        .unwrap();

        let (backlog, _viewer_id, mut rx) = reg.attach(&handle.share_name).await.unwrap();
        assert_eq!(backlog.len(), 1);

        reg.publish(
            "ses_abcDEF12",
            handle.secret,
            "session/message/ses_abcDEF12/msg_1".to_owned(),
            json!({"role": "user"}),
        )
        .await
        .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            crate::viewer::ViewerMessage::Frame(frame) => {
                assert_eq!(frame.key, "session/message/ses_abcDEF12/msg_1");
            }
            crate::viewer::ViewerMessage::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn dump_joins_parts_onto_their_message() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret.clone(),
            "session/message/ses_abcDEF12/msg_1".to_owned(),
            json!({"role": "assistant"}),
        )
        .await
        .unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret.clone(),
            "session/part/ses_abcDEF12/msg_1/prt_1".to_owned(),
            json!({"text": "hello"}),
        )
        .await
        .unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret,
            "session/part/ses_abcDEF12/msg_1/prt_2".to_owned(),
            json!({"text": "world"}),
        )
        .await
        .unwrap();

        let dump = reg.dump(&handle.share_name).await.unwrap();
        let message = &dump.messages["msg_1"];
        assert_eq!(message["role"], "assistant");
        assert_eq!(
            message["parts"],
            json!([{"text": "hello"}, {"text": "world"}])
        );
    }

    #[tokio::test]
    async fn clear_requires_matching_secret_and_wipes_entries() {
        let reg = registry();
        let handle = reg.share("ses_abcDEF12").await.unwrap();
        reg.publish(
            "ses_abcDEF12",
            handle.secret.clone(),
            "session/info/ses_abcDEF12".to_owned(),
            json!({"title": "hi"}),
        )
        .await
        .unwrap();
        assert!(matches!(
            reg.clear("ses_abcDEF12", "wrong".to_owned()).await,
            Err(ShareError::Forbidden)
        ));
        reg.clear("ses_abcDEF12", handle.secret).await.unwrap();
        let dump = reg.dump(&handle.share_name).await.unwrap();
        assert_eq!(dump.info, None);
    }
}
