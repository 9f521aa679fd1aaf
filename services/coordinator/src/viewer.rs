//! Per-viewer delivery for an attached websocket (spec §4.6).
//!
//! Each viewer gets a bounded mpsc channel fed from the session actor's
//! broadcast step. A send that doesn't clear within [`SEND_TIMEOUT`] counts
//! as a strike; [`MAX_STRIKES`] consecutive strikes evicts the viewer. A
//! closed receiver (the websocket task has gone away) evicts immediately
//! without counting as a strike.

use share_protocol::ViewerFrame;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_STRIKES: u32 = 3;
const VIEWER_CHANNEL_CAPACITY: usize = 32;

/// Message pushed to a viewer's websocket-writer task.
#[derive(Debug, Clone)]
pub enum ViewerMessage {
    Frame(ViewerFrame),
    Close,
}

/// The session actor's handle onto one attached viewer.
pub struct ViewerSlot {
    pub id: u64,
    tx: mpsc::Sender<ViewerMessage>,
    strikes: u32,
}

impl ViewerSlot {
    pub fn new(id: u64) -> (Self, mpsc::Receiver<ViewerMessage>) {
        let (tx, rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        (
            ViewerSlot {
                id,
                tx,
                strikes: 0,
            },
            rx,
        )
    }

    /// Attempt to deliver `frame`. Returns `false` if the viewer should be
    /// evicted (closed channel, or [`MAX_STRIKES`] consecutive timeouts).
    pub async fn send(&mut self, frame: ViewerFrame) -> bool {
        match tokio::time::timeout(SEND_TIMEOUT, self.tx.send(ViewerMessage::Frame(frame))).await {
            Ok(Ok(())) => {
                self.strikes = 0;
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                self.strikes += 1;
                self.strikes < MAX_STRIKES
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.tx.send(ViewerMessage::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: u32) -> ViewerFrame {
        ViewerFrame {
            key: format!("session/message/ses_x/msg_{n}"),
            content: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn send_succeeds_and_resets_strikes_on_a_draining_receiver() {
        let (mut slot, mut rx) = ViewerSlot::new(1);
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(msg) = rx.recv().await {
                received.push(msg);
                if received.len() == 2 {
                    break;
                }
            }
            received
        });
        assert!(slot.send(frame(1)).await);
        assert!(slot.send(frame(2)).await);
        let received = handle.await.unwrap();
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn closed_receiver_evicts_immediately() {
        let (mut slot, rx) = ViewerSlot::new(2);
        drop(rx);
        assert!(!slot.send(frame(1)).await);
    }

    #[tokio::test]
    async fn three_consecutive_timeouts_evict_the_viewer() {
        let (mut slot, _rx) = ViewerSlot::new(3);
        // _rx is never drained and the channel capacity is small enough that
        // once full, future sends stall past SEND_TIMEOUT; we fill it first.
        for _ in 0..VIEWER_CHANNEL_CAPACITY {
            let _ = slot.tx.try_send(ViewerMessage::Frame(frame(0)));
        }
        assert!(slot.send(frame(1)).await);
        assert!(slot.send(frame(2)).await);
        assert!(!slot.send(frame(3)).await);
    }
}
