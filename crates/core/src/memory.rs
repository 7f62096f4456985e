// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory link pair used by tests and local wiring.
//!
//! Two [`MemoryLink`] halves connected back to back over bounded channels.
//! Ordering and message boundaries hold by construction. A link can be
//! silenced, after which sends still resolve but nothing reaches the peer,
//! which is how heartbeat-loss scenarios are simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WireError;
use crate::link::{Link, LinkReceiver, LinkSender};
use crate::JsonValue;

type Frame = Result<JsonValue, WireError>;

/// One end of an in-memory duplex link.
pub struct MemoryLink {
    sender: MemorySender,
    receiver: MemoryReceiver,
}

impl MemoryLink {
    /// A switch that, once set, makes this end's sends vanish silently.
    pub fn silence_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sender.silenced)
    }
}

impl Link for MemoryLink {
    fn into_split(self) -> (Box<dyn LinkSender>, Box<dyn LinkReceiver>) {
        (Box::new(self.sender), Box::new(self.receiver))
    }
}

pub struct MemorySender {
    tx: Option<mpsc::Sender<Frame>>,
    silenced: Arc<AtomicBool>,
}

#[async_trait]
impl LinkSender for MemorySender {
    async fn send(&mut self, message: JsonValue) -> Result<(), WireError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(WireError::link_closed("link already closed"));
        };
        if self.silenced.load(Ordering::Relaxed) {
            return Ok(());
        }
        tx.send(Ok(message))
            .await
            .map_err(|_| WireError::link_closed("peer dropped its receiver"))
    }

    async fn close(&mut self) {
        self.tx = None;
    }

    async fn abort(&mut self, error: WireError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Err(error));
        }
    }
}

pub struct MemoryReceiver {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl LinkReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<JsonValue>, WireError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

/// Creates two connected link ends, each side buffering up to `capacity`
/// in-flight messages.
pub fn link_pair(capacity: usize) -> (MemoryLink, MemoryLink) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let a = MemoryLink {
        sender: MemorySender { tx: Some(a_tx), silenced: Arc::new(AtomicBool::new(false)) },
        receiver: MemoryReceiver { rx: a_rx },
    };
    let b = MemoryLink {
        sender: MemorySender { tx: Some(b_tx), silenced: Arc::new(AtomicBool::new(false)) },
        receiver: MemoryReceiver { rx: b_rx },
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_in_order() {
        let (a, b) = link_pair(8);
        let (mut a_tx, _a_rx) = a.into_split();
        let (_b_tx, mut b_rx) = b.into_split();

        a_tx.send(serde_json::json!({"seq": 1})).await.expect("send");
        a_tx.send(serde_json::json!({"seq": 2})).await.expect("send");

        assert_eq!(b_rx.recv().await.expect("recv"), Some(serde_json::json!({"seq": 1})));
        assert_eq!(b_rx.recv().await.expect("recv"), Some(serde_json::json!({"seq": 2})));
    }

    #[tokio::test]
    async fn close_surfaces_as_clean_end() {
        let (a, b) = link_pair(8);
        let (mut a_tx, _a_rx) = a.into_split();
        let (_b_tx, mut b_rx) = b.into_split();

        a_tx.close().await;
        assert_eq!(b_rx.recv().await.expect("recv"), None);
    }

    #[tokio::test]
    async fn abort_surfaces_the_error() {
        let (a, b) = link_pair(8);
        let (mut a_tx, _a_rx) = a.into_split();
        let (_b_tx, mut b_rx) = b.into_split();

        a_tx.abort(WireError::link_closed("boom")).await;
        let err = b_rx.recv().await.expect_err("fault");
        assert_eq!(err, WireError::link_closed("boom"));
    }

    #[tokio::test]
    async fn silenced_sends_vanish() {
        let (a, b) = link_pair(8);
        let switch = a.silence_switch();
        let (mut a_tx, _a_rx) = a.into_split();
        let (_b_tx, mut b_rx) = b.into_split();

        switch.store(true, Ordering::Relaxed);
        a_tx.send(serde_json::json!("lost")).await.expect("send resolves");
        a_tx.close().await;
        // Nothing arrives before the clean end-of-link.
        assert_eq!(b_rx.recv().await.expect("recv"), None);
    }
}
