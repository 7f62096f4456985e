// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The public multiplexed transport handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use meshkit_core::{async_trait, Channel, CloseSignal, Link, Transport, WireError};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::actor::{run_writer, MuxActor, MuxCmd, WriterCmd, CONTROL_CHANNEL_ID};
use crate::channel::ChannelStatus;
use crate::config::{MuxConfig, Side};

/// A multiplexed connection over a single link.
///
/// Dropping the handle does not tear the connection down; call
/// [`Transport::close`] or [`Transport::abort`] for that. The connection also
/// dies when the link fails or the peer stops answering heartbeats.
pub struct MuxTransport {
    control: Arc<Channel>,
    cmd_tx: mpsc::UnboundedSender<MuxCmd>,
    incoming: Mutex<mpsc::UnboundedReceiver<Arc<Channel>>>,
    shared: Arc<CloseSignal>,
}

impl MuxTransport {
    /// Starts multiplexing over `link`.
    ///
    /// Both peers must agree on who is [`Side::Initiator`] and who is
    /// [`Side::Acceptor`]; the roles partition the stream-channel id space.
    pub fn connect(link: impl Link, side: Side, config: MuxConfig) -> Self {
        let (link_tx, link_rx) = link.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<WriterCmd>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<MuxCmd>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Arc<Channel>>();
        let shared = Arc::new(CloseSignal::new());

        let mut actor = MuxActor {
            config,
            side,
            writer_tx,
            link_rx,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            channels: HashMap::new(),
            next_stream_id: side.first_stream_id(),
            incoming_tx,
            shared: Arc::clone(&shared),
            last_pong: Instant::now(),
        };
        // The control channel is implicitly established; its lifetime equals
        // the multiplexer's.
        let (control, control_state) = actor.create_channel(CONTROL_CHANNEL_ID, ChannelStatus::Established);
        actor.channels.insert(CONTROL_CHANNEL_ID, control_state);

        tokio::spawn(run_writer(link_tx, writer_rx));
        tokio::spawn(actor.run());

        Self { control, cmd_tx, incoming: Mutex::new(incoming_rx), shared }
    }

    fn close_reason(&self) -> WireError {
        self.shared
            .reason()
            .unwrap_or_else(|| WireError::link_closed("transport closed"))
    }
}

#[async_trait]
impl Transport for MuxTransport {
    fn control_channel(&self) -> Arc<Channel> {
        Arc::clone(&self.control)
    }

    async fn open_stream_channel(&self) -> Result<Arc<Channel>, WireError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCmd::OpenStream { done: done_tx })
            .map_err(|_| self.close_reason())?;
        done_rx.await.map_err(|_| self.close_reason())?
    }

    async fn accept_stream_channel(&self) -> Option<Arc<Channel>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await
    }

    async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(MuxCmd::Close { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        self.shared.wait().await;
    }

    async fn abort(&self, error: WireError) {
        let _ = self.cmd_tx.send(MuxCmd::Abort { error });
        self.shared.wait().await;
    }

    async fn closed(&self) -> WireError {
        self.shared.wait().await;
        self.close_reason()
    }
}
