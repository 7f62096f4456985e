// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The multiplexer actor: one single-reader task per link.
//!
//! All channel state (windows, reorder maps, handshakes) is owned by this
//! actor and touched from nowhere else. Handles talk to it over a command
//! queue; a dedicated writer task owns the link's send half so the actor
//! never waits on the wire while processing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use meshkit_core::{Channel, CloseSignal, JsonValue, LinkReceiver, LinkSender, WireError};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelRole, ChannelState, ChannelStatus, WindowSink};
use crate::config::{MuxConfig, Side};
use crate::packet::Packet;

/// The reserved control-channel id.
pub const CONTROL_CHANNEL_ID: u32 = 0;

/// Commands from channel handles and the transport handle.
pub(crate) enum MuxCmd {
    SendData { channel_id: u32, payload: JsonValue },
    OpenStream { done: oneshot::Sender<Result<Arc<Channel>, WireError>> },
    CloseChannel { channel_id: u32 },
    Close { done: oneshot::Sender<()> },
    Abort { error: WireError },
}

/// Commands for the writer task owning the link's send half.
pub(crate) enum WriterCmd {
    Packet(Packet),
    /// Resolves once every previously queued packet was handed to the link.
    Flush(oneshot::Sender<()>),
    Close,
    Abort(WireError),
}

pub(crate) async fn run_writer(mut sender: Box<dyn LinkSender>, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Packet(packet) => {
                let value = match packet.to_value() {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(%error, "dropping unencodable packet");
                        continue;
                    }
                };
                if let Err(error) = sender.send(value).await {
                    debug!(%error, "link send failed, writer exiting");
                    break;
                }
            }
            WriterCmd::Flush(done) => {
                let _ = done.send(());
            }
            WriterCmd::Close => {
                sender.close().await;
                break;
            }
            WriterCmd::Abort(error) => {
                sender.abort(error).await;
                break;
            }
        }
    }
}

enum Flow {
    Continue,
    Exit(WireError),
}

pub(crate) struct MuxActor {
    pub config: MuxConfig,
    pub side: Side,
    pub writer_tx: mpsc::UnboundedSender<WriterCmd>,
    pub link_rx: Box<dyn LinkReceiver>,
    pub cmd_rx: mpsc::UnboundedReceiver<MuxCmd>,
    pub cmd_tx: mpsc::UnboundedSender<MuxCmd>,
    pub channels: HashMap<u32, ChannelState>,
    pub next_stream_id: u32,
    pub incoming_tx: mpsc::UnboundedSender<Arc<Channel>>,
    pub shared: Arc<CloseSignal>,
    pub last_pong: Instant,
}

impl MuxActor {
    pub async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and doubles as the opening ping.
        let reason = loop {
            let flow = tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_cmd(cmd).await,
                inbound = self.link_rx.recv() => match inbound {
                    Ok(Some(value)) => self.handle_inbound(value),
                    Ok(None) => Flow::Exit(WireError::link_closed("link closed by peer")),
                    Err(error) => Flow::Exit(error),
                },
                _ = heartbeat.tick() => self.handle_heartbeat_tick(),
            };
            match flow {
                Flow::Continue => {}
                Flow::Exit(reason) => break reason,
            }
        };
        self.finish(reason);
    }

    fn handle_heartbeat_tick(&mut self) -> Flow {
        if self.last_pong.elapsed() >= self.config.heartbeat_timeout {
            let error = WireError::heartbeat_timeout(format!(
                "no pong within {:?}",
                self.config.heartbeat_timeout
            ));
            let _ = self.writer_tx.send(WriterCmd::Abort(error.clone()));
            return Flow::Exit(error);
        }
        let _ = self.writer_tx.send(WriterCmd::Packet(Packet::Ping));
        Flow::Continue
    }

    async fn handle_cmd(&mut self, cmd: MuxCmd) -> Flow {
        match cmd {
            MuxCmd::SendData { channel_id, payload } => {
                let Some(state) = self.channels.get_mut(&channel_id) else {
                    debug!(channel_id, "dropping payload for destroyed channel");
                    return Flow::Continue;
                };
                let seq = state.next_send_seq;
                state.next_send_seq += 1;
                state.outstanding.insert(seq);
                let _ = self.writer_tx.send(WriterCmd::Packet(Packet::Data { channel_id, seq, payload }));
                Flow::Continue
            }
            MuxCmd::OpenStream { done } => {
                let channel_id = self.next_stream_id;
                self.next_stream_id += 2;
                let (handle, mut state) = self.create_channel(channel_id, ChannelStatus::PreHandshake);
                state.handle = Some(handle);
                state.pending_open = Some(done);
                self.channels.insert(channel_id, state);
                let _ = self.writer_tx.send(WriterCmd::Packet(Packet::OpenStream { channel_id }));
                trace!(channel_id, "stream channel opening");
                Flow::Continue
            }
            MuxCmd::CloseChannel { channel_id } => {
                if let Some(mut state) = self.channels.remove(&channel_id) {
                    let _ = self
                        .writer_tx
                        .send(WriterCmd::Packet(Packet::CloseChannel { channel_id, reason: None }));
                    state.destroy(WireError::channel_closed("locally closed"));
                    trace!(channel_id, "channel closed locally");
                }
                Flow::Continue
            }
            MuxCmd::Close { done } => {
                let reason = WireError::channel_closed("multiplexer closed");
                // The control channel needs no close notification; its
                // lifetime is the link's.
                for (&channel_id, state) in &self.channels {
                    if state.role == ChannelRole::Stream {
                        let _ = self
                            .writer_tx
                            .send(WriterCmd::Packet(Packet::CloseChannel { channel_id, reason: None }));
                    }
                }
                for (_, mut state) in self.channels.drain() {
                    state.destroy(reason.clone());
                }
                // Wait for the close notifications to reach the link before
                // shutting it down.
                let (flush_tx, flush_rx) = oneshot::channel();
                let _ = self.writer_tx.send(WriterCmd::Flush(flush_tx));
                let _ = flush_rx.await;
                let _ = self.writer_tx.send(WriterCmd::Close);
                let _ = done.send(());
                Flow::Exit(reason)
            }
            MuxCmd::Abort { error } => {
                let _ = self.writer_tx.send(WriterCmd::Abort(error.clone()));
                Flow::Exit(error)
            }
        }
    }

    fn handle_inbound(&mut self, value: JsonValue) -> Flow {
        let packet = match Packet::from_value(value) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, "dropping malformed packet");
                return Flow::Continue;
            }
        };
        match packet {
            Packet::Ping => {
                let _ = self.writer_tx.send(WriterCmd::Packet(Packet::Pong));
            }
            Packet::Pong => {
                self.last_pong = Instant::now();
            }
            Packet::OpenStream { channel_id } => self.handle_open_stream(channel_id),
            Packet::OpenStreamAck { channel_id } => self.handle_open_stream_ack(channel_id),
            Packet::Data { channel_id, seq, payload } => self.handle_data(channel_id, seq, payload),
            Packet::Ack { channel_id, seq } => self.handle_ack(channel_id, seq),
            Packet::CloseChannel { channel_id, reason } => {
                if let Some(mut state) = self.channels.remove(&channel_id) {
                    state.destroy(reason.unwrap_or_else(|| WireError::channel_closed("closed by peer")));
                    trace!(channel_id, "channel closed by peer");
                }
            }
        }
        Flow::Continue
    }

    fn handle_open_stream(&mut self, channel_id: u32) {
        if self.channels.contains_key(&channel_id) {
            debug!(channel_id, "duplicate open-stream, re-acking");
            let _ = self.writer_tx.send(WriterCmd::Packet(Packet::OpenStreamAck { channel_id }));
            return;
        }
        if !self.side.is_remote_id(channel_id) {
            warn!(channel_id, "peer opened a channel with a local-parity id");
        }
        let (handle, state) = self.create_channel(channel_id, ChannelStatus::Established);
        self.channels.insert(channel_id, state);
        let _ = self.writer_tx.send(WriterCmd::Packet(Packet::OpenStreamAck { channel_id }));
        let _ = self.incoming_tx.send(handle);
        trace!(channel_id, "incoming stream channel accepted");
    }

    fn handle_open_stream_ack(&mut self, channel_id: u32) {
        let Some(state) = self.channels.get_mut(&channel_id) else {
            debug!(channel_id, "open-stream-ack for unknown channel");
            return;
        };
        state.status = ChannelStatus::Established;
        if let (Some(done), Some(handle)) = (state.pending_open.take(), state.handle.take()) {
            let _ = done.send(Ok(handle));
        }
        trace!(channel_id, "stream channel established");
    }

    fn handle_data(&mut self, channel_id: u32, seq: u64, payload: JsonValue) {
        if !self.channels.contains_key(&channel_id) {
            // Unknown channel: lazily create it on the receiver side and
            // surface it through the incoming handler, then deliver.
            if !self.side.is_remote_id(channel_id) {
                warn!(channel_id, "data for unknown local-parity channel, dropping");
                return;
            }
            let (handle, state) = self.create_channel(channel_id, ChannelStatus::Established);
            self.channels.insert(channel_id, state);
            let _ = self.incoming_tx.send(handle);
            debug!(channel_id, "channel lazily created from data packet");
        }
        let Some(state) = self.channels.get_mut(&channel_id) else { return };
        if state.status == ChannelStatus::PreHandshake {
            // The peer accepted and sent data before its ack reached us.
            trace!(channel_id, "data ahead of open-stream-ack");
        }
        if seq < state.next_recv_seq || state.reorder.contains_key(&seq) {
            debug!(channel_id, seq, "duplicate data packet ignored");
            return;
        }
        state.reorder.insert(seq, payload);
        while let Some(payload) = state.reorder.remove(&state.next_recv_seq) {
            let seq = state.next_recv_seq;
            state.next_recv_seq += 1;
            state.feeder.deliver(payload);
            let _ = self.writer_tx.send(WriterCmd::Packet(Packet::Ack { channel_id, seq }));
        }
    }

    fn handle_ack(&mut self, channel_id: u32, seq: u64) {
        let Some(state) = self.channels.get_mut(&channel_id) else {
            debug!(channel_id, seq, "ack for unknown channel");
            return;
        };
        if state.outstanding.remove(&seq) {
            state.window.add_permits(1);
        } else {
            debug!(channel_id, seq, "ack for unknown seq");
        }
    }

    pub(crate) fn create_channel(&self, channel_id: u32, status: ChannelStatus) -> (Arc<Channel>, ChannelState) {
        let window = Arc::new(Semaphore::new(self.config.send_window));
        let sink = WindowSink::new(channel_id, Arc::clone(&window), self.cmd_tx.clone());
        let (handle, feeder) = meshkit_core::channel(channel_id, Box::new(sink));
        let role = if channel_id == CONTROL_CHANNEL_ID { ChannelRole::Control } else { ChannelRole::Stream };
        (handle, ChannelState::new(role, status, feeder, window))
    }

    fn finish(mut self, reason: WireError) {
        for (_, mut state) in self.channels.drain() {
            state.destroy(reason.clone());
        }
        self.shared.finish(reason);
    }
}
