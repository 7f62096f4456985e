// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Transport tunneling: passing whole transports as call arguments.
//!
//! The serializing side registers a *bridge* wrapping the real transport and
//! relays its control traffic as opaque `tunnel` messages through the host
//! connection. The deserializing side synthesizes a *proxy* transport whose
//! operations are indistinguishable from operating on the real one.
//!
//! Stream channels cross the boundary over fresh host stream channels whose
//! first payload is a `stream-tunnel` handshake; `(tunnel_id,
//! target_endpoint)` decides whether the channel is pumped into the real
//! transport (initiator) or surfaced on the synthesized one (receiver).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use meshkit_core::channel::ChannelFeeder;
use meshkit_core::{async_trait, Channel, CloseSignal, JsonValue, PayloadSink, Transport, WireError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::node::Outbound;
use crate::proto::{ControlMessage, StreamHello, TunnelEndpoint};

struct BridgeEntry {
    transport: Arc<dyn Transport>,
    to_bridge: mpsc::UnboundedSender<JsonValue>,
}

struct ProxyEntry {
    control_feeder: ChannelFeeder,
    incoming_tx: mpsc::UnboundedSender<Arc<Channel>>,
    signal: Arc<CloseSignal>,
}

#[derive(Default)]
struct TunnelState {
    bridges: HashMap<Uuid, BridgeEntry>,
    proxies: HashMap<Uuid, ProxyEntry>,
}

struct TunnelShared {
    host: Arc<dyn Transport>,
    outbound: Outbound,
    state: Mutex<TunnelState>,
    shutdown: CancellationToken,
}

impl TunnelShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registry of active bridges and proxies on one connection.
pub(crate) struct TunnelManager {
    shared: Arc<TunnelShared>,
}

impl TunnelManager {
    pub fn new(host: Arc<dyn Transport>, outbound: Outbound) -> Self {
        Self {
            shared: Arc::new(TunnelShared {
                host,
                outbound,
                state: Mutex::new(TunnelState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers `transport` as a bridge and starts relaying it. Returns the
    /// tunnel id to put on the wire.
    pub fn register_bridge(&self, transport: Arc<dyn Transport>) -> Uuid {
        let tunnel_id = Uuid::new_v4();
        let (to_bridge_tx, to_bridge_rx) = mpsc::unbounded_channel();
        self.shared.lock().bridges.insert(
            tunnel_id,
            BridgeEntry { transport: Arc::clone(&transport), to_bridge: to_bridge_tx },
        );
        tokio::spawn(run_bridge(
            tunnel_id,
            transport,
            to_bridge_rx,
            Arc::clone(&self.shared),
            self.shared.shutdown.child_token(),
        ));
        tunnel_id
    }

    /// Synthesizes the proxy transport for a tunnel placeholder.
    pub fn create_proxy(&self, tunnel_id: Uuid) -> Arc<dyn Transport> {
        let signal = Arc::new(CloseSignal::new());
        let sink = TunnelControlSink { tunnel_id, outbound: self.shared.outbound.clone() };
        let (control, feeder) = meshkit_core::channel(0, Box::new(sink));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        if state.proxies.contains_key(&tunnel_id) {
            warn!(%tunnel_id, "duplicate tunnel placeholder, replacing previous proxy");
        }
        state.proxies.insert(
            tunnel_id,
            ProxyEntry { control_feeder: feeder, incoming_tx, signal: Arc::clone(&signal) },
        );
        drop(state);
        Arc::new(ProxyTransport {
            tunnel_id,
            shared: Arc::clone(&self.shared),
            control,
            incoming: AsyncMutex::new(incoming_rx),
            signal,
        })
    }

    /// Routes one opaque `tunnel` payload to its bridge or proxy.
    pub fn route(&self, tunnel_id: Uuid, payload: JsonValue) {
        let state = self.shared.lock();
        if let Some(bridge) = state.bridges.get(&tunnel_id) {
            let _ = bridge.to_bridge.send(payload);
        } else if let Some(proxy) = state.proxies.get(&tunnel_id) {
            if !proxy.control_feeder.deliver(payload) {
                debug!(%tunnel_id, "proxy control channel dropped");
            }
        } else {
            debug!(%tunnel_id, "tunnel payload for unknown tunnel");
        }
    }

    /// Dispatches an incoming host stream channel by its handshake.
    pub async fn handle_incoming_stream(&self, hello: StreamHello, channel: Arc<Channel>) {
        let StreamHello::StreamTunnel { tunnel_id, stream_id, target_endpoint } = hello;
        match target_endpoint {
            TunnelEndpoint::Receiver => {
                // Targets the synthesized side: a stream the real transport's
                // peer opened, surfacing on the proxy.
                let delivered = self
                    .shared
                    .lock()
                    .proxies
                    .get(&tunnel_id)
                    .is_some_and(|proxy| proxy.incoming_tx.send(channel.clone()).is_ok());
                if !delivered {
                    debug!(%tunnel_id, %stream_id, "no proxy for tunneled stream");
                    channel.close().await;
                }
            }
            TunnelEndpoint::Initiator => {
                // Targets the bridge: open the matching stream on the real
                // transport and pump both ways.
                let transport = self
                    .shared
                    .lock()
                    .bridges
                    .get(&tunnel_id)
                    .map(|bridge| Arc::clone(&bridge.transport));
                match transport {
                    Some(transport) => {
                        let token = self.shared.shutdown.child_token();
                        tokio::spawn(async move {
                            match transport.open_stream_channel().await {
                                Ok(real) => pump_channels(channel, real, token).await,
                                Err(error) => {
                                    debug!(%tunnel_id, %stream_id, %error, "bridged stream open failed");
                                    channel.close().await;
                                }
                            }
                        });
                    }
                    None => {
                        warn!(%tunnel_id, %stream_id, "no bridge for tunneled stream");
                        channel.close().await;
                    }
                }
            }
        }
    }

    /// Destroys every bridge (closing the real transports) and every proxy
    /// (signaling close on the synthesized side).
    pub fn shutdown(&self, reason: &WireError) {
        self.shared.shutdown.cancel();
        let mut state = self.shared.lock();
        state.bridges.clear();
        for (_, mut proxy) in state.proxies.drain() {
            proxy.control_feeder.close(reason.clone());
            proxy.signal.finish(reason.clone());
        }
    }
}

async fn run_bridge(
    tunnel_id: Uuid,
    transport: Arc<dyn Transport>,
    mut to_bridge_rx: mpsc::UnboundedReceiver<JsonValue>,
    shared: Arc<TunnelShared>,
    token: CancellationToken,
) {
    let control = transport.control_channel();

    // Forward every stream channel the bridged transport's peer opens.
    let accept_token = token.child_token();
    let accept_transport = Arc::clone(&transport);
    let accept_host = Arc::clone(&shared.host);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = accept_token.cancelled() => break,
                incoming = accept_transport.accept_stream_channel() => match incoming {
                    Some(real) => {
                        tokio::spawn(run_bridge_stream(
                            tunnel_id,
                            real,
                            Arc::clone(&accept_host),
                            accept_token.child_token(),
                        ));
                    }
                    None => break,
                },
            }
        }
    });

    loop {
        tokio::select! {
            () = token.cancelled() => {
                transport.close().await;
                break;
            }
            downward = to_bridge_rx.recv() => match downward {
                Some(payload) => {
                    if let Err(error) = control.send(payload).await {
                        debug!(%tunnel_id, %error, "bridged control send failed");
                        break;
                    }
                }
                None => break,
            },
            upward = control.recv() => match upward {
                Some(message) => {
                    if shared
                        .outbound
                        .send(ControlMessage::Tunnel { tunnel_id, payload: message })
                        .is_err()
                    {
                        break;
                    }
                }
                // The real transport ended underneath the bridge.
                None => break,
            },
        }
    }
}

/// Bridge side: carries one incoming stream of the real transport upward.
async fn run_bridge_stream(
    tunnel_id: Uuid,
    real: Arc<Channel>,
    host: Arc<dyn Transport>,
    token: CancellationToken,
) {
    let host_channel = match host.open_stream_channel().await {
        Ok(channel) => channel,
        Err(error) => {
            debug!(%tunnel_id, %error, "host stream open failed for bridged stream");
            real.close().await;
            return;
        }
    };
    let hello = StreamHello::StreamTunnel {
        tunnel_id,
        stream_id: Uuid::new_v4(),
        target_endpoint: TunnelEndpoint::Receiver,
    };
    let Ok(value) = hello.to_value() else { return };
    if host_channel.send(value).await.is_err() {
        real.close().await;
        return;
    }
    pump_channels(real, host_channel, token).await;
}

/// Pumps payloads between two channels until either side ends.
pub(crate) async fn pump_channels(a: Arc<Channel>, b: Arc<Channel>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => {
                a.close().await;
                b.close().await;
                break;
            }
            forward = a.recv() => match forward {
                Some(payload) => {
                    if b.send(payload).await.is_err() {
                        a.close().await;
                        break;
                    }
                }
                None => {
                    b.close().await;
                    break;
                }
            },
            backward = b.recv() => match backward {
                Some(payload) => {
                    if a.send(payload).await.is_err() {
                        b.close().await;
                        break;
                    }
                }
                None => {
                    a.close().await;
                    break;
                }
            },
        }
    }
}

struct TunnelControlSink {
    tunnel_id: Uuid,
    outbound: Outbound,
}

#[async_trait]
impl PayloadSink for TunnelControlSink {
    async fn send(&self, payload: JsonValue) -> Result<(), WireError> {
        self.outbound
            .send(ControlMessage::Tunnel { tunnel_id: self.tunnel_id, payload })
            .map_err(|_| WireError::channel_closed("host connection gone"))
    }

    async fn close(&self) {
        // The proxy control channel lives exactly as long as the proxy.
    }
}

/// The synthesized transport on the deserializing side of a tunnel.
struct ProxyTransport {
    tunnel_id: Uuid,
    shared: Arc<TunnelShared>,
    control: Arc<Channel>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Arc<Channel>>>,
    signal: Arc<CloseSignal>,
}

impl ProxyTransport {
    fn teardown(&self, reason: WireError) {
        let entry = self.shared.lock().proxies.remove(&self.tunnel_id);
        if let Some(mut entry) = entry {
            entry.control_feeder.close(reason.clone());
        }
        self.signal.finish(reason);
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn control_channel(&self) -> Arc<Channel> {
        Arc::clone(&self.control)
    }

    async fn open_stream_channel(&self) -> Result<Arc<Channel>, WireError> {
        if self.signal.is_closed() {
            return Err(self
                .signal
                .reason()
                .unwrap_or_else(|| WireError::channel_closed("tunnel proxy closed")));
        }
        let channel = self.shared.host.open_stream_channel().await?;
        let hello = StreamHello::StreamTunnel {
            tunnel_id: self.tunnel_id,
            stream_id: Uuid::new_v4(),
            target_endpoint: TunnelEndpoint::Initiator,
        };
        channel.send(hello.to_value()?).await?;
        Ok(channel)
    }

    async fn accept_stream_channel(&self) -> Option<Arc<Channel>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await
    }

    async fn close(&self) {
        self.teardown(WireError::channel_closed("tunnel proxy closed"));
    }

    async fn abort(&self, error: WireError) {
        self.teardown(error);
    }

    async fn closed(&self) -> WireError {
        self.signal.wait().await;
        self.signal
            .reason()
            .unwrap_or_else(|| WireError::channel_closed("tunnel proxy closed"))
    }
}
