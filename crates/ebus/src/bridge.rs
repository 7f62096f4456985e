// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bridges: one RPC stack per adjacent bus.
//!
//! Routed envelopes ride a fire-and-forget `bus.envelope` procedure;
//! correlated control (handshake, sub-update, node-announcement) rides
//! `bus.exchange` asks bounded by the configured request deadline. An
//! exchange that goes unanswered is treated as a connection fault.

use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{Transport, WireError};
use meshkit_erpc::{ErpcConfig, ErpcNode, Procedure, Router, RpcValue};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{Envelope, Exchange, ExchangeResponse, MessageSource};
use crate::peer::BusCmd;
use crate::BusId;

/// Everything queued toward one adjacent bus; a single pump per bridge
/// keeps envelopes and correlated exchanges in submission order.
pub(crate) enum BridgeOutgoing {
    Envelope(Envelope),
    Exchange(Exchange),
}

/// A registered adjacent bus.
#[derive(Clone)]
pub(crate) struct BridgeHandle {
    pub bridge_id: Uuid,
    pub source: MessageSource,
    pub remote_bus_id: BusId,
    pub erpc: ErpcNode,
    outgoing: mpsc::UnboundedSender<BridgeOutgoing>,
}

impl BridgeHandle {
    /// Wraps a connected RPC stack and starts its ordered outgoing pump.
    pub fn start(
        bridge_id: Uuid,
        source: MessageSource,
        remote_bus_id: BusId,
        erpc: ErpcNode,
        cmd_tx: mpsc::UnboundedSender<BusCmd>,
        request_timeout: Duration,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outgoing_pump(erpc.clone(), outgoing_rx, cmd_tx, bridge_id, request_timeout));
        Self { bridge_id, source, remote_bus_id, erpc, outgoing }
    }

    /// Fire-and-forget envelope send; failures surface as the bridge
    /// closing, not per message.
    pub fn send_envelope(&self, envelope: Envelope) {
        let _ = self.outgoing.send(BridgeOutgoing::Envelope(envelope));
    }

    /// Queues a correlated exchange behind everything already queued. An
    /// unanswered exchange is reported as a connection fault.
    pub fn queue_exchange(&self, exchange: Exchange) {
        let _ = self.outgoing.send(BridgeOutgoing::Exchange(exchange));
    }

    /// One immediate correlated exchange, bypassing the queue; used for
    /// shutdown withdrawals.
    ///
    /// # Errors
    ///
    /// A missed deadline is a connection fault, not a soft failure.
    pub async fn exchange(&self, exchange: Exchange, deadline: Duration) -> Result<ExchangeResponse, WireError> {
        exchange_once(&self.erpc, exchange, deadline).await
    }

    pub async fn close(&self) {
        self.erpc.close().await;
    }
}

async fn run_outgoing_pump(
    erpc: ErpcNode,
    mut outgoing_rx: mpsc::UnboundedReceiver<BridgeOutgoing>,
    cmd_tx: mpsc::UnboundedSender<BusCmd>,
    bridge_id: Uuid,
    request_timeout: Duration,
) {
    while let Some(outgoing) = outgoing_rx.recv().await {
        match outgoing {
            BridgeOutgoing::Envelope(envelope) => match envelope.into_value() {
                Ok(value) => erpc.tell("bus.envelope", vec![value]).await,
                Err(error) => warn!(%error, "dropping unencodable envelope"),
            },
            BridgeOutgoing::Exchange(exchange) => {
                if let Err(error) = exchange_once(&erpc, exchange, request_timeout).await {
                    warn!(%error, "bridge exchange failed");
                    let _ = cmd_tx.send(BusCmd::BridgeClosed { bridge_id });
                    break;
                }
            }
        }
    }
}

async fn exchange_once(
    erpc: &ErpcNode,
    exchange: Exchange,
    deadline: Duration,
) -> Result<ExchangeResponse, WireError> {
    let value = serde_json::to_value(&exchange).map_err(|e| WireError::serialization(e.to_string()))?;
    let reply = tokio::time::timeout(deadline, erpc.ask("bus.exchange", vec![RpcValue::Json(value)]))
        .await
        .map_err(|_| WireError::link_closed("correlated exchange went unanswered"))??;
    let plain = reply
        .into_plain()
        .ok_or_else(|| WireError::serialization("exchange response cannot carry resources"))?;
    serde_json::from_value(plain).map_err(|e| WireError::serialization(e.to_string()))
}

/// Builds the RPC stack for one adjacent transport and performs the opening
/// handshake, returning the node plus the peer's bus id.
pub(crate) async fn connect_bridge(
    transport: Arc<dyn Transport>,
    local_bus_id: BusId,
    bridge_id: Uuid,
    cmd_tx: mpsc::UnboundedSender<BusCmd>,
    request_timeout: Duration,
) -> Result<(ErpcNode, BusId), WireError> {
    let router = bridge_router(local_bus_id.clone(), bridge_id, cmd_tx);
    let erpc = ErpcNode::new(transport, router, ErpcConfig::default());

    let handshake = Exchange::Handshake { correlation_id: Uuid::new_v4(), bus_id: local_bus_id };
    let value = serde_json::to_value(&handshake).map_err(|e| WireError::serialization(e.to_string()))?;
    let reply = tokio::time::timeout(
        request_timeout,
        erpc.ask("bus.exchange", vec![RpcValue::Json(value)]),
    )
    .await
    .map_err(|_| WireError::link_closed("handshake went unanswered"))??;
    let plain = reply
        .into_plain()
        .ok_or_else(|| WireError::serialization("handshake response cannot carry resources"))?;
    match serde_json::from_value::<ExchangeResponse>(plain)
        .map_err(|e| WireError::serialization(e.to_string()))?
    {
        ExchangeResponse::HandshakeResponse { bus_id, .. } => Ok((erpc, bus_id)),
        ExchangeResponse::Ack { .. } => {
            Err(WireError::serialization("peer answered the handshake with a bare ack"))
        }
    }
}

/// The procedures an adjacent bus may call on us.
fn bridge_router(local_bus_id: BusId, bridge_id: Uuid, cmd_tx: mpsc::UnboundedSender<BusCmd>) -> Router {
    let envelope_cmd_tx = cmd_tx.clone();
    let envelope_handler = Procedure::new(move |mut args, _ctx| {
        let cmd_tx = envelope_cmd_tx.clone();
        async move {
            if args.is_empty() {
                return Err(WireError::serialization("bus.envelope takes one envelope"));
            }
            let envelope = Envelope::from_value(args.remove(0))?;
            let _ = cmd_tx.send(BusCmd::EnvelopeReceived { bridge_id, envelope });
            Ok(RpcValue::null())
        }
    });

    let exchange_handler = Procedure::new(move |mut args, _ctx| {
        let cmd_tx = cmd_tx.clone();
        let local_bus_id = local_bus_id.clone();
        async move {
            if args.is_empty() {
                return Err(WireError::serialization("bus.exchange takes one request"));
            }
            let plain = args
                .remove(0)
                .into_plain()
                .ok_or_else(|| WireError::serialization("exchange request cannot carry resources"))?;
            let exchange: Exchange =
                serde_json::from_value(plain).map_err(|e| WireError::serialization(e.to_string()))?;
            let response = match exchange {
                Exchange::Handshake { correlation_id, .. } => {
                    ExchangeResponse::HandshakeResponse { correlation_id, bus_id: local_bus_id }
                }
                Exchange::SubUpdate { correlation_id, updates } => {
                    let _ = cmd_tx.send(BusCmd::BridgeSubUpdate { bridge_id, updates });
                    ExchangeResponse::Ack { correlation_id }
                }
                Exchange::NodeAnnouncement { correlation_id, announcements } => {
                    let _ = cmd_tx.send(BusCmd::BridgeAnnouncement { bridge_id, announcements });
                    ExchangeResponse::Ack { correlation_id }
                }
            };
            let response =
                serde_json::to_value(&response).map_err(|e| WireError::serialization(e.to_string()))?;
            Ok(RpcValue::Json(response))
        }
    });

    Router::new()
        .route("bus.envelope", envelope_handler)
        .route("bus.exchange", exchange_handler)
}
