//! Distribution stream over WebSocket.
//!
//! Frames are bridged onto the same channel pair the in-process subscriber
//! uses, so the server sees no difference between local and remote nodes.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::Instrument;

use chainward_core::protocol::discovery::{DiscoveryRequest, DiscoveryResponse};

use crate::app_state::AppState;
use crate::transport::codec::{self, Inbound};

const STREAM_BUFFER: usize = 16;

pub async fn discovery_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("discovery", stream = %uuid::Uuid::new_v4());
        run_stream(app, socket).instrument(span)
    })
}

async fn run_stream(app: AppState, socket: WebSocket) {
    let metrics = app.metrics();
    metrics.active_streams.inc(&[("stream", "discovery")]);

    let (req_tx, req_rx) = mpsc::channel::<DiscoveryRequest>(STREAM_BUFFER);
    let (resp_tx, mut resp_rx) = mpsc::channel::<DiscoveryResponse>(STREAM_BUFFER);
    let server = app.distribution();
    let serve = tokio::spawn(async move { server.serve_stream(req_rx, resp_tx).await });

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            // outbound pushes
            push = resp_rx.recv() => {
                let Some(push) = push else { break; };
                let out = match codec::encode(&push) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode discovery response");
                        break;
                    }
                };
                if ws_tx.send(out).await.is_err() {
                    break;
                }
            }

            // inbound requests
            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break; };
                match codec::decode::<DiscoveryRequest>(msg) {
                    Ok(Inbound::Frame(req)) => {
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Ping(payload)) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Ok(Inbound::Pong) => {}
                    Ok(Inbound::Close) => break,
                    Err(e) => {
                        metrics.decode_errors.inc(&[("stream", "discovery")]);
                        tracing::warn!(error = %e, "undecodable discovery request; closing stream");
                        break;
                    }
                }
            }
        }
    }

    drop(req_tx);
    let _ = serve.await;
    metrics.active_streams.dec(&[("stream", "discovery")]);
}
