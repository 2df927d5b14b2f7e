//! Processing-protocol handler: one WebSocket per HTTP exchange.
//!
//! A reader task forwards text frames to the session loop and cancels the
//! exchange token when the proxy goes away, so a chain still running stops
//! at its next policy boundary. Messages are answered strictly in order.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use chainward_core::protocol::extproc::{
    CommonResponse, HttpBody, ProcessingMessage, ProcessingReply, ProcessingRequest, ProcessingResponse,
    REQUEST_ID_HEADER,
};

use crate::app_state::AppState;
use crate::kernel::translate::{IncomingRequest, IncomingResponse, ReplySlot};
use crate::kernel::Kernel;
use crate::transport::codec::{self, Inbound};

const FRAME_BUFFER: usize = 8;

/// Per-exchange protocol state.
///
/// When a chain needs a body that has not arrived yet, the headers message is
/// acknowledged and held here until the body completes. `owns_state` is set
/// only while the kernel holds in-flight state stored by this exchange.
#[derive(Debug, Default)]
pub struct Exchange {
    request_id: Option<String>,
    owns_state: bool,
    pending_request: Option<IncomingRequest>,
    pending_response: Option<IncomingResponse>,
}

fn join_body(prev: Option<Bytes>, chunk: Bytes) -> Bytes {
    match prev {
        Some(p) if !p.is_empty() => {
            let mut buf = BytesMut::with_capacity(p.len() + chunk.len());
            buf.extend_from_slice(&p);
            buf.extend_from_slice(&chunk);
            buf.freeze()
        }
        _ => chunk,
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn owns_state(&self) -> bool {
        self.owns_state
    }

    /// Drop the in-flight state this exchange stored, if any.
    pub fn release(&mut self, kernel: &Kernel) -> bool {
        if !std::mem::take(&mut self.owns_state) {
            return false;
        }
        self.request_id.as_deref().is_some_and(|id| kernel.release(id))
    }

    async fn request_phase(
        &mut self,
        kernel: &Kernel,
        incoming: IncomingRequest,
        slot: ReplySlot,
        cancel: &CancellationToken,
    ) -> ProcessingResponse {
        let outcome = kernel.run_request_phase(incoming, slot, cancel).await;
        self.owns_state = outcome.stored;
        outcome.response
    }

    pub async fn on_message(
        &mut self,
        kernel: &Kernel,
        req: ProcessingRequest,
        cancel: &CancellationToken,
    ) -> ProcessingResponse {
        let pass_through = ProcessingResponse::pass_through(&req.message);
        match req.message {
            ProcessingMessage::RequestHeaders(h) => {
                let cfg = kernel.config();
                let incoming = IncomingRequest::from_message(
                    &h,
                    &req.metadata_context,
                    &cfg.route_metadata_namespace,
                    &cfg.route_key_field,
                );
                self.request_id = Some(incoming.request_id.clone());

                let chain = kernel.chain_for(incoming.route_key.as_deref());
                if let Some(chain) = chain.filter(|c| c.requires_request_body() && !h.end_of_stream) {
                    self.pending_request = Some(incoming);
                    return ProcessingResponse::new(ProcessingReply::RequestHeaders(CommonResponse::default()))
                        .with_mode(chain.processing_mode());
                }
                self.request_phase(kernel, incoming, ReplySlot::Headers, cancel).await
            }
            ProcessingMessage::RequestBody(HttpBody { body, end_of_stream }) => {
                let Some(mut incoming) = self.pending_request.take() else {
                    return pass_through;
                };
                incoming.body = Some(join_body(incoming.body.take(), body));
                if !end_of_stream {
                    self.pending_request = Some(incoming);
                    return pass_through;
                }
                self.request_phase(kernel, incoming, ReplySlot::Body, cancel).await
            }
            ProcessingMessage::ResponseHeaders(h) => {
                if self.request_id.is_some() && !self.owns_state {
                    // nothing stored under this id belongs to us
                    tracing::debug!(request_id = ?self.request_id, "no owned in-flight state; passing response through");
                    return pass_through;
                }
                let request_id = self
                    .request_id
                    .clone()
                    .or_else(|| h.regular().get(REQUEST_ID_HEADER).map(str::to_owned))
                    .unwrap_or_default();
                let incoming = IncomingResponse::from_message(request_id, &h);
                let needs_body = kernel
                    .inflight()
                    .peek_chain(&incoming.request_id)
                    .is_some_and(|c| c.requires_response_body());
                if needs_body && !h.end_of_stream {
                    self.pending_response = Some(incoming);
                    return pass_through;
                }
                self.owns_state = false;
                kernel.handle_response_phase(incoming, ReplySlot::Headers, cancel).await
            }
            ProcessingMessage::ResponseBody(HttpBody { body, end_of_stream }) => {
                let Some(mut incoming) = self.pending_response.take() else {
                    return pass_through;
                };
                incoming.body = Some(join_body(incoming.body.take(), body));
                if !end_of_stream {
                    self.pending_response = Some(incoming);
                    return pass_through;
                }
                self.owns_state = false;
                kernel.handle_response_phase(incoming, ReplySlot::Body, cancel).await
            }
        }
    }
}

// --------------------
// Entry
// --------------------
pub async fn ext_proc_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("ext_proc", stream = %uuid::Uuid::new_v4());
        run_exchange(app, socket).instrument(span)
    })
}

async fn run_exchange(app: AppState, socket: WebSocket) {
    let kernel = app.kernel();
    let metrics = app.metrics();
    metrics.active_streams.inc(&[("stream", "ext_proc")]);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Message>(FRAME_BUFFER);
    let cancel = CancellationToken::new();

    // inbound reader; its exit means the proxy is gone
    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if frame_tx.send(msg).await.is_err() {
                break;
            }
        }
        reader_cancel.cancel();
    });

    let mut exchange = Exchange::new();
    while let Some(msg) = frame_rx.recv().await {
        let req = match codec::decode::<ProcessingRequest>(msg) {
            Ok(Inbound::Frame(req)) => req,
            Ok(Inbound::Ping(payload)) => {
                let _ = ws_tx.send(Message::Pong(payload)).await;
                continue;
            }
            Ok(Inbound::Pong) => continue,
            Ok(Inbound::Close) => break,
            Err(e) => {
                metrics.decode_errors.inc(&[("stream", "ext_proc")]);
                tracing::warn!(error = %e, "undecodable processing message; closing stream");
                break;
            }
        };

        let kind = req.message.kind();
        let reply = exchange.on_message(&kernel, req, &cancel).await;
        let out = match codec::encode(&reply) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to encode processing response");
                break;
            }
        };
        if ws_tx.send(out).await.is_err() {
            break;
        }
    }

    cancel.cancel();
    reader.abort();
    if exchange.release(&kernel) {
        tracing::debug!(request_id = ?exchange.request_id(), "stream closed before the response phase; state released");
    }
    metrics.active_streams.dec(&[("stream", "ext_proc")]);
}
