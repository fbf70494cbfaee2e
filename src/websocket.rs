//! # WebSocket Audio Streaming Handler
//!
//! Bridges one WebSocket connection to its session worker.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: any path except `/health` upgrades; there is no handshake message
//! 2. **Audio Streaming**: binary frames of 16-bit little-endian mono PCM
//! 3. **Results**: one JSON text frame per audio frame (partial or utterance result)
//! 4. **End of stream**: the exact frame `{"eof" : 1}`; the server answers with the
//!    final result and closes normally
//!
//! ## Actor Model:
//! Each connection is an actix actor. Inbound frames are forwarded to the
//! session worker through a bounded queue; worker output comes back as a
//! second stream attached to the actor with `add_stream`. The actor never
//! touches the recognizer itself.

use crate::engine::RecognitionEngine;
use crate::session::InboundFrame;
use crate::supervisor::{Outbound, SessionLink, Supervisor};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// WebSocket actor for one streaming connection.
pub struct AudioWebSocket {
    session_id: Uuid,

    /// Queue into the session worker; `None` once the session no longer accepts frames
    frames: Option<mpsc::Sender<InboundFrame>>,

    /// Worker output, attached as a stream when the actor starts
    outbound: Option<mpsc::UnboundedReceiver<Outbound>>,

    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Last ping or pong seen from the client
    last_heartbeat: Instant,

    /// Set once the server initiated a normal close
    closing: bool,
}

impl AudioWebSocket {
    pub fn new(link: SessionLink, heartbeat_interval: Duration, client_timeout: Duration) -> Self {
        Self {
            session_id: link.id,
            frames: Some(link.frames),
            outbound: Some(link.outbound),
            heartbeat_interval,
            client_timeout,
            last_heartbeat: Instant::now(),
            closing: false,
        }
    }

    /// Queue a frame for the worker.
    ///
    /// ## Backpressure:
    /// When the queue is full the send is awaited with `ctx.wait`, which stops
    /// the actor from reading further frames until the worker catches up.
    fn forward(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(frames) = self.frames.clone() else {
            debug!(session_id = %self.session_id, "session no longer accepts frames, dropping frame");
            return;
        };

        match frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                trace!(session_id = %self.session_id, "frame queue full, pausing reader");
                ctx.wait(async move { frames.send(frame).await.is_ok() }.into_actor(self).map(
                    |delivered, act, _ctx| {
                        if !delivered {
                            act.frames = None;
                        }
                    },
                ));
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "session worker finished, dropping frame");
                self.frames = None;
            }
        }
    }

    /// Ping the client and close dead connections.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                act.frames = None;
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
        self.start_heartbeat(ctx);
    }

    /// Dropping the frame sender tells the worker the transport is gone.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.frames = None;
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.forward(InboundFrame::Binary(data), ctx),
            Ok(ws::Message::Text(text)) => self.forward(InboundFrame::Text(text.to_string()), ctx),
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "client closed connection");
                self.frames = None;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.frames = None;
                ctx.stop();
            }
        }
    }
}

/// Handle worker output.
impl StreamHandler<Outbound> for AudioWebSocket {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(json) => ctx.text(json),
            Outbound::Close => {
                self.closing = true;
                self.frames = None;
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    /// The worker ended without asking for a normal close.
    fn finished(&mut self, ctx: &mut Self::Context) {
        if !self.closing {
            warn!(session_id = %self.session_id, "session worker ended unexpectedly");
            ctx.close(Some(ws::CloseCode::Error.into()));
        }
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The handshake is validated before a session is registered, so plain HTTP
/// requests never take a slot. A full registry answers 503.
pub async fn audio_websocket<E: RecognitionEngine>(
    req: HttpRequest,
    stream: web::Payload,
    supervisor: web::Data<Supervisor<E>>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);
    debug!(peer = ?peer, path = req.path(), "WebSocket upgrade request");

    let mut response = ws::handshake(&req)?;
    let link = supervisor.open(peer)?;
    let limits = supervisor.limits();

    let actor = AudioWebSocket::new(link, limits.heartbeat_interval, limits.client_timeout);
    Ok(response.streaming(ws::WebsocketContext::create(actor, stream)))
}
