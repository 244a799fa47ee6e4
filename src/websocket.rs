//! # Media Stream WebSocket Handler
//!
//! One actor per telephony media stream connected to `/ws`.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: refused with 503 once `max_concurrent_calls` streams are open
//! 2. **Start**: the start event assigns the stream SID and audio format
//! 3. **Media**: frames are decoded into the turn buffer; full turns run
//!    through the pipeline while ingestion continues
//! 4. **Mark**: playback acknowledgements flush leftover audio
//! 5. **Stop / close**: the actor stops; an in-flight turn is dropped with it
//!
//! Inbound events are handled one at a time in arrival order. The turn
//! pipeline is spawned into the actor's context, so it never outlives the
//! connection and writes back through the actor's own address.

use crate::audio::session::SessionConfig;
use crate::audio::{CallSession, Turn};
use crate::error::AppError;
use crate::pipeline::{PipelineSettings, TurnPipeline};
use crate::protocol::{parse_event, MediaEvent, OutboundMessage};
use crate::sender::{FramePacing, OutboundTransport, OutputSender, SendError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Track name of audio played to the caller; never buffered as caller speech.
const OUTBOUND_TRACK: &str = "outbound";

/// Connection timers taken from the performance config.
#[derive(Debug, Clone, Copy)]
pub struct SocketTimers {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub summary_interval: Duration,
}

/// Actor owning one call's session.
pub struct MediaStreamSocket {
    session: CallSession,
    pipeline: TurnPipeline,
    pacing: Option<FramePacing>,
    state: web::Data<AppState>,
    timers: SocketTimers,

    /// Frames already added to the process-wide counter
    frames_reported: u64,
}

impl MediaStreamSocket {
    pub fn new(
        session: CallSession,
        pipeline: TurnPipeline,
        pacing: Option<FramePacing>,
        state: web::Data<AppState>,
        timers: SocketTimers,
    ) -> Self {
        Self {
            session,
            pipeline,
            pacing,
            state,
            timers,
            frames_reported: 0,
        }
    }

    fn handle_event(&mut self, event: MediaEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            MediaEvent::Connected { protocol } => {
                self.session.touch();
                info!(
                    connection_id = %self.session.connection_id,
                    protocol = protocol.as_deref().unwrap_or("-"),
                    "Media stream connected"
                );
            }
            MediaEvent::Start(start) => match self.session.start(start) {
                Ok(()) => debug!(
                    stream_sid = ?self.session.stream_sid(),
                    custom_parameters = ?self.session.custom_parameters(),
                    "Stream parameters"
                ),
                Err(err) => warn!(connection_id = %self.session.connection_id, "{}", err),
            },
            MediaEvent::Media { track, .. } if track.as_deref() == Some(OUTBOUND_TRACK) => {
                self.session.touch();
            }
            MediaEvent::Media { payload, .. } => {
                if let Some(turn) = self.session.ingest_media(&payload) {
                    self.spawn_turn(turn, ctx);
                }
            }
            MediaEvent::Mark { name } => {
                debug!(stream_sid = ?self.session.stream_sid(), mark = %name, "Mark received");
                if let Some(turn) = self.session.flush_on_mark(&name) {
                    self.spawn_turn(turn, ctx);
                }
            }
            MediaEvent::Stop => {
                info!(stream_sid = ?self.session.stream_sid(), "Stop received, closing stream");
                self.session.stop();
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    /// Run a turn inside the actor context and fold its report back into
    /// the session when it finishes.
    fn spawn_turn(&mut self, turn: Turn, ctx: &mut ws::WebsocketContext<Self>) {
        let transport = Arc::new(SocketTransport {
            addr: ctx.address(),
        });
        let sender = OutputSender::new(transport).with_pacing(self.pacing);
        let pipeline = self.pipeline.clone();

        let fut = async move { pipeline.run(turn, &sender).await };
        ctx.spawn(fut.into_actor(self).map(|report, act, _ctx| {
            act.state.record_turn(&report.outcome, report.fallback_reply);
            act.session.complete_turn(report);
        }));
    }

    fn flush_frame_count(&mut self) {
        let frames = self.session.frames_received();
        let delta = frames.saturating_sub(self.frames_reported);
        if delta > 0 {
            self.state.record_frames(delta);
            self.frames_reported = frames;
        }
    }

    fn log_summary(&self, message: &str) {
        let summary = self.session.summary();
        info!(
            connection_id = %summary.connection_id,
            stream_sid = ?summary.stream_sid,
            status = summary.status,
            frames = summary.frames_received,
            buffered_seconds = summary.buffered_seconds,
            turns = summary.turns_dispatched,
            responses = summary.responses,
            processing = summary.processing,
            duration_seconds = summary.duration_seconds,
            "{}",
            message
        );
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.session.connection_id, "Media stream socket opened");

        ctx.run_interval(self.timers.heartbeat_interval, |act, ctx| {
            if act.session.idle_for() > act.timers.idle_timeout {
                warn!(
                    connection_id = %act.session.connection_id,
                    stream_sid = ?act.session.stream_sid(),
                    "Media stream idle, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        ctx.run_interval(self.timers.summary_interval, |act, _ctx| {
            act.flush_frame_count();
            act.log_summary("Call summary");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.stop();
        self.flush_frame_count();
        self.state.close_call();
        self.log_summary("Media stream closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match parse_event(&text) {
                Ok(event) => self.handle_event(event, ctx),
                Err(err) => {
                    warn!(
                        connection_id = %self.session.connection_id,
                        error = %err,
                        "Dropping malformed stream event"
                    );
                }
            },
            Ok(ws::Message::Binary(data)) => {
                debug!(bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(stream_sid = ?self.session.stream_sid(), "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(stream_sid = ?self.session.stream_sid(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound frame routed through the actor so writes stay ordered with
/// the connection's own lifecycle.
#[derive(Message)]
#[rtype(result = "Result<(), SendError>")]
pub struct Outbound(pub OutboundMessage);

impl Handler<Outbound> for MediaStreamSocket {
    type Result = Result<(), SendError>;

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        let json = msg
            .0
            .to_json()
            .map_err(|err| SendError::Encode(err.to_string()))?;
        ctx.text(json);
        Ok(())
    }
}

/// `OutboundTransport` backed by the socket actor's address.
pub struct SocketTransport {
    addr: Addr<MediaStreamSocket>,
}

#[async_trait]
impl OutboundTransport for SocketTransport {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), SendError> {
        if !self.addr.connected() {
            return Err(SendError::Closed);
        }
        self.addr
            .send(Outbound(message))
            .await
            .map_err(|_| SendError::Closed)?
    }

    fn is_open(&self) -> bool {
        self.addr.connected()
    }
}

/// `GET /ws`: upgrade a media stream connection.
///
/// Settings are captured from the current config; later config updates
/// apply to new calls only.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();

    if !state.try_open_call(config.performance.max_concurrent_calls) {
        warn!(
            limit = config.performance.max_concurrent_calls,
            "Refusing media stream, call limit reached"
        );
        return Err(AppError::Unavailable("Too many concurrent calls".to_string()).into());
    }

    info!(peer = ?req.connection_info().peer_addr(), "New media stream connection");

    let default_format = config.audio.default_format();
    let session = CallSession::new(SessionConfig {
        default_format: default_format.clone(),
        turn_duration_ms: config.audio.turn_duration_ms,
        history_limit: config.audio.history_limit,
    });
    let pipeline = TurnPipeline::new(state.services.clone(), PipelineSettings::from_config(&config));
    let pacing = config
        .audio
        .paced_output
        .then(|| FramePacing::for_format(&default_format, config.audio.frame_ms));
    let timers = SocketTimers {
        heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
        idle_timeout: Duration::from_secs(config.performance.idle_timeout_secs),
        summary_interval: Duration::from_secs(config.performance.summary_interval_secs),
    };

    let socket = MediaStreamSocket::new(session, pipeline, pacing, state.clone(), timers);
    let response = ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(config.performance.max_frame_bytes)
        .start();

    if response.is_err() {
        // The actor never started, so `stopped` will not release the slot
        state.close_call();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::app_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_plain_request_is_rejected_and_slot_released() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_calls, 0);
        assert_eq!(metrics.calls_total, 1);
    }

    #[actix_web::test]
    async fn test_call_limit_returns_unavailable() {
        let state = app_state();
        let limit = state.get_config().performance.max_concurrent_calls;
        for _ in 0..limit {
            assert!(state.try_open_call(limit));
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().calls_rejected, 1);
    }
}
