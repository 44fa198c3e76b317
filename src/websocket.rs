//! # WebSocket Transcription Endpoint
//!
//! Clients connect to `/asr`, stream binary audio and receive JSON
//! transcription events, then one `{"type":"ready_to_stop"}` marker.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: a plain `GET /asr` returns a service description; an
//!    upgrade request opens a session (or gets 503 when the server is full)
//! 2. **Audio Streaming**: binary frames carry audio; an empty binary frame
//!    means the client has no more audio
//! 3. **Results**: the server sends text frames only: transcription events,
//!    then the completion marker
//! 4. **Heartbeat**: the server pings every `heartbeat_interval_secs` and
//!    drops clients silent for longer than `client_timeout_secs`
//!
//! ## Actor Model:
//! The [`AsrSocket`] actor only translates between actix and the session core.
//! Inbound frames go through a bounded channel to a [`ChannelSource`];
//! outbound text goes back to the actor through an [`ActorSink`]. The
//! [`SessionCoordinator`] runs in its own task and owns the session's
//! lifecycle, so stopping the actor never cuts teardown short.

use crate::error::{AppError, TransportError};
use crate::session::transport::{FrameSource, Inbound, MessageSink};
use crate::session::SessionCoordinator;
use crate::state::{AppState, SessionGuard};

use actix::prelude::*;
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames buffered between the socket and the session before the actor
/// stops reading from the connection.
const FRAME_QUEUE: usize = 32;

/// Text written to the client, or a server-side close.
#[derive(Message)]
#[rtype(result = "Result<(), TransportError>")]
enum Outbound {
    Text(String),
    Close,
}

/// One WebSocket connection.
pub struct AsrSocket {
    session_id: Uuid,
    coordinator: SessionCoordinator,
    state: web::Data<AppState>,
    /// Moved into the session task on start.
    guard: Option<SessionGuard>,
    frames: mpsc::Sender<Inbound>,
    source: Option<ChannelSource>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    /// No more frames will be forwarded to the session.
    input_closed: bool,
    /// The server has closed the connection.
    closed: bool,
}

impl AsrSocket {
    fn new(
        coordinator: SessionCoordinator,
        state: web::Data<AppState>,
        guard: SessionGuard,
    ) -> Self {
        let (frames, rx) = mpsc::channel(FRAME_QUEUE);
        let session = &state.config.session;
        Self {
            session_id: Uuid::new_v4(),
            coordinator,
            heartbeat_interval: session.heartbeat_interval(),
            client_timeout: session.client_timeout(),
            state,
            guard: Some(guard),
            frames,
            source: Some(ChannelSource::new(rx)),
            last_heartbeat: Instant::now(),
            input_closed: false,
            closed: false,
        }
    }

    /// Queue an audio frame. A full queue pauses the actor, and with it
    /// reading from the socket, until the session catches up.
    fn forward_audio(&mut self, data: web::Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        if self.input_closed {
            return;
        }
        if data.is_empty() {
            // End of stream: nothing after it is fed.
            self.input_closed = true;
        }

        match self.frames.try_send(Inbound::Audio(data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let frames = self.frames.clone();
                ctx.wait(
                    async move {
                        let _ = frames.send(frame).await;
                    }
                    .into_actor(self),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Session no longer reading audio, frame dropped");
            }
        }
    }

    /// Report the end of input. Delivered after every frame already queued.
    fn end_input(&mut self, frame: Inbound) {
        if self.input_closed {
            return;
        }
        self.input_closed = true;

        if let Err(mpsc::error::TrySendError::Full(frame)) = self.frames.try_send(frame) {
            let frames = self.frames.clone();
            actix_web::rt::spawn(async move {
                let _ = frames.send(frame).await;
            });
        }
    }
}

impl Actor for AsrSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                act.end_input(Inbound::Failed(TransportError::HeartbeatTimeout));
                act.closed = true;
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let (Some(source), Some(guard)) = (self.source.take(), self.guard.take()) else {
            return;
        };
        let sink = ActorSink { addr: ctx.address() };
        let coordinator = self.coordinator.clone();
        let state = self.state.clone();
        let session_id = self.session_id;

        actix_web::rt::spawn(async move {
            let report = coordinator.run(session_id, source, sink.clone()).await;
            state.record_session_end(&report);
            drop(guard);
            // The coordinator closes the connection itself unless the peer
            // is gone; this only makes sure the actor stops.
            sink.addr.do_send(Outbound::Close);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the actor drops the frame sender, which the session sees
        // as a disconnect once the queued frames are consumed.
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AsrSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward_audio(data, ctx);
            }
            Ok(ws::Message::Text(_)) => {
                warn!(session_id = %self.session_id, "Ignoring text frame, audio must be sent as binary");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                self.end_input(Inbound::Disconnected);
                self.closed = true;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.end_input(Inbound::Failed(TransportError::Protocol(err.to_string())));
                self.closed = true;
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for AsrSocket {
    type Result = Result<(), TransportError>;

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close => {
                debug!(session_id = %self.session_id, "Closing WebSocket from server side");
                self.closed = true;
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
        Ok(())
    }
}

/// Session-side end of the frame queue.
pub struct ChannelSource {
    rx: mpsc::Receiver<Inbound>,
    done: bool,
}

impl ChannelSource {
    fn new(rx: mpsc::Receiver<Inbound>) -> Self {
        Self { rx, done: false }
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Inbound {
        if self.done {
            return Inbound::Disconnected;
        }
        match self.rx.recv().await {
            Some(Inbound::Audio(data)) => Inbound::Audio(data),
            Some(terminal) => {
                self.done = true;
                terminal
            }
            None => {
                self.done = true;
                Inbound::Disconnected
            }
        }
    }
}

/// Writes to the client through the actor's mailbox.
#[derive(Clone)]
pub struct ActorSink {
    addr: Addr<AsrSocket>,
}

#[async_trait]
impl MessageSink for ActorSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.addr
            .send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::Closed)?
    }

    async fn close(&mut self) {
        let _ = self.addr.send(Outbound::Close).await;
    }
}

/// `GET /asr`: opens a transcription session on a WebSocket upgrade, and
/// describes the endpoint otherwise.
pub async fn asr_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    coordinator: web::Data<SessionCoordinator>,
) -> Result<HttpResponse, actix_web::Error> {
    if !is_websocket_upgrade(&req) {
        return Ok(asr_info());
    }

    let Some(guard) = state.try_open_session() else {
        let max = state.config.server.max_concurrent_sessions;
        warn!("Rejecting WebSocket connection, {} sessions already active", max);
        return Err(AppError::Unavailable(format!("Maximum concurrent sessions ({}) reached", max)).into());
    };

    let socket = AsrSocket::new(coordinator.get_ref().clone(), state.clone(), guard);
    info!(session_id = %socket.session_id, "Accepting WebSocket connection");
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(state.config.session.max_frame_bytes)
        .start()
}

fn asr_info() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "WhisperLiveKit ASR",
        "websocket_url": "/asr",
        "usage": "Connect to ws://<this_host>/asr and send binary audio; server responds with JSON (lines, type: ready_to_stop)."
    }))
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::testing::{PipelineScript, ScriptedEngine};
    use crate::session::{EndReason, SessionSettings};
    use actix_web::{error::PayloadError, http::StatusCode, test, App};
    use futures_util::{stream, StreamExt};
    use serde_json::Value;

    const OP_TEXT: u8 = 0x1;
    const OP_BINARY: u8 = 0x2;
    const OP_CLOSE: u8 = 0x8;

    /// A masked client frame. The mask key is all zeros, so the payload is
    /// written as is.
    fn client_frame(opcode: u8, payload: &[u8]) -> web::Bytes {
        let mut frame = vec![0x80 | opcode];
        match payload.len() {
            len if len < 126 => frame.push(0x80 | len as u8),
            len if len <= u16::MAX as usize => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&[0; 4]);
        frame.extend_from_slice(payload);
        web::Bytes::from(frame)
    }

    /// Split unmasked server output into `(opcode, payload)` frames.
    fn server_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while bytes.len() >= 2 {
            let opcode = bytes[0] & 0x0F;
            let (len, header) = match bytes[1] & 0x7F {
                126 => (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4),
                127 => (u64::from_be_bytes(bytes[2..10].try_into().unwrap()) as usize, 10),
                len => (len as usize, 2),
            };
            frames.push((opcode, bytes[header..header + len].to_vec()));
            bytes = &bytes[header + len..];
        }
        frames
    }

    /// Run `socket` against a client that sends `client` and then stays
    /// connected without sending anything, until the server ends the stream.
    async fn drive_socket(socket: AsrSocket, client: Vec<web::Bytes>) -> Vec<(u8, Vec<u8>)> {
        let input = stream::iter(client.into_iter().map(Ok::<_, PayloadError>)).chain(stream::pending());
        let mut output = Box::pin(ws::WebsocketContext::create(socket, input));

        let mut bytes = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = output.next().await {
                bytes.extend_from_slice(&chunk.unwrap());
            }
        })
        .await
        .expect("server never finished the connection");
        server_frames(&bytes)
    }

    async fn wait_for_session_end(state: &AppState, reason: EndReason) {
        for _ in 0..100 {
            if state.get_metrics_snapshot().sessions_ended_by(reason) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never ended with {:?}", reason);
    }

    fn app_data(max_sessions: usize) -> (web::Data<AppState>, web::Data<SessionCoordinator>) {
        let mut config = AppConfig::default();
        config.server.max_concurrent_sessions = max_sessions;
        let (engine, _log) = ScriptedEngine::new(PipelineScript::default());
        (
            web::Data::new(AppState::new(config)),
            web::Data::new(SessionCoordinator::new(engine, SessionSettings::default())),
        )
    }

    fn upgrade_request() -> test::TestRequest {
        test::TestRequest::get()
            .uri("/asr")
            .insert_header((header::UPGRADE, "websocket"))
            .insert_header((header::CONNECTION, "Upgrade"))
            .insert_header((header::SEC_WEBSOCKET_VERSION, "13"))
            .insert_header((header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[actix_web::test]
    async fn test_plain_get_describes_the_endpoint() {
        let (state, coordinator) = app_data(1);
        let app = test::init_service(
            App::new()
                .app_data(state)
                .app_data(coordinator)
                .route("/asr", web::get().to(asr_endpoint)),
        )
        .await;

        let req = test::TestRequest::get().uri("/asr").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["service"], "WhisperLiveKit ASR");
        assert_eq!(body["websocket_url"], "/asr");
        assert!(body["usage"].as_str().unwrap().contains("ready_to_stop"));
    }

    #[actix_web::test]
    async fn test_upgrade_is_rejected_at_capacity() {
        let (state, coordinator) = app_data(1);
        let _held = state.try_open_session();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .app_data(coordinator)
                .route("/asr", web::get().to(asr_endpoint)),
        )
        .await;

        let resp = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "unavailable");
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }

    #[actix_web::test]
    async fn test_upgrade_switches_protocols() {
        let (state, coordinator) = app_data(1);
        let app = test::init_service(
            App::new()
                .app_data(state)
                .app_data(coordinator)
                .route("/asr", web::get().to(asr_endpoint)),
        )
        .await;

        let resp = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[actix_web::test]
    async fn test_frames_above_64_kib_are_accepted() {
        let (state, coordinator) = app_data(1);
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .app_data(coordinator)
                .route("/asr", web::get().to(asr_endpoint)),
        )
        .await;

        let mut payload = client_frame(OP_BINARY, &vec![0u8; 70_000]).to_vec();
        payload.extend_from_slice(&client_frame(OP_BINARY, &[]));
        let resp = test::call_service(&app, upgrade_request().set_payload(payload).to_request()).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        test::read_body(resp).await;

        wait_for_session_end(&state, EndReason::ClientFinished).await;
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_ended_by(EndReason::TransportFault), 0);
        assert_eq!(metrics.chunks_received, 1);
    }

    #[actix_web::test]
    async fn test_pipeline_fault_under_flooding_client_still_sends_marker() {
        let mut config = AppConfig::default();
        config.server.max_concurrent_sessions = 1;
        let state = web::Data::new(AppState::new(config));
        let script = PipelineScript::default()
            .delay_on(1, Duration::from_millis(200))
            .fail_on(2);
        let (engine, pipeline_log) = ScriptedEngine::new(script);
        let coordinator = SessionCoordinator::new(
            engine,
            SessionSettings { result_buffer: 8, drain_grace: Duration::from_millis(300) },
        );

        // Far more frames than the queue holds, so the actor is parked
        // handing one over when the pipeline fails.
        let client = (0..FRAME_QUEUE * 2).map(|i| client_frame(OP_BINARY, &[i as u8; 4])).collect();
        let guard = state.try_open_session().unwrap();
        let frames = drive_socket(AsrSocket::new(coordinator, state.clone(), guard), client).await;

        let texts: Vec<&[u8]> = frames
            .iter()
            .filter(|(opcode, _)| *opcode == OP_TEXT)
            .map(|(_, payload)| payload.as_slice())
            .collect();
        assert_eq!(texts, vec![br#"{"type":"ready_to_stop"}"#.as_slice()]);
        assert_eq!(frames.last().map(|(opcode, _)| *opcode), Some(OP_CLOSE));

        wait_for_session_end(&state, EndReason::PipelineFault).await;
        assert_eq!(pipeline_log.close_count(), 1);
        assert_eq!(state.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_channel_source_reports_disconnect_after_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelSource::new(rx);

        tx.send(Inbound::Audio(web::Bytes::from_static(b"ab"))).await.unwrap();
        drop(tx);

        assert_eq!(source.next_frame().await, Inbound::Audio(web::Bytes::from_static(b"ab")));
        assert_eq!(source.next_frame().await, Inbound::Disconnected);
        assert_eq!(source.next_frame().await, Inbound::Disconnected);
    }

    #[tokio::test]
    async fn test_channel_source_is_sticky_after_failure() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelSource::new(rx);

        tx.send(Inbound::Failed(TransportError::HeartbeatTimeout)).await.unwrap();
        tx.send(Inbound::Audio(web::Bytes::from_static(b"late"))).await.unwrap();

        assert_eq!(source.next_frame().await, Inbound::Failed(TransportError::HeartbeatTimeout));
        assert_eq!(source.next_frame().await, Inbound::Disconnected);
    }
}
