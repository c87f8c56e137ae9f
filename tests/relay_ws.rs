//! End-to-end relay tests: a real server on an ephemeral port, a scripted
//! upstream provider and real WebSocket clients.

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use quest_voice::client::transport::{self, LinkEvent};
use quest_voice::client::{AudioClip, AudioSink, ClientEvent, ClientResult, VoiceClient};
use quest_voice::config::AppConfig;
use quest_voice::error::RelayResult;
use quest_voice::relay::messages::MediaChunk;
use quest_voice::relay::provider::{LiveConnection, LiveProvider, LiveSession, SessionSetup, UpstreamEvent};
use quest_voice::routes;
use quest_voice::state::AppState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RELAY_PATH: &str = "/ws/gemini-voice";

/// Upstream stand-in. Echoes generic sends, answers `clientContent` turns
/// with an inline-audio reply and counts audio chunks and closes.
#[derive(Default)]
struct ScriptedProvider {
    connects: AtomicUsize,
    audio_chunks: Arc<AtomicUsize>,
    audio_mimes: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    /// Handshake latency before the session is handed back
    connect_delay: Duration,
}

impl ScriptedProvider {
    fn slow(connect_delay: Duration) -> Self {
        Self {
            connect_delay,
            ..Self::default()
        }
    }

    fn audio_mimes(&self) -> Vec<String> {
        self.audio_mimes.lock().unwrap().clone()
    }
}

struct ScriptedSession {
    events: mpsc::UnboundedSender<UpstreamEvent>,
    audio_chunks: Arc<AtomicUsize>,
    audio_mimes: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl LiveProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, _setup: &SessionSetup) -> RelayResult<LiveConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(UpstreamEvent::Open);
        Ok(LiveConnection {
            session: Arc::new(ScriptedSession {
                events: tx,
                audio_chunks: self.audio_chunks.clone(),
                audio_mimes: self.audio_mimes.clone(),
                closes: self.closes.clone(),
            }),
            events: rx,
        })
    }
}

#[async_trait]
impl LiveSession for ScriptedSession {
    async fn send_realtime_input(&self, chunk: MediaChunk) -> RelayResult<()> {
        self.audio_mimes.lock().unwrap().push(chunk.mime_type);
        self.audio_chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: Value) -> RelayResult<()> {
        let reply = if message.get("clientContent").is_some() {
            json!({
                "serverContent": { "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAD/fw==" } }
                ] } }
            })
        } else {
            json!({ "echo": message })
        };
        let _ = self.events.send(UpstreamEvent::Message(reply));
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    clips: Vec<AudioClip>,
}

impl AudioSink for CollectingSink {
    fn play(&mut self, clip: AudioClip, _volume: f32) -> ClientResult<()> {
        self.clips.push(clip);
        Ok(())
    }
}

fn start_server(state: AppState) -> (SocketAddr, ServerHandle) {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| routes::configure(cfg, Some(RELAY_PATH)))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (addr, handle)
}

fn relay_url(addr: SocketAddr) -> String {
    format!("ws://{}{}", addr, RELAY_PATH)
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[actix_web::test]
async fn test_passthrough_and_malformed_frames() {
    let provider = Arc::new(ScriptedProvider::default());
    let state = AppState::new(AppConfig::default()).with_provider(provider.clone());
    let (addr, handle) = start_server(state);

    let (mut ws, _) = connect_async(relay_url(addr)).await.unwrap();

    ws.send(Message::Text(r#"{"generationConfig":{}}"#.to_string())).await.unwrap();
    let opened: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(opened, json!({"type": "status", "message": "Gemini session opened"}));

    let echoed: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(echoed, json!({"echo": {"generationConfig": {}}}));

    // Dropped without a reply; the connection keeps working
    ws.send(Message::Text("{not valid".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"tools":[]}"#.to_string())).await.unwrap();
    let echoed: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(echoed, json!({"echo": {"tools": []}}));

    assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
    assert_eq!(provider.audio_chunks.load(Ordering::SeqCst), 0);

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_missing_credential_reported_once() {
    let state = AppState::new(AppConfig::default());
    let (addr, handle) = start_server(state);

    let (mut ws, _) = connect_async(relay_url(addr)).await.unwrap();
    assert_eq!(
        next_text(&mut ws).await,
        r#"{"type":"error","message":"Missing GEMINI_API_KEY"}"#
    );

    ws.send(Message::Binary(vec![0, 0, 1, 0])).await.unwrap();
    ws.send(Message::Ping(b"still-there".to_vec())).await.unwrap();

    // The next frame is the pong: no second error, socket still open
    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("websocket error");
    assert_eq!(reply, Message::Pong(b"still-there".to_vec()));

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_client_close_closes_upstream_once() {
    let provider = Arc::new(ScriptedProvider::default());
    let state = AppState::new(AppConfig::default()).with_provider(provider.clone());
    let (addr, handle) = start_server(state.clone());

    let (mut ws, _) = connect_async(relay_url(addr)).await.unwrap();
    ws.send(Message::Binary(vec![0; 2048])).await.unwrap();
    next_text(&mut ws).await; // session opened
    wait_until(|| provider.audio_chunks.load(Ordering::SeqCst) == 1).await;

    ws.close(None).await.unwrap();
    wait_until(|| state.recent_sessions.snapshot().len() == 1).await;

    assert_eq!(provider.closes.load(Ordering::SeqCst), 1);
    let metrics = state.get_metrics_snapshot();
    assert_eq!(metrics.active_sessions, 0);
    assert_eq!(metrics.upstream_sessions_opened, 1);

    let summary = &state.recent_sessions.snapshot()[0];
    assert!(summary.upstream_opened);
    assert_eq!(summary.frames_forwarded, 1);

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_voice_client_round_trip() {
    let provider = Arc::new(ScriptedProvider::default());
    let config = AppConfig::default();
    let state = AppState::new(config.clone()).with_provider(provider.clone());
    let (addr, handle) = start_server(state);

    let (link, mut events) = transport::connect(&relay_url(addr)).await.unwrap();
    let mut client = VoiceClient::from_config(CollectingSink::default(), &config);
    client.connect(link);
    client.on_socket_open();

    // The greeting is a clientContent turn; the scripted upstream answers with audio
    let mut processor = client.start_call(48_000).unwrap().expect("connected client starts a call");

    let mut played = false;
    while !played {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("link closed");
        match event {
            LinkEvent::Text(text) => {
                played = matches!(client.handle_server_text(&text), ClientEvent::Playing { .. });
            }
            closed => panic!("relay closed unexpectedly: {:?}", closed),
        }
    }
    assert!(client.is_speaking());
    assert_eq!(client.sink().clips[0].mime_type, "audio/pcm;rate=24000");
    assert!(client.on_playback_ended());

    // 48 kHz input decimated by 3: 3072 native samples make one frame
    processor.process(Some(&vec![0.25f32; 3072]));
    assert_eq!(client.pump_capture(), 1);
    wait_until(|| provider.audio_chunks.load(Ordering::SeqCst) == 1).await;

    client.set_muted(true);
    processor.process(Some(&vec![0.25f32; 3072]));
    assert_eq!(client.pump_capture(), 0);

    // Nothing reaches upstream while muted
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.audio_chunks.load(Ordering::SeqCst), 1);

    client.disconnect();
    handle.stop(false).await;
}

#[actix_web::test]
async fn test_messages_during_slow_handshake_open_one_session() {
    let provider = Arc::new(ScriptedProvider::slow(Duration::from_millis(300)));
    let mut config = AppConfig::default();
    config.audio.input_mime_type = "audio/pcm;rate=24000".to_string();
    let state = AppState::new(config).with_provider(provider.clone());
    let (addr, handle) = start_server(state.clone());

    let (mut ws, _) = connect_async(relay_url(addr)).await.unwrap();

    // All three land while the first connect is still sleeping
    ws.send(Message::Binary(vec![0; 64])).await.unwrap();
    ws.send(Message::Binary(vec![1; 64])).await.unwrap();
    ws.send(Message::Text(r#"{"generationConfig":{}}"#.to_string())).await.unwrap();

    let opened: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(opened["message"], "Gemini session opened");
    let echoed: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(echoed, json!({"echo": {"generationConfig": {}}}));

    wait_until(|| provider.audio_chunks.load(Ordering::SeqCst) == 2).await;
    assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
    assert_eq!(provider.audio_mimes(), vec!["audio/pcm;rate=24000"; 2]);

    ws.close(None).await.unwrap();
    wait_until(|| state.recent_sessions.snapshot().len() == 1).await;
    assert_eq!(provider.closes.load(Ordering::SeqCst), 1);
    assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    assert_eq!(state.recent_sessions.snapshot()[0].frames_forwarded, 3);

    handle.stop(false).await;
}
