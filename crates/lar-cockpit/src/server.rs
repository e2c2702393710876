//! [`CockpitServer`] – HTTP + WebSocket server for the debug view.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`CockpitServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with the embedded cockpit page.
//! * WebSocket upgrades → the latest [`DebugScene`] immediately, then a new
//!   one after every map change. A slow tab only ever receives the newest
//!   scene; intermediate ones are skipped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lar_kernel::SnapshotSource;
use lar_middleware::{EventBus, Topic, TopicReceiver};
use lar_types::{EventPayload, GeodeticPoint, LarError};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::scene::DebugScene;

/// Default TCP port for the cockpit HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8080;

/// Default cap on landmarks per pushed scene.
pub const DEFAULT_MAX_LANDMARKS: usize = 1000;

/// The compiled-in cockpit page (HTML + JS canvas plot).
const COCKPIT_HTML: &str = include_str!("cockpit.html");

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// Serves the cockpit page and streams scenes built from `source`.
pub struct CockpitServer {
    bus: Arc<EventBus>,
    source: Arc<dyn SnapshotSource>,
    port: u16,
    max_landmarks: usize,
}

impl CockpitServer {
    /// Create a server on the [`DEFAULT_PORT`].
    pub fn new(bus: Arc<EventBus>, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            bus,
            source,
            port: DEFAULT_PORT,
            max_landmarks: DEFAULT_MAX_LANDMARKS,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the per-scene landmark cap (builder-style).
    pub fn with_max_landmarks(mut self, max_landmarks: usize) -> Self {
        self.max_landmarks = max_landmarks;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_landmarks(&self) -> usize {
        self.max_landmarks
    }

    /// Bind the configured port and serve until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`LarError::Channel`] if the TCP listener cannot bind.
    pub async fn run(self) -> Result<(), LarError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LarError::Channel(format!("cockpit bind error on {addr}: {e}")))?;
        info!(url = %format!("http://localhost:{}", self.port), "cockpit listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        // Subscribe before the first scene is built so no change is missed.
        let updates = self.bus.subscribe_to(Topic::MapUpdates);
        let located = self.bus.subscribe_to(Topic::Localization);
        let initial = render(&DebugScene::build(
            &self.source.snapshot(),
            self.max_landmarks,
            None,
        ));
        let (scenes_tx, scenes_rx) = watch::channel(initial);

        tokio::spawn(publish_scenes(
            updates,
            located,
            Arc::clone(&self.source),
            self.max_landmarks,
            scenes_tx,
        ));

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let scenes = scenes_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, scenes).await {
                            debug!(%peer, error = %e, "cockpit client error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "cockpit accept error"),
            }
        }
    }
}

fn render(scene: &DebugScene) -> Arc<str> {
    match serde_json::to_string(scene) {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(error = %e, "scene serialization failed");
            Arc::from("{}")
        }
    }
}

/// Rebuild the scene on every map change or surfaced user location.
async fn publish_scenes(
    mut updates: TopicReceiver,
    mut located: TopicReceiver,
    source: Arc<dyn SnapshotSource>,
    max_landmarks: usize,
    scenes: watch::Sender<Arc<str>>,
) {
    let mut user_location: Option<GeodeticPoint> = None;
    loop {
        tokio::select! {
            event = updates.next_event() => {
                if event.is_none() {
                    break;
                }
            }
            event = located.next_event() => match event {
                Some(event) => match event.payload {
                    EventPayload::UserLocation(point) => user_location = Some(point),
                    _ => continue,
                },
                None => break,
            },
        }
        let scene = DebugScene::build(&source.snapshot(), max_landmarks, user_location);
        scenes.send_replace(render(&scene));
    }
    debug!("scene publisher stopped");
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    scenes: watch::Receiver<Arc<str>>,
) -> Result<(), LarError> {
    // `peek` leaves the request in place for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| LarError::Channel(format!("peek error from {peer}: {e}")))?;

    let header_preview = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = header_preview.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_ws_upgrade {
        handle_ws(stream, peer, scenes).await
    } else {
        serve_html(stream).await
    }
}

async fn serve_html(mut stream: TcpStream) -> Result<(), LarError> {
    drain_request(&mut stream).await;
    let body = COCKPIT_HTML;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| LarError::Channel(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Read the request head so closing the socket does not reset it.
async fn drain_request(stream: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while head.len() < 16 * 1024 {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    mut scenes: watch::Receiver<Arc<str>>,
) -> Result<(), LarError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| LarError::Channel(format!("WS handshake from {peer}: {e}")))?;
    debug!(%peer, "cockpit client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let first = scenes.borrow_and_update().clone();
    if ws_tx.send(Message::Text(first.to_string().into())).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            changed = scenes.changed() => {
                if changed.is_err() {
                    break;
                }
                let json = scenes.borrow_and_update().clone();
                if ws_tx.send(Message::Text(json.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if wants_refresh(text.as_str()) {
                        let json = scenes.borrow().clone();
                        if ws_tx.send(Message::Text(json.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    debug!(%peer, "cockpit client disconnected");
    Ok(())
}

/// `{"op": "refresh"}` asks for the current scene again. Anything else is
/// ignored.
pub(crate) fn wants_refresh(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|json| json.get("op").and_then(|op| op.as_str()).map(|op| op == "refresh"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lar_kernel::{Map, MapMutation, MapSnapshot};
    use lar_types::{Event, Transform};
    use std::sync::Mutex;
    use std::time::Duration;

    struct SharedMap(Mutex<Map>);

    impl SnapshotSource for SharedMap {
        fn snapshot(&self) -> MapSnapshot {
            self.0.lock().unwrap().snapshot()
        }
    }

    async fn spawn_server(source: Arc<SharedMap>, bus: Arc<EventBus>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CockpitServer::new(bus, source).with_max_landmarks(50);
        tokio::spawn(server.serve(listener));
        addr
    }

    async fn next_scene<S>(ws: &mut S) -> DebugScene
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[test]
    fn default_port_is_8080() {
        let bus = Arc::new(EventBus::default());
        let server = CockpitServer::new(bus, Arc::new(Map::new().snapshot()));
        assert_eq!(server.port(), DEFAULT_PORT);
        assert_eq!(server.max_landmarks(), DEFAULT_MAX_LANDMARKS);
    }

    #[test]
    fn with_port_overrides_default() {
        let bus = Arc::new(EventBus::default());
        let server = CockpitServer::new(bus, Arc::new(Map::new().snapshot())).with_port(9999);
        assert_eq!(server.port(), 9999);
    }

    #[test]
    fn refresh_requests_are_recognised() {
        assert!(wants_refresh(r#"{"op":"refresh"}"#));
        assert!(!wants_refresh(r#"{"op":"subscribe"}"#));
        assert!(!wants_refresh("not json at all"));
    }

    #[test]
    fn cockpit_html_contains_websocket_and_canvas() {
        assert!(COCKPIT_HTML.contains("WebSocket"));
        assert!(COCKPIT_HTML.contains("<canvas"));
    }

    #[tokio::test]
    async fn plain_http_gets_the_page() {
        let source = Arc::new(SharedMap(Mutex::new(Map::new())));
        let addr = spawn_server(source, Arc::new(EventBus::default())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("<canvas"));
    }

    #[tokio::test]
    async fn websocket_receives_scene_after_each_change() {
        let source = Arc::new(SharedMap(Mutex::new(Map::new())));
        let bus = Arc::new(EventBus::default());
        let addr = spawn_server(Arc::clone(&source), Arc::clone(&bus)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let first = next_scene(&mut ws).await;
        assert_eq!(first.revision, 0);
        assert_eq!(first.anchors.len(), 1);

        let change = source
            .0
            .lock()
            .unwrap()
            .apply(MapMutation::AddAnchor {
                name: "door".into(),
                transform: Transform::identity(),
            })
            .unwrap();
        bus.publish_to(
            Topic::MapUpdates,
            Event::new("test", EventPayload::MapChanged(change)),
        );

        let second = next_scene(&mut ws).await;
        assert_eq!(second.revision, 1);
        assert_eq!(second.anchors.len(), 2);
    }

    #[tokio::test]
    async fn user_location_is_carried_into_the_scene() {
        let source = Arc::new(SharedMap(Mutex::new(Map::new())));
        let bus = Arc::new(EventBus::default());
        let addr = spawn_server(source, Arc::clone(&bus)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        assert_eq!(next_scene(&mut ws).await.user_location, None);

        let point = GeodeticPoint::new(47.3769, 8.5417);
        bus.publish_to(
            Topic::Localization,
            Event::new("test", EventPayload::UserLocation(point)),
        );
        assert_eq!(next_scene(&mut ws).await.user_location, Some(point));
    }
}
