use std::{borrow::Cow, time::Duration};

use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    protocol::{CloseFrame as BackendCloseFrame, frame::coding::CloseCode},
};
use tracing::Instrument;
use zonekeep_console::MachineName;

use crate::error::ConsoleError;
use crate::state::AppState;
use crate::supervisor::LOOPBACK_HOST;

const SUBPROTOCOL: &str = "binary";
const CLOSE_BACKEND_UNREACHABLE: u16 = 1011;
/// How long the surviving direction may run once the other has ended.
const CLOSE_DRAIN: Duration = Duration::from_secs(2);

fn offers_binary(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL)
}

/// `GET /zones/:name/vnc/websockify`
pub async fn websockify(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let machine = match MachineName::parse(&name) {
        Ok(m) => m,
        Err(e) => return ConsoleError::InvalidMachine(e.0).into_response(),
    };
    let Some(session) = state.registry.peek(&machine).await else {
        return ConsoleError::SessionNotFound(machine.to_string()).into_response();
    };
    if let Err(err) = state.store.touch(&machine).await {
        tracing::debug!(%err, %machine, "failed to touch session record");
    }

    let backend_url = format!(
        "ws://{LOOPBACK_HOST}:{}{}",
        session.port, state.config.backend_ws_path
    );
    let binary = offers_binary(&headers);
    let port = session.port;
    let ws = if binary { ws.protocols([SUBPROTOCOL]) } else { ws };
    ws.on_upgrade(move |socket| bridge(socket, machine, port, backend_url, binary))
        .into_response()
}

fn to_backend(msg: Message) -> Option<tungstenite::Message> {
    match msg {
        Message::Text(t) => Some(tungstenite::Message::Text(t.into())),
        Message::Binary(b) => Some(tungstenite::Message::Binary(b.into())),
        Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            BackendCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.into_owned().into(),
            }
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(t) => Some(Message::Text(t.as_str().to_owned())),
        tungstenite::Message::Binary(b) => Some(Message::Binary(b.to_vec())),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: Cow::Owned(f.reason.as_str().to_owned()),
        }))),
        tungstenite::Message::Ping(_)
        | tungstenite::Message::Pong(_)
        | tungstenite::Message::Frame(_) => None,
    }
}

async fn bridge(client: WebSocket, machine: MachineName, port: u16, backend_url: String, binary: bool) {
    let span = tracing::info_span!("ws_proxy", %machine, port);
    async move {
        let backend = match connect_backend(&backend_url, binary).await {
            Ok(s) => s,
            Err(err) => {
                let err = ConsoleError::BackendUnreachable {
                    port,
                    reason: err.to_string(),
                };
                tracing::warn!(%err, "closing client socket");
                let mut client = client;
                let _ = client
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_BACKEND_UNREACHABLE,
                        reason: Cow::Borrowed("backend unreachable"),
                    })))
                    .await;
                return;
            }
        };
        tracing::debug!("console websocket bridged");

        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend.split();

        splice(&mut client_rx, &mut client_tx, &mut backend_rx, &mut backend_tx).await;
        let _ = client_tx.close().await;
        let _ = backend_tx.close().await;
        tracing::debug!("console websocket closed");
    }
    .instrument(span)
    .await
}

type BackendStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn client_to_backend(
    client_rx: &mut SplitStream<WebSocket>,
    backend_tx: &mut SplitSink<BackendStream, tungstenite::Message>,
) {
    while let Some(Ok(msg)) = client_rx.next().await {
        let closing = matches!(msg, Message::Close(_));
        if let Some(msg) = to_backend(msg)
            && backend_tx.send(msg).await.is_err()
        {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = backend_tx.close().await;
}

async fn backend_to_client(
    backend_rx: &mut SplitStream<BackendStream>,
    client_tx: &mut SplitSink<WebSocket, Message>,
) {
    while let Some(Ok(msg)) = backend_rx.next().await {
        let closing = matches!(msg, tungstenite::Message::Close(_));
        if let Some(msg) = to_client(msg)
            && client_tx.send(msg).await.is_err()
        {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = client_tx.close().await;
}

/// Pumps frames both ways. Once one direction ends, the other gets
/// `CLOSE_DRAIN` to finish its closing handshake.
async fn splice(
    client_rx: &mut SplitStream<WebSocket>,
    client_tx: &mut SplitSink<WebSocket, Message>,
    backend_rx: &mut SplitStream<BackendStream>,
    backend_tx: &mut SplitSink<BackendStream, tungstenite::Message>,
) {
    let upstream = client_to_backend(client_rx, backend_tx);
    let downstream = backend_to_client(backend_rx, client_tx);
    tokio::pin!(upstream, downstream);

    tokio::select! {
        _ = &mut upstream => {
            let _ = tokio::time::timeout(CLOSE_DRAIN, &mut downstream).await;
        }
        _ = &mut downstream => {
            let _ = tokio::time::timeout(CLOSE_DRAIN, &mut upstream).await;
        }
    }
}

async fn connect_backend(
    url: &str,
    binary: bool,
) -> Result<BackendStream, tungstenite::Error> {
    let mut req = url.into_client_request()?;
    if binary {
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header::HeaderValue::from_static(SUBPROTOCOL),
        );
    }
    let (stream, _) = tokio_tungstenite::connect_async(req).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestApp, spawn_console_backend};

    fn web01() -> MachineName {
        MachineName::parse("web01").unwrap()
    }

    #[tokio::test]
    async fn relays_frames_both_ways() {
        let app = TestApp::spawn().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = listener.local_addr().unwrap().port();
        let backend = spawn_console_backend(listener);
        app.state
            .registry
            .write_session_info(&web01(), 4321, "zadm vnc", backend_port, None)
            .await;

        let url = format!("ws://{}/zones/web01/vnc/websockify", app.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(tungstenite::Message::Binary(vec![1u8, 2, 3].into()))
            .await
            .unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(echoed.into_data().to_vec(), vec![1, 2, 3]);

        ws.send(tungstenite::Message::Text("hello".into()))
            .await
            .unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(echoed.to_text().unwrap(), "hello");

        let _ = ws.close(None).await;
        backend.abort();
    }

    #[tokio::test]
    async fn client_close_completes_the_handshake() {
        let app = TestApp::spawn().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = listener.local_addr().unwrap().port();
        let backend = spawn_console_backend(listener);
        app.state
            .registry
            .write_session_info(&web01(), 4321, "zadm vnc", backend_port, None)
            .await;

        let url = format!("ws://{}/zones/web01/vnc/websockify", app.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(tungstenite::Message::Close(None)).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no reply to close");
        assert!(
            matches!(reply, Some(Ok(tungstenite::Message::Close(_)))),
            "expected close frame, got {reply:?}"
        );
        backend.abort();
    }

    #[tokio::test]
    async fn echoes_binary_subprotocol() {
        let app = TestApp::spawn().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = listener.local_addr().unwrap().port();
        let backend = spawn_console_backend(listener);
        app.state
            .registry
            .write_session_info(&web01(), 4321, "zadm vnc", backend_port, None)
            .await;

        let mut req = format!("ws://{}/zones/web01/vnc/websockify", app.addr)
            .into_client_request()
            .unwrap();
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header::HeaderValue::from_static("binary"),
        );
        let (_ws, resp) = tokio_tungstenite::connect_async(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some("binary")
        );
        backend.abort();
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_before_upgrade() {
        let app = TestApp::spawn().await;
        let url = format!("ws://{}/zones/web01/vnc/websockify", app.addr);

        match tokio_tungstenite::connect_async(url).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 404),
            other => panic!("expected 404, got {:?}", other.map(|(_, r)| r.status())),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_closes_with_1011() {
        let app = TestApp::spawn().await;
        let dead_port = crate::testing::free_port().await;
        app.state
            .registry
            .write_session_info(&web01(), 4321, "zadm vnc", dead_port, None)
            .await;

        let url = format!("ws://{}/zones/web01/vnc/websockify", app.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        match ws.next().await {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1011);
                assert_eq!(frame.reason.as_str(), "backend unreachable");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
