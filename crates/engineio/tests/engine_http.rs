//! Integration tests: serve the engine on a free port and talk to it with
//! plain HTTP long-polling and websocket clients.

use engineio::parser::{decode_payload, Packet, PacketKind};
use engineio::{Connection, EngineConfig, ErrorCode, Incoming, Server, SocketEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct Engine {
    server: Server,
    incoming: Option<Incoming>,
    addr: std::net::SocketAddr,
    client: reqwest::Client,
}

impl Engine {
    async fn start(config: EngineConfig) -> Self {
        let (server, incoming) = Server::new(config);
        Self::serve(server, incoming).await
    }

    async fn serve(server: Server, incoming: Incoming) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind free port");
        let addr = listener.local_addr().expect("local_addr");
        let app = server.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            server,
            incoming: Some(incoming),
            addr,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, query: &str) -> String {
        format!("http://{}/engine.io/?{}", self.addr, query)
    }

    fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/engine.io/?{}", self.addr, query)
    }

    /// Answer every message with the same message.
    fn echo(&mut self) {
        let Some(mut incoming) = self.incoming.take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(Connection { socket, mut events }) = incoming.recv().await {
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if let SocketEvent::Message { data, binary } = event {
                            if binary {
                                socket.send_binary(data);
                            } else {
                                socket.send(String::from_utf8_lossy(&data).into_owned());
                            }
                        }
                    }
                });
            }
        });
    }

    async fn get(&self, query: &str) -> reqwest::Response {
        self.client.get(self.url(query)).send().await.expect("GET")
    }

    async fn post(&self, query: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url(query))
            .body(body.to_string())
            .send()
            .await
            .expect("POST")
    }

    async fn poll(&self, sid: &str) -> Vec<Packet> {
        let resp = self.get(&format!("transport=polling&sid={}", sid)).await;
        assert_eq!(resp.status(), 200);
        decode(&resp.bytes().await.expect("poll body"))
    }

    /// Polling handshake; returns the session id and the open packet JSON.
    async fn handshake(&self) -> (String, Value) {
        let resp = self.get("transport=polling").await;
        assert_eq!(resp.status(), 200);
        let packets = decode(&resp.bytes().await.expect("handshake body"));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind(), PacketKind::Open);
        let json: Value = serde_json::from_slice(packets[0].data()).expect("open JSON");
        let sid = json["sid"].as_str().expect("sid").to_string();
        (sid, json)
    }
}

fn decode(body: &[u8]) -> Vec<Packet> {
    let mut out = Vec::new();
    decode_payload(body, |packet, _, _| out.push(packet));
    out
}

async fn error_code(resp: reqwest::Response) -> Value {
    assert_eq!(resp.status(), 400);
    resp.json().await.expect("error JSON")
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket frame in time")
            .expect("websocket open")
            .expect("websocket frame");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

#[tokio::test]
async fn polling_handshake_returns_open_packet_and_cookie() {
    let engine = Engine::start(EngineConfig::default()).await;
    let resp = engine.get("transport=polling").await;
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let packets = decode(&resp.bytes().await.unwrap());
    let json: Value = serde_json::from_slice(packets[0].data()).unwrap();

    let sid = json["sid"].as_str().unwrap();
    assert_eq!(cookie, Some(format!("io={}", sid)));
    assert_eq!(json["upgrades"], serde_json::json!(["websocket"]));
    assert_eq!(json["pingInterval"], 25000);
    assert_eq!(json["pingTimeout"], 60000);
    assert_eq!(engine.server.clients_count(), 1);
    assert!(engine.server.client(sid).is_some());
}

#[tokio::test]
async fn routing_errors_use_fixed_codes() {
    let engine = Engine::start(EngineConfig::default()).await;
    let (sid, _) = engine.handshake().await;

    let cases = [
        (engine.get("transport=flash").await, ErrorCode::UnknownTransport),
        (engine.get("").await, ErrorCode::UnknownTransport),
        (engine.get("transport=polling&sid=nope").await, ErrorCode::UnknownSid),
        (engine.post("transport=polling", "1:2").await, ErrorCode::BadHandshakeMethod),
        (
            engine.get(&format!("transport=websocket&sid={}", sid)).await,
            ErrorCode::BadRequest,
        ),
        (engine.get("transport=websocket").await, ErrorCode::BadRequest),
    ];
    for (resp, expected) in cases {
        let body = error_code(resp).await;
        assert_eq!(body["code"], expected.code());
        assert_eq!(body["message"], expected.to_string());
    }
}

#[tokio::test]
async fn disallowed_transport_is_unknown() {
    let config = EngineConfig {
        transports: vec![engineio::TransportKind::Websocket],
        ..EngineConfig::default()
    };
    let engine = Engine::start(config).await;
    let body = error_code(engine.get("transport=polling").await).await;
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn polling_round_trip_echoes_messages_and_answers_ping() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    engine.echo();
    let (sid, _) = engine.handshake().await;
    let query = format!("transport=polling&sid={}", sid);

    let resp = engine.post(&query, "6:4hello").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
    assert_eq!(
        engine.poll(&sid).await,
        vec![Packet::text(PacketKind::Message, "hello")]
    );

    engine.post(&query, "1:2").await;
    let resp = engine.get(&query).await;
    assert_eq!(resp.text().await.unwrap(), "1:3");
}

#[tokio::test]
async fn overlapping_polls_reject_the_second() {
    let engine = Engine::start(EngineConfig::default()).await;
    let (sid, _) = engine.handshake().await;
    let url = engine.url(&format!("transport=polling&sid={}", sid));

    let client = engine.client.clone();
    let first = tokio::spawn(async move { client.get(url).send().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = engine.get(&format!("transport=polling&sid={}", sid)).await;
    assert_eq!(second.status(), 500);
    assert_eq!(engine.server.clients_count(), 1);

    engine.post(&format!("transport=polling&sid={}", sid), "1:2").await;
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.text().await.unwrap(), "1:3");
}

#[tokio::test]
async fn client_close_packet_ends_session() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    let mut incoming = engine.incoming.take().unwrap();
    let (sid, _) = engine.handshake().await;
    let Connection { mut events, .. } = incoming.recv().await.unwrap();

    engine
        .post(&format!("transport=polling&sid={}", sid), "1:1")
        .await;
    assert_eq!(engine.server.clients_count(), 0);

    let mut reason = None;
    while let Some(event) = events.recv().await {
        if let SocketEvent::Close { reason: r, .. } = event {
            reason = Some(r);
            break;
        }
    }
    assert_eq!(reason, Some(engineio::CloseReason::TransportClose));

    let body = error_code(engine.get(&format!("transport=polling&sid={}", sid)).await).await;
    assert_eq!(body["code"], 1);
}

#[tokio::test]
async fn oversized_post_closes_session_with_parse_error() {
    let config = EngineConfig {
        max_http_buffer_size: 16,
        ..EngineConfig::default()
    };
    let mut engine = Engine::start(config).await;
    let mut incoming = engine.incoming.take().unwrap();
    let (sid, _) = engine.handshake().await;
    let Connection { mut events, .. } = incoming.recv().await.unwrap();

    let big = format!("101:4{}", "x".repeat(100));
    let resp = engine
        .post(&format!("transport=polling&sid={}", sid), &big)
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(engine.server.clients_count(), 0);

    let mut reason = None;
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Close { reason: r, .. } => {
                reason = Some(r);
                break;
            }
            SocketEvent::Message { .. } => panic!("oversized body must not be delivered"),
            _ => {}
        }
    }
    assert_eq!(reason, Some(engineio::CloseReason::ParseError));
}

#[tokio::test]
async fn silent_client_times_out() {
    let config = EngineConfig {
        ping_interval: 50,
        ping_timeout: 50,
        ..EngineConfig::default()
    };
    let engine = Engine::start(config).await;
    engine.handshake().await;
    assert_eq!(engine.server.clients_count(), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.server.clients_count(), 0);
}

#[tokio::test]
async fn allow_request_hook_gates_handshakes_only() {
    let (server, incoming) = Server::with_allow_request(EngineConfig::default(), |req| {
        if req.headers.contains_key("x-engine-token") {
            Ok(())
        } else {
            Err(ErrorCode::BadRequest)
        }
    });
    let engine = Engine::serve(server, incoming).await;

    let body = error_code(engine.get("transport=polling").await).await;
    assert_eq!(body["code"], 3);
    assert_eq!(engine.server.clients_count(), 0);

    let resp = engine
        .client
        .get(engine.url("transport=polling"))
        .header("x-engine-token", "yes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let packets = decode(&resp.bytes().await.unwrap());
    let json: Value = serde_json::from_slice(packets[0].data()).unwrap();
    let sid = json["sid"].as_str().unwrap();

    let resp = engine
        .post(&format!("transport=polling&sid={}", sid), "1:2")
        .await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn server_close_releases_pending_poll() {
    let engine = Engine::start(EngineConfig::default()).await;
    let (sid, _) = engine.handshake().await;
    let url = engine.url(&format!("transport=polling&sid={}", sid));
    let client = engine.client.clone();
    let pending = tokio::spawn(async move { client.get(url).send().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    engine.server.close();
    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.text().await.unwrap(), "1:1");
    assert_eq!(engine.server.clients_count(), 0);
}

#[tokio::test]
async fn websocket_handshake_and_echo() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    engine.echo();

    let (mut ws, response) = connect_async(engine.ws_url("transport=websocket"))
        .await
        .expect("websocket connect");
    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'));
    let json: Value = serde_json::from_str(&open[1..]).unwrap();
    assert_eq!(json["upgrades"], serde_json::json!([]));
    let sid = json["sid"].as_str().unwrap();
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok());
    assert_eq!(cookie, Some(format!("io={}", sid).as_str()));

    ws.send(Message::Text("4hello".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "4hello");

    ws.send(Message::Text("2".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3");

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if engine.server.clients_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session not removed after websocket close");
}

#[tokio::test]
async fn polling_session_upgrades_to_websocket() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    engine.echo();
    let (sid, json) = engine.handshake().await;
    assert_eq!(json["upgrades"], serde_json::json!(["websocket"]));

    let url = engine.url(&format!("transport=polling&sid={}", sid));
    let client = engine.client.clone();
    let pending = tokio::spawn(async move { client.get(url).send().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut ws, _) = connect_async(engine.ws_url(&format!("transport=websocket&sid={}", sid)))
        .await
        .expect("websocket upgrade");
    ws.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3probe");

    let resp = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending poll released")
        .unwrap()
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "1:6");

    ws.send(Message::Text("5".into())).await.unwrap();
    ws.send(Message::Text("4after upgrade".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "4after upgrade");

    let socket = engine.server.client(&sid).expect("session alive");
    assert!(socket.upgraded());
    assert_eq!(socket.transport_kind(), engineio::TransportKind::Websocket);

    let body = error_code(engine.get(&format!("transport=polling&sid={}", sid)).await).await;
    assert_eq!(body["code"], 3);
}

#[tokio::test]
async fn upgrades_disabled_advertises_none_and_rejects_upgrade() {
    let config = EngineConfig {
        allow_upgrades: false,
        ..EngineConfig::default()
    };
    let engine = Engine::start(config).await;
    let (sid, json) = engine.handshake().await;
    assert_eq!(json["upgrades"], serde_json::json!([]));

    let result = connect_async(engine.ws_url(&format!("transport=websocket&sid={}", sid))).await;
    assert!(result.is_err());
    assert_eq!(engine.server.clients_count(), 1);
}

#[tokio::test]
async fn attach_mounts_engine_beside_app_routes() {
    let (server, _incoming) = Server::new(EngineConfig::default());
    let app = server.attach(
        axum::Router::new().route("/health", axum::routing::get(|| async { "up" })),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.text().await.unwrap(), "up");

    let resp = client
        .get(format!("http://{}/engine.io/?transport=polling", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.clients_count(), 1);
}

async fn close_reason(events: &mut engineio::SocketEvents) -> engineio::CloseReason {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("close in time")
            .expect("event stream open");
        if let SocketEvent::Close { reason, .. } = event {
            return reason;
        }
    }
}

#[tokio::test]
async fn upgraded_client_vanishing_closes_session() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    let mut incoming = engine.incoming.take().unwrap();
    let (sid, _) = engine.handshake().await;
    let Connection { mut events, .. } = incoming.recv().await.unwrap();

    let (mut ws, _) = connect_async(engine.ws_url(&format!("transport=websocket&sid={}", sid)))
        .await
        .expect("websocket upgrade");
    ws.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3probe");
    ws.send(Message::Text("5".into())).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("upgrade in time")
            .expect("event stream open");
        if let SocketEvent::Upgrade(kind) = event {
            assert_eq!(kind, engineio::TransportKind::Websocket);
            break;
        }
    }

    drop(ws);
    let reason = close_reason(&mut events).await;
    assert!(matches!(
        reason,
        engineio::CloseReason::TransportClose | engineio::CloseReason::TransportError
    ));
    assert_eq!(engine.server.clients_count(), 0);
}

#[tokio::test]
async fn closing_websocket_session_twice_is_harmless() {
    let mut engine = Engine::start(EngineConfig::default()).await;
    let mut incoming = engine.incoming.take().unwrap();
    let (mut ws, _) = connect_async(engine.ws_url("transport=websocket"))
        .await
        .expect("websocket connect");
    assert!(next_text(&mut ws).await.starts_with('0'));
    let Connection { socket, mut events } = incoming.recv().await.unwrap();

    socket.close();
    socket.close();
    assert_eq!(close_reason(&mut events).await, engineio::CloseReason::ForcedClose);
    assert_eq!(socket.ready_state(), engineio::ReadyState::Closed);
    assert_eq!(engine.server.clients_count(), 0);

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket closes in time");
        match frame {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(Message::Text(text))) => panic!("unexpected frame after close: {}", text),
            Some(Ok(_)) => {}
        }
    }
}
