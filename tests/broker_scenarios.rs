// End-to-end broker scenarios over loopback TCP
// Raw line clients and peer clients against a real listener

use std::sync::Arc;
use std::time::Duration;

use heart::broker::Broker;
use heart::error::PeerError;
use heart::net::connection::{Connection, Frame, LineReader, LineWriter};
use heart::net::listener::TcpServer;
use heart::net::messages::{Extras, Message, Request, Response};
use heart::net::peer::{Peer, PeerConfig};
use serde_json::{json, Value};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(2);

async fn start(broker: Broker) -> (TcpServer, Arc<Broker>) {
    let broker = Arc::new(broker);
    let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&broker), None)
        .await
        .unwrap();
    (server, broker)
}

/// Raw client speaking JSON lines
struct LineClient {
    reader: LineReader,
    writer: LineWriter,
}

impl LineClient {
    async fn connect(server: &TcpServer) -> Self {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let (reader, writer) = Connection::new(stream, server.addr()).into_split();
        LineClient { reader, writer }
    }

    async fn send(&mut self, value: Value) {
        self.writer.write_line(&value.to_string()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_line(line).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.reader.read_frame())
            .await
            .expect("no message within timeout")
            .unwrap()
            .expect("connection closed");
        match frame {
            Frame::Line(line) => serde_json::from_str(&line).unwrap(),
            Frame::Rejected(e) => panic!("Unreadable frame from broker: {e}"),
        }
    }

    async fn control(&mut self, request_type: &str, id: u64, name: &str) -> Value {
        self.send(json!({
            "application": "Heart",
            "request-type": request_type,
            "message-id": id,
            "name": name,
        }))
        .await;
        self.recv().await
    }
}

#[tokio::test]
async fn test_forwarded_request_round_trip() {
    let (server, _broker) = start(Broker::new()).await;
    let mut a = LineClient::connect(&server).await;
    let mut b = LineClient::connect(&server).await;

    assert_eq!(a.control("Register", 0, "App1").await["status"], "ok");
    assert_eq!(b.control("Subscribe", 0, "App1").await["status"], "ok");

    b.send(json!({
        "application": "App1",
        "request-type": "GetScene",
        "message-id": 5,
        "scene": "Live",
    }))
    .await;

    let forwarded = a.recv().await;
    assert_eq!(forwarded["application"], "App1");
    assert_eq!(forwarded["request-type"], "GetScene");
    assert_eq!(forwarded["scene"], "Live");
    let rewritten = forwarded["message-id"].as_u64().unwrap();

    a.send(json!({"message-id": rewritten, "status": "ok", "error": "", "scene-name": "Live"}))
        .await;

    let reply = b.recv().await;
    assert_eq!(reply["message-id"], 5);
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["scene-name"], "Live");
}

#[tokio::test]
async fn test_pending_client_has_no_subscriptions() {
    let (server, _broker) = start(Broker::new()).await;
    let mut b = LineClient::connect(&server).await;

    b.send(json!({"application": "App1", "request-type": "GetScene", "message-id": 5}))
        .await;
    let reply = b.recv().await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error"], "You have no subscriptions");
    assert_eq!(reply["message-id"], 5);
}

#[tokio::test]
async fn test_pending_client_only_sends_requests() {
    let (server, _broker) = start(Broker::new()).await;
    let mut b = LineClient::connect(&server).await;

    b.send(json!({"update-type": "Bitrate", "kbps": 1000})).await;
    let reply = b.recv().await;
    assert_eq!(reply["status"], "error");
    assert!(reply["error"].as_str().unwrap().starts_with("Only requests allowed."));

    // The connection survives protocol errors
    assert_eq!(b.control("Register", 1, "App1").await["status"], "ok");
    b.send_raw("{not json").await;
    assert_eq!(b.recv().await["error"], "Invalid message");
}

#[tokio::test]
async fn test_invalid_utf8_gets_error_reply() {
    use tokio::io::AsyncWriteExt;

    let (server, _broker) = start(Broker::new()).await;
    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    stream
        .write_all(b"{\"update-type\": \"Scene\xff\"}\n")
        .await
        .unwrap();

    let (reader, writer) = Connection::new(stream, server.addr()).into_split();
    let mut client = LineClient { reader, writer };
    let reply = client.recv().await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error"], "Only requests allowed. Message is not valid UTF-8");

    // Same connection keeps working
    assert_eq!(client.control("Register", 1, "App1").await["status"], "ok");
}

#[tokio::test]
async fn test_duplicate_registration() {
    let (server, broker) = start(Broker::new()).await;
    let mut a = LineClient::connect(&server).await;
    let mut b = LineClient::connect(&server).await;

    assert_eq!(a.control("Register", 0, "App1").await["status"], "ok");
    let reply = b.control("Register", 7, "App1").await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error"], "App1 is already registered");
    assert_eq!(reply["message-id"], 7);

    // First registration is unaffected
    assert_eq!(broker.status().await.applications, vec!["App1".to_string()]);
    assert_eq!(b.control("Subscribe", 8, "App1").await["status"], "ok");
}

#[tokio::test]
async fn test_disconnect_releases_registration() {
    let (server, broker) = start(Broker::new()).await;
    let mut a = LineClient::connect(&server).await;
    let mut b = LineClient::connect(&server).await;

    assert_eq!(a.control("Register", 0, "App1").await["status"], "ok");
    assert_eq!(b.control("Subscribe", 0, "App1").await["status"], "ok");

    drop(a);

    let event = b.recv().await;
    assert_eq!(event["update-type"], "UnsubscribedFrom");
    assert_eq!(event["name"], "App1");

    tokio::time::timeout(WAIT, async {
        while broker.connection_count().await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The name is free and the stale subscription is gone
    let mut c = LineClient::connect(&server).await;
    assert_eq!(c.control("Register", 0, "App1").await["status"], "ok");
    assert_eq!(b.control("Unsubscribe", 1, "App1").await["error"], "App1 is not subscribed");
}

#[tokio::test]
async fn test_event_fan_out() {
    let (server, _broker) = start(Broker::new()).await;
    let mut owner = LineClient::connect(&server).await;
    let mut first = LineClient::connect(&server).await;
    let mut second = LineClient::connect(&server).await;

    assert_eq!(owner.control("Register", 0, "Heart Rate").await["status"], "ok");
    assert_eq!(first.control("Subscribe", 0, "Heart Rate").await["status"], "ok");
    assert_eq!(second.control("Subscribe", 0, "Heart Rate").await["status"], "ok");

    owner.send(json!({"update-type": "HeartRate", "bpm": 92})).await;

    for client in [&mut first, &mut second] {
        let event = client.recv().await;
        assert_eq!(event["update-type"], "HeartRate");
        assert_eq!(event["bpm"], 92);
    }
}

#[tokio::test]
async fn test_forward_timeout_reaches_requester() {
    let (server, _broker) = start(Broker::with_request_timeout(Duration::from_millis(200))).await;
    let mut owner = LineClient::connect(&server).await;
    assert_eq!(owner.control("Register", 0, "App1").await["status"], "ok");

    let peer = Peer::builder(PeerConfig::new("requester", server.addr().to_string()).subscribe("App1"))
        .build();
    let handle = peer.handle();
    tokio::spawn(peer.run());
    tokio::time::timeout(WAIT, handle.wait_ready()).await.unwrap();

    // The owner receives the request but never answers
    let request = tokio::spawn(async move { handle.request("App1", "GetScene", Extras::new()).await });
    assert_eq!(owner.recv().await["request-type"], "GetScene");

    match request.await.unwrap() {
        Err(PeerError::Status { error, .. }) => assert_eq!(error, "Request to App1 timed out"),
        other => panic!("Expected Status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_request_timeout() {
    let (server, _broker) = start(Broker::new()).await;
    let mut owner = LineClient::connect(&server).await;
    assert_eq!(owner.control("Register", 0, "App1").await["status"], "ok");

    let mut config = PeerConfig::new("requester", server.addr().to_string()).subscribe("App1");
    config.request_timeout = Duration::from_millis(200);
    let peer = Peer::builder(config).build();
    let handle = peer.handle();
    tokio::spawn(peer.run());
    tokio::time::timeout(WAIT, handle.wait_ready()).await.unwrap();

    let id = handle.next_id();
    let result = handle.send_wait(Request::new("App1", "GetScene", id)).await;
    match result {
        Err(PeerError::Timeout { id: timed_out }) => assert_eq!(timed_out, id),
        other => panic!("Expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_events_and_requests() {
    let (server, _broker) = start(Broker::new()).await;
    let address = server.addr().to_string();

    let (tx, mut rx) = tokio::sync::mpsc::channel::<i64>(4);
    let listener = Peer::builder(PeerConfig::new("dashboard", address.clone()).subscribe("Heart Rate"))
        .on_event("HeartRate", move |event, _handle| {
            let tx = tx.clone();
            async move {
                let bpm = event.extras.get("bpm").and_then(Value::as_i64).unwrap_or_default();
                let _ = tx.send(bpm).await;
            }
        })
        .build();

    let source = Peer::builder(PeerConfig::new("sensor", address).register("Heart Rate"))
        .on_request("GetHeartRate", |_request, _handle| async move {
            Response::ok(0).with("bpm", 88)
        })
        .build();
    let source_handle = source.handle();
    tokio::spawn(source.run());
    tokio::time::timeout(WAIT, source_handle.wait_ready()).await.unwrap();

    let listener_handle = listener.handle();
    tokio::spawn(listener.run());
    tokio::time::timeout(WAIT, listener_handle.wait_ready()).await.unwrap();

    let event = heart::net::messages::Event::new("HeartRate").with("bpm", 92);
    source_handle.send(Message::Event(event)).await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(92));

    let response = listener_handle
        .request("Heart Rate", "GetHeartRate", Extras::new())
        .await
        .unwrap();
    assert_eq!(response.extras["bpm"], 88);
}
