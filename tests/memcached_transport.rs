use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use guarded_memcached::transport::{EventEmitter, MemcachedTransport};
use guarded_memcached::{
    CacheClient, CacheError, ClientOptions, EventKind, Readiness, Transport, TransportError,
    TransportEvent,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// How the fake server treats its connections
#[derive(Clone, Copy)]
enum Behavior {
    Normal,
    /// Close each connection after answering this many commands
    CloseAfter(usize),
    /// Never answer `get`
    StallGets,
    /// Never answer `version`
    Silent,
}

struct FakeServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    async fn start(behavior: Behavior) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), behavior).await
    }

    async fn start_on(addr: SocketAddr, behavior: Behavior) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let store: Store = Arc::new(Mutex::new(HashMap::new()));

        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&store), behavior));
            }
        });

        Self { addr, accepted }
    }

    fn options(&self) -> ClientOptions {
        ClientOptions::new(self.addr.ip().to_string(), self.addr.port())
            .with_timeout(Duration::from_millis(500))
            .with_retry_delay(Duration::from_millis(50))
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, store: Store, behavior: Behavior) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut handled = 0;

    loop {
        if let Behavior::CloseAfter(limit) = behavior {
            if handled == limit {
                return;
            }
        }

        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        let reply = match parts.as_slice() {
            ["set", key, _flags, _exptime, len] => {
                let len: usize = len.parse().unwrap();
                let mut data = vec![0u8; len + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                data.truncate(len);
                store.lock().unwrap().insert(key.to_string(), data);
                Some("STORED\r\n".to_string())
            }
            ["version"] if matches!(behavior, Behavior::Silent) => None,
            ["get", _] if matches!(behavior, Behavior::StallGets) => None,
            other => Some(answer(&store, other)),
        };

        handled += 1;
        if let Some(reply) = reply {
            if writer.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn answer(store: &Store, parts: &[&str]) -> String {
    let mut store = store.lock().unwrap();
    match parts {
        ["version"] => "VERSION 1.6.21\r\n".to_string(),
        ["get", key] => match store.get(*key) {
            Some(data) => format!(
                "VALUE {} 0 {}\r\n{}\r\nEND\r\n",
                key,
                data.len(),
                String::from_utf8_lossy(data)
            ),
            None => "END\r\n".to_string(),
        },
        ["delete", key] => match store.remove(*key) {
            Some(_) => "DELETED\r\n".to_string(),
            None => "NOT_FOUND\r\n".to_string(),
        },
        ["touch", key, _] => {
            if store.contains_key(*key) {
                "TOUCHED\r\n".to_string()
            } else {
                "NOT_FOUND\r\n".to_string()
            }
        }
        _ => "ERROR\r\n".to_string(),
    }
}

fn event_channel() -> (EventEmitter, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let emitter = EventEmitter::new(move |event| {
        let _ = tx.send(event);
    });
    (emitter, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .expect("emitter dropped")
}

/// Count `Ready` notifications the client forwards
fn ready_channel<F: guarded_memcached::TransportFactory>(
    client: &CacheClient<F>,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(EventKind::Ready, move |_, server| {
        let _ = tx.send(server.to_string());
    });
    rx
}

async fn next_ready(ready: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(2), ready.recv())
        .await
        .expect("not ready within 2s")
        .expect("listener dropped")
}

#[tokio::test]
async fn test_client_round_trip() {
    let server = FakeServer::start(Behavior::Normal).await;
    let client = CacheClient::new(server.options());
    client.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.connection().server_name(), server.addr.to_string());

    client
        .set_with_ttl("user:1", &serde_json::json!({"name": "ada", "tags": [1, 2]}), 60)
        .await
        .unwrap();
    let user: Option<serde_json::Value> = client.get("user:1").await.unwrap();
    assert_eq!(user, Some(serde_json::json!({"name": "ada", "tags": [1, 2]})));

    assert!(client.expire("user:1", 120).await.unwrap());
    client.delete("user:1").await.unwrap();
    client.delete("user:1").await.unwrap();
    assert!(!client.expire("user:1", 120).await.unwrap());

    let gone: Option<serde_json::Value> = client.get("user:1").await.unwrap();
    assert!(gone.is_none());

    client.quit();
}

#[tokio::test]
async fn test_pipelined_requests() {
    let server = FakeServer::start(Behavior::Normal).await;
    let (emitter, mut events) = event_channel();
    let transport = MemcachedTransport::open(server.options(), emitter);
    assert_eq!(next_event(&mut events).await, TransportEvent::Ready);
    assert!(transport.is_online());

    let (a, b) = tokio::join!(
        transport.set("a", Bytes::from_static(b"1"), 0),
        transport.set("b", Bytes::from_static(b"22"), 0),
    );
    a.unwrap();
    b.unwrap();

    let (a, b, missing, deleted) = tokio::join!(
        transport.get("a"),
        transport.get("b"),
        transport.get("missing"),
        transport.delete("nope"),
    );
    assert_eq!(a.unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(b.unwrap(), Some(Bytes::from_static(b"22")));
    assert_eq!(missing.unwrap(), None);
    assert!(!deleted.unwrap());

    transport.end();
    assert_eq!(next_event(&mut events).await, TransportEvent::Remove);
    assert!(matches!(
        transport.get("a").await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_ready_check_gates_readiness() {
    let server = FakeServer::start(Behavior::Silent).await;

    let mut options = server.options();
    options.connect_timeout = 100;
    let client = CacheClient::new(options.clone());
    let result = client.wait_ready(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(CacheError::Timeout(_))));
    assert_eq!(client.readiness(), Readiness::Connecting);
    assert!(matches!(client.get::<u32>("k").await, Err(CacheError::NotReady)));
    client.quit();

    // Without the probe the handle is ready as soon as it connects
    let client = CacheClient::new(options.with_ready_check(false));
    client.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.readiness(), Readiness::Ready);
}

#[tokio::test]
async fn test_unreachable_server() {
    let addr = free_addr().await;

    let options = ClientOptions::new(addr.ip().to_string(), addr.port())
        .with_retry_delay(Duration::from_millis(50))
        .with_offline_queue(false);
    let (emitter, mut events) = event_channel();
    let transport = MemcachedTransport::open(options, emitter);

    assert!(matches!(
        transport.get("k").await,
        Err(TransportError::Offline)
    ));

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Failure { .. }
    ));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(50)
        }
    );

    transport.end();
    loop {
        if next_event(&mut events).await == TransportEvent::Remove {
            break;
        }
    }
}

/// An address nothing listens on, yet
async fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

#[tokio::test]
async fn test_offline_queue_flushes_on_ready() {
    let addr = free_addr().await;
    let options = ClientOptions::new(addr.ip().to_string(), addr.port())
        .with_retry_delay(Duration::from_millis(20));
    let (emitter, mut events) = event_channel();
    let transport = MemcachedTransport::open(options, emitter);
    assert!(!transport.is_online());

    // Both requests are queued before the server exists
    let (stored, fetched, _server) = tokio::join!(
        transport.set("queued", Bytes::from_static(b"\"later\""), 0),
        transport.get("queued"),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            FakeServer::start_on(addr, Behavior::Normal).await
        },
    );

    stored.unwrap();
    assert_eq!(fetched.unwrap(), Some(Bytes::from_static(b"\"later\"")));
    assert!(transport.is_online());

    loop {
        if next_event(&mut events).await == TransportEvent::Ready {
            break;
        }
    }
}

#[tokio::test]
async fn test_end_while_dialling_fails_queued_requests() {
    let addr = free_addr().await;
    let options = ClientOptions::new(addr.ip().to_string(), addr.port())
        .with_retry_delay(Duration::from_millis(20));
    let (emitter, mut events) = event_channel();
    let transport = MemcachedTransport::open(options, emitter);

    let (queued, _) = tokio::join!(transport.get("k"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.end();
    });
    assert!(matches!(queued, Err(TransportError::Closed)));

    loop {
        if next_event(&mut events).await == TransportEvent::Remove {
            break;
        }
    }
}

#[tokio::test]
async fn test_reconnect_after_connection_loss() {
    // The first connection answers `version` and one command, then closes
    let server = FakeServer::start(Behavior::CloseAfter(2)).await;
    let client = CacheClient::new(server.options());
    let mut ready = ready_channel(&client);

    assert_eq!(next_ready(&mut ready).await, server.addr.to_string());
    client.set("session:42", "active").await.unwrap();

    // Losing the stream makes the connection open a new handle
    next_ready(&mut ready).await;
    assert_eq!(server.accepted(), 2);

    let session: Option<String> = client.get("session:42").await.unwrap();
    assert_eq!(session.as_deref(), Some("active"));
}

#[tokio::test]
async fn test_timeout_triggers_reconnect() {
    let server = FakeServer::start(Behavior::StallGets).await;
    let options = server.options().with_timeout(Duration::from_millis(100));
    let client = CacheClient::new(options);
    let mut ready = ready_channel(&client);
    next_ready(&mut ready).await;

    let started = std::time::Instant::now();
    let result = client.get::<String>("slow").await;
    assert!(matches!(result, Err(CacheError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));

    next_ready(&mut ready).await;
    assert_eq!(server.accepted(), 2);
    client.set("k", &1).await.unwrap();
}
