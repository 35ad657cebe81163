//! Shared harness: a real server on an ephemeral port and a minimal
//! Y.js-style client speaking the binary protocol over tokio-tungstenite.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nuxtype_collab::{
    sign_token, AccessPolicy, Claims, JwtVerifier, MessageType, ServerConfig, SnapshotStore,
    SyncMessage, SyncServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

pub const SECRET: &[u8] = b"integration-secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        broadcast_capacity: 64,
        initial_sync_timeout: Duration::from_millis(200),
        jwt_secret: String::from_utf8_lossy(SECRET).into_owned(),
        ..ServerConfig::default()
    };
    config.persistence.debounce = Duration::from_millis(50);
    config.persistence.max_debounce = Duration::from_millis(500);
    config.persistence.retry_backoff = Duration::from_millis(1);
    config
}

pub fn token_for(user: &str) -> String {
    token_signed_with(SECRET, user)
}

pub fn token_signed_with(secret: &[u8], user: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    sign_token(
        secret,
        &Claims {
            user_id: user.to_string(),
            email: format!("{user}@example.com"),
            exp: Some(now + 3600),
            nbf: None,
        },
    )
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SyncServer>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(
        config: ServerConfig,
        policy: Arc<dyn AccessPolicy>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SyncServer::new(
            config,
            Arc::new(JwtVerifier::new(SECRET)),
            policy,
            store,
        ));

        let (tx, rx) = oneshot::channel::<()>();
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            serving
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            server,
            shutdown: Some(tx),
            handle,
        }
    }

    /// Stop accepting, flush every session, wait for the server to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.handle).await.unwrap();
    }

    pub fn url(&self, document: &str) -> String {
        format!("ws://{}/{document}", self.addr)
    }

    /// Poll until `check` holds or a few seconds pass.
    pub async fn wait_for<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        false
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a client saw next on its socket.
#[derive(Debug)]
pub enum Incoming {
    Sync(SyncMessage),
    Closed(Option<CloseCode>),
}

pub struct TestClient {
    ws: Ws,
    pub doc: yrs::Doc,
}

impl TestClient {
    /// Open a connection with a bearer token, without syncing.
    pub async fn open(url: &str, token: &str) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self {
            ws,
            doc: yrs::Doc::new(),
        })
    }

    /// Open, announce our state vector, and apply the server's answer.
    pub async fn join(url: &str, user: &str) -> Self {
        let mut client = Self::open(url, &token_for(user)).await.unwrap();
        let sv = client.doc.transact().state_vector().encode_v1();
        client.send(&SyncMessage::sync_step1(sv)).await;

        let step2 = client.expect(MessageType::SyncStep2).await;
        client.apply(&step2.payload);
        client.expect(MessageType::SyncStep1).await;
        client
    }

    pub async fn send(&mut self, msg: &SyncMessage) {
        self.send_raw(msg.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn recv(&mut self) -> Incoming {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match next {
                Some(Ok(Message::Binary(data))) => {
                    return Incoming::Sync(SyncMessage::decode(&data).unwrap())
                }
                Some(Ok(Message::Close(frame))) => return Incoming::Closed(frame.map(|f| f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Incoming::Closed(None),
            }
        }
    }

    pub async fn expect(&mut self, msg_type: MessageType) -> SyncMessage {
        match self.recv().await {
            Incoming::Sync(msg) if msg.msg_type == msg_type => msg,
            other => panic!("expected {msg_type:?}, got {other:?}"),
        }
    }

    /// Round-trip a ping; everything the server queued before it arrives
    /// first and is returned.
    pub async fn drain(&mut self) -> Vec<SyncMessage> {
        self.send(&SyncMessage::ping()).await;
        let mut seen = Vec::new();
        loop {
            match self.recv().await {
                Incoming::Sync(msg) if msg.msg_type == MessageType::Pong => return seen,
                Incoming::Sync(msg) => seen.push(msg),
                Incoming::Closed(code) => panic!("closed while draining: {code:?}"),
            }
        }
    }

    /// Insert locally and send the resulting update.
    pub async fn insert(&mut self, index: u32, chunk: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, index, chunk);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&before);
        self.send(&SyncMessage::update(update.clone())).await;
        update
    }

    pub fn apply(&mut self, update: &[u8]) {
        let update = yrs::Update::decode_v1(update).unwrap();
        self.doc.transact_mut().apply_update(update).unwrap();
    }

    pub fn text(&self) -> String {
        text_of_doc(&self.doc)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Wait for the server's close acknowledgement
        while let Ok(Some(Ok(_))) = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}

fn text_of_doc(doc: &yrs::Doc) -> String {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

/// Text held by an encoded snapshot.
pub fn text_of(snapshot: &[u8]) -> String {
    let doc = yrs::Doc::new();
    let update = yrs::Update::decode_v1(snapshot).unwrap();
    doc.transact_mut().apply_update(update).unwrap();
    text_of_doc(&doc)
}
