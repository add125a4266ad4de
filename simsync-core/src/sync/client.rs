//! WebSocket sync client for one bucket.
//!
//! A connection moves through handshake, a full index fetch that rebuilds
//! the mirror, and then streaming, where a reader task applies broadcast
//! changes while the writer loop sends heartbeats and queued changes. The
//! connection is never retried here; reconnecting is up to the caller.

use std::future::Future;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;

use super::error::SyncError;
use super::protocol::{
    AuthReply, Broadcast, Change, ClientFrame, DecodeError, EntityReply, InitRequest,
    ServerFrame, API_VERSION, CHANNEL_PREFIX, DEFAULT_INDEX_PAGE_SIZE, LIBRARY_NAME,
};
use crate::bucket::{BucketState, SharedBucket};

/// Default sync server.
pub const DEFAULT_SERVER_URL: &str = "wss://api.simperium.com";
/// How often the writer sends a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// How long to wait for the server to close after our close frame.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Everything the client needs to open a connection.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub app_id: String,
    pub token: String,
    /// Bucket name sent in the init frame
    pub bucket: String,
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub close_grace: Duration,
    pub index_page_size: usize,
}

impl ClientSettings {
    /// Settings for the default server and the `note` bucket.
    pub fn new(app_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            app_id: app_id.into(),
            token: token.into(),
            bucket: "note".to_string(),
            client_id: format!("{}-{}", LIBRARY_NAME, uuid::Uuid::new_v4().simple()),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            close_grace: CLOSE_GRACE,
            index_page_size: DEFAULT_INDEX_PAGE_SIZE,
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Bootstrapping,
    Streaming,
    Closing,
    Closed,
}

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The shutdown signal fired.
    Interrupted,
    /// The server closed the connection.
    RemoteClosed,
}

enum WriteEnd {
    Interrupted,
    ReaderFinished,
    Failed(SyncError),
}

/// Sync client for one bucket.
#[derive(Debug)]
pub struct SyncClient {
    settings: ClientSettings,
    state: watch::Sender<ConnectionState>,
}

impl SyncClient {
    pub fn new(settings: ClientSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { settings, state }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Subscribes to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connects to the server and syncs until `shutdown` resolves or the
    /// connection ends.
    pub async fn run<S, F>(
        &self,
        bucket: SharedBucket<S>,
        outgoing: mpsc::Receiver<Change>,
        shutdown: F,
    ) -> Result<Disconnect, SyncError>
    where
        S: BucketState + 'static,
        F: Future<Output = ()>,
    {
        let url = self.build_ws_url();
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        let (sink, stream) = ws_stream.split();

        self.run_with(sink, stream, bucket, outgoing, shutdown).await
    }

    /// Runs a whole connection over an already open transport.
    pub async fn run_with<Tx, Rx, S, F>(
        &self,
        mut sink: Tx,
        mut stream: Rx,
        bucket: SharedBucket<S>,
        outgoing: mpsc::Receiver<Change>,
        shutdown: F,
    ) -> Result<Disconnect, SyncError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
        S: BucketState + 'static,
        F: Future<Output = ()>,
    {
        if let Err(e) = self.prepare(&mut sink, &mut stream, &bucket).await {
            self.set_state(ConnectionState::Closing);
            close_transport(&mut sink).await;
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }

        self.set_state(ConnectionState::Streaming);
        let (done_tx, mut done_rx) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let result = read_loop(stream, bucket).await;
            let _ = done_tx.send(());
            result
        });

        let end = self
            .write_loop(&mut sink, outgoing, shutdown, &mut done_rx)
            .await;

        self.set_state(ConnectionState::Closing);
        if !matches!(end, WriteEnd::ReaderFinished) {
            if let Err(e) = sink.send(Message::Close(None)).await {
                tracing::debug!("Close frame not sent: {}", e);
            }
            if timeout(self.settings.close_grace, &mut done_rx).await.is_err() {
                tracing::debug!("Server did not close within {:?}", self.settings.close_grace);
            }
        }
        close_transport(&mut sink).await;

        if !reader.is_finished() {
            reader.abort();
        }
        let read_result = match reader.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SyncError::TransportError(format!("reader task failed: {}", e))),
        };
        self.set_state(ConnectionState::Closed);

        match end {
            WriteEnd::Failed(e) => Err(e),
            WriteEnd::Interrupted => {
                if let Err(e) = read_result {
                    tracing::debug!("Reader ended with error during shutdown: {}", e);
                }
                Ok(Disconnect::Interrupted)
            }
            WriteEnd::ReaderFinished => read_result.map(|_| Disconnect::RemoteClosed),
        }
    }

    /// Handshake and bootstrap.
    async fn prepare<Tx, Rx, S>(
        &self,
        sink: &mut Tx,
        stream: &mut Rx,
        bucket: &SharedBucket<S>,
    ) -> Result<(), SyncError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, WsError>> + Unpin,
        S: BucketState,
    {
        self.set_state(ConnectionState::Handshaking);
        self.handshake(sink, stream).await?;

        self.set_state(ConnectionState::Bootstrapping);
        let mut pending = Vec::new();
        let (cursor, replies) = self.fetch_bucket(sink, stream, &mut pending).await?;

        let mut bucket = bucket.lock().await;
        bucket.bootstrap(cursor, replies)?;
        if !pending.is_empty() {
            tracing::debug!("Applying {} change(s) received during bootstrap", pending.len());
        }
        for broadcast in &pending {
            bucket.receive(broadcast)?;
        }
        Ok(())
    }

    /// Sends the init frame and checks both acknowledgements.
    async fn handshake<Tx, Rx>(&self, sink: &mut Tx, stream: &mut Rx) -> Result<(), SyncError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let init = ClientFrame::Init(InitRequest {
            name: self.settings.bucket.clone(),
            client_id: self.settings.client_id.clone(),
            api: API_VERSION.to_string(),
            token: self.settings.token.clone(),
            app_id: self.settings.app_id.clone(),
            library: LIBRARY_NAME.to_string(),
            version: crate::version().to_string(),
        });
        send_frame(sink, &init).await?;

        let auth = next_text(stream).await?;
        match ServerFrame::decode(&auth) {
            Ok(ServerFrame::Auth(AuthReply::Accepted(user))) => {
                tracing::info!("Authenticated as {}", user);
            }
            Ok(ServerFrame::Auth(AuthReply::Rejected(message))) => {
                return Err(SyncError::HandshakeError(format!(
                    "authentication rejected: {}",
                    message
                )));
            }
            Ok(other) => {
                return Err(SyncError::HandshakeError(format!(
                    "expected auth acknowledgement, got {:?}",
                    other
                )));
            }
            Err(e) => {
                return Err(SyncError::HandshakeError(format!(
                    "malformed auth acknowledgement: {}",
                    e
                )));
            }
        }

        let ack = next_text(stream).await?;
        if !ack.starts_with(CHANNEL_PREFIX) {
            return Err(SyncError::HandshakeError(format!(
                "unexpected bucket acknowledgement '{}'",
                ack
            )));
        }
        tracing::debug!("Bucket acknowledged: {}", ack);

        Ok(())
    }

    /// Fetches every index page and then every listed entity.
    ///
    /// Change broadcasts that arrive meanwhile are collected in `pending`.
    async fn fetch_bucket<Tx, Rx>(
        &self,
        sink: &mut Tx,
        stream: &mut Rx,
        pending: &mut Vec<Broadcast>,
    ) -> Result<(String, Vec<EntityReply>), SyncError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let mut mark = None;
        let mut cursor = String::new();
        let mut entries = Vec::new();

        loop {
            let request = ClientFrame::Index {
                mark: mark.take(),
                page_size: self.settings.index_page_size,
            };
            send_frame(sink, &request).await?;

            let page = match next_reply(stream, pending).await? {
                ServerFrame::Index(page) => page,
                other => {
                    return Err(SyncError::InvalidBootstrapData(format!(
                        "expected index page, got {:?}",
                        other
                    )))
                }
            };

            cursor = page.current;
            entries.extend(page.index);
            match page.mark {
                Some(next) if !next.is_empty() => mark = Some(next),
                _ => break,
            }
        }

        tracing::info!("Bucket index lists {} entities at {}", entries.len(), cursor);

        let mut replies = Vec::with_capacity(entries.len());
        for entry in entries {
            let request = ClientFrame::Entity {
                id: entry.id.clone(),
                version: entry.version,
            };
            send_frame(sink, &request).await?;

            match next_reply(stream, pending).await? {
                ServerFrame::Entity(reply) if reply.id == entry.id => replies.push(reply),
                other => {
                    return Err(SyncError::InvalidBootstrapData(format!(
                        "expected entity {}, got {:?}",
                        entry.id, other
                    )))
                }
            }
        }

        Ok((cursor, replies))
    }

    /// Services heartbeats, queued changes and shutdown, one frame per event.
    async fn write_loop<Tx, F>(
        &self,
        sink: &mut Tx,
        mut outgoing: mpsc::Receiver<Change>,
        shutdown: F,
        reader_done: &mut oneshot::Receiver<()>,
    ) -> WriteEnd
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut heartbeat_count: u64 = 0;
        let mut queue_open = true;

        loop {
            tokio::select! {
                _ = &mut *reader_done => return WriteEnd::ReaderFinished,
                _ = &mut shutdown => {
                    tracing::info!("Interrupted, closing connection");
                    return WriteEnd::Interrupted;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_frame(sink, &ClientFrame::Heartbeat(heartbeat_count)).await {
                        return WriteEnd::Failed(e);
                    }
                    heartbeat_count += 2;
                }
                change = outgoing.recv(), if queue_open => match change {
                    Some(change) => {
                        tracing::debug!("Sending change {} for {}", change.ccid, change.target_id);
                        if let Err(e) = send_frame(sink, &ClientFrame::Change(change)).await {
                            return WriteEnd::Failed(e);
                        }
                    }
                    None => {
                        tracing::debug!("Outgoing change queue closed");
                        queue_open = false;
                    }
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!("Connection state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Builds the WebSocket URL for the configured app.
    fn build_ws_url(&self) -> String {
        let server_url = self.settings.server_url.trim_end_matches('/');

        // Convert http(s) to ws(s) if needed
        let base_url = if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
            format!("wss://{}", server_url)
        } else {
            server_url.to_string()
        };

        format!("{}/sock/1/{}/websocket", base_url, self.settings.app_id)
    }
}

/// Reader pump: applies broadcasts in arrival order until the stream ends.
async fn read_loop<Rx, S>(mut stream: Rx, bucket: SharedBucket<S>) -> Result<(), SyncError>
where
    Rx: Stream<Item = Result<Message, WsError>> + Unpin,
    S: BucketState,
{
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                tracing::info!("Server closed the connection: {:?}", frame);
                return Ok(());
            }
            Ok(Message::Binary(_)) => {
                return Err(DecodeError::Unrecognized("<binary frame>".to_string()).into())
            }
            Ok(_) => continue,
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(()),
            Err(e) => return Err(SyncError::TransportError(e.to_string())),
        };

        match ServerFrame::decode(text.as_str())? {
            ServerFrame::Heartbeat(count) => tracing::trace!("Heartbeat {}", count),
            ServerFrame::Changes(broadcasts) => {
                let mut bucket = bucket.lock().await;
                for broadcast in &broadcasts {
                    bucket.receive(broadcast)?;
                }
            }
            other => tracing::debug!("Ignoring unsolicited frame {:?}", other),
        }
    }

    Ok(())
}

async fn send_frame<Tx>(sink: &mut Tx, frame: &ClientFrame) -> Result<(), SyncError>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::fmt::Display,
{
    let text = frame
        .encode()
        .map_err(|e| SyncError::TransportError(format!("failed to encode frame: {}", e)))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SyncError::TransportError(e.to_string()))
}

/// Next text frame, skipping control frames.
async fn next_text<Rx>(stream: &mut Rx) -> Result<String, SyncError>
where
    Rx: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Binary(_))) => {
                return Err(DecodeError::Unrecognized("<binary frame>".to_string()).into())
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SyncError::TransportError(
                    "connection closed by server".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SyncError::TransportError(e.to_string())),
        }
    }
}

/// Next reply to a bootstrap request. Broadcasts are set aside, heartbeats skipped.
async fn next_reply<Rx>(stream: &mut Rx, pending: &mut Vec<Broadcast>) -> Result<ServerFrame, SyncError>
where
    Rx: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ServerFrame::decode(&next_text(stream).await?)? {
            ServerFrame::Changes(broadcasts) => pending.extend(broadcasts),
            ServerFrame::Heartbeat(_) => continue,
            reply => return Ok(reply),
        }
    }
}

async fn close_transport<Tx>(sink: &mut Tx)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::fmt::Display,
{
    if let Err(e) = sink.close().await {
        tracing::debug!("Transport close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Bucket, StateError};
    use crate::store::{Applied, Entity};
    use futures::channel::mpsc as wire;
    use serde_json::Value;

    #[derive(Default)]
    struct Recorder {
        inits: usize,
        updates: Vec<String>,
    }

    impl BucketState for Recorder {
        fn init(&mut self, _cursor: &str, _entities: &[Entity]) -> Result<(), StateError> {
            self.inits += 1;
            Ok(())
        }

        fn update(&mut self, change: &Change, _applied: &Applied) -> Result<(), StateError> {
            self.updates.push(change.target_id.clone());
            Ok(())
        }
    }

    /// The server end of an in-memory connection.
    struct FakeServer {
        to_client: wire::UnboundedSender<Result<Message, WsError>>,
        from_client: wire::UnboundedReceiver<Message>,
    }

    impl FakeServer {
        fn reply(&self, text: &str) {
            self.to_client
                .unbounded_send(Ok(Message::Text(text.to_string().into())))
                .unwrap();
        }

        async fn next_frame(&mut self) -> String {
            loop {
                let message = timeout(Duration::from_secs(2), self.from_client.next())
                    .await
                    .expect("timed out waiting for client frame")
                    .expect("client hung up");
                match message {
                    Message::Text(text) => return text.as_str().to_string(),
                    Message::Close(_) => return "<close>".to_string(),
                    _ => continue,
                }
            }
        }

        fn hang_up(&self) {
            self.to_client.close_channel();
        }
    }

    type ClientEnd = (
        wire::UnboundedSender<Message>,
        wire::UnboundedReceiver<Result<Message, WsError>>,
    );

    fn connection() -> (ClientEnd, FakeServer) {
        let (client_tx, server_rx) = wire::unbounded();
        let (server_tx, client_rx) = wire::unbounded();
        (
            (client_tx, client_rx),
            FakeServer {
                to_client: server_tx,
                from_client: server_rx,
            },
        )
    }

    fn test_settings() -> ClientSettings {
        let mut settings = ClientSettings::new("app-1", "token-1");
        settings.client_id = "simsync-test".to_string();
        settings.close_grace = Duration::from_millis(200);
        settings
    }

    fn queue_handshake(server: &FakeServer) {
        server.reply("0:auth:user@example.com");
        server.reply("0:cv:?");
    }

    async fn wait_for_streaming(states: &mut watch::Receiver<ConnectionState>) {
        timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::Streaming),
        )
        .await
        .expect("timed out waiting for streaming")
        .expect("client dropped");
    }

    #[test]
    fn test_build_ws_url() {
        let mut settings = test_settings();

        settings.server_url = "wss://api.example.com".to_string();
        let client = SyncClient::new(settings.clone());
        assert_eq!(
            client.build_ws_url(),
            "wss://api.example.com/sock/1/app-1/websocket"
        );

        settings.server_url = "https://api.example.com/".to_string();
        let client = SyncClient::new(settings.clone());
        assert_eq!(
            client.build_ws_url(),
            "wss://api.example.com/sock/1/app-1/websocket"
        );

        settings.server_url = "http://localhost:8080".to_string();
        let client = SyncClient::new(settings.clone());
        assert_eq!(
            client.build_ws_url(),
            "ws://localhost:8080/sock/1/app-1/websocket"
        );

        settings.server_url = "localhost:8080".to_string();
        let client = SyncClient::new(settings);
        assert_eq!(
            client.build_ws_url(),
            "wss://localhost:8080/sock/1/app-1/websocket"
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = ClientSettings::new("app", "token");
        assert_eq!(settings.server_url, DEFAULT_SERVER_URL);
        assert_eq!(settings.bucket, "note");
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(settings.close_grace, Duration::from_secs(1));
        assert_eq!(settings.index_page_size, 500);
        assert!(settings.client_id.starts_with("simsync-"));
    }

    #[tokio::test]
    async fn test_session_bootstraps_streams_and_shuts_down() {
        let ((sink, stream), mut server) = connection();
        let client = SyncClient::new(test_settings());
        let mut states = client.state();
        let bucket = Bucket::new(Recorder::default()).shared();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[{"id":"a","v":1}]}"#);
        server.reply("0:e:a.1\n{\"data\":{\"content\":\"hello\"}}");

        let session = tokio::spawn({
            let bucket = bucket.clone();
            async move {
                client
                    .run_with(sink, stream, bucket, outgoing_rx, async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let init = server.next_frame().await;
        assert!(init.starts_with("0:init:"));
        let payload: Value = serde_json::from_str(&init["0:init:".len()..]).unwrap();
        assert_eq!(payload["token"], "token-1");
        assert_eq!(payload["app_id"], "app-1");
        assert_eq!(payload["name"], "note");
        assert_eq!(payload["clientid"], "simsync-test");

        assert_eq!(server.next_frame().await, "0:i::::500");
        assert_eq!(server.next_frame().await, "0:e:a.1");

        wait_for_streaming(&mut states).await;
        {
            let bucket = bucket.lock().await;
            assert_eq!(bucket.state().inits, 1);
            assert_eq!(bucket.store().get("a").unwrap().content, "hello");
            assert_eq!(bucket.store().cursor(), "cv-1");
        }

        server.reply(
            r#"0:c:[{"id":"a","o":"M","sv":1,"ev":2,"ccid":"x","v":{"content":{"o":"d","v":"=5\t+ world"}}}]"#,
        );
        server.reply("h:1");

        let outgoing = Change::delete("a");
        outgoing_tx.send(outgoing.clone()).await.unwrap();
        let sent = server.next_frame().await;
        assert!(sent.starts_with("0:c:"));
        let sent: Change = serde_json::from_str(&sent["0:c:".len()..]).unwrap();
        assert_eq!(sent, outgoing);

        timeout(Duration::from_secs(2), async {
            loop {
                if !bucket.lock().await.state().updates.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("broadcast never applied");

        {
            let bucket = bucket.lock().await;
            let entity = bucket.store().get("a").unwrap();
            assert_eq!(entity.version, 2);
            assert_eq!(entity.content, "hello world");
            assert_eq!(bucket.state().updates, vec!["a".to_string()]);
        }

        stop_tx.send(()).unwrap();
        assert_eq!(server.next_frame().await, "<close>");
        server.hang_up();

        let result = session.await.unwrap();
        assert_eq!(result.unwrap(), Disconnect::Interrupted);
        assert_eq!(*states.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_rejected_token_fails_handshake() {
        let ((sink, stream), mut server) = connection();
        let client = SyncClient::new(test_settings());
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        server.reply(r#"0:auth:{"msg":"Token invalid","code":401}"#);

        let result = client
            .run_with(sink, stream, bucket.clone(), outgoing_rx, std::future::pending::<()>())
            .await;

        match result {
            Err(SyncError::HandshakeError(message)) => assert!(message.contains("Token invalid")),
            other => panic!("Expected handshake error, got {:?}", other),
        }
        assert!(server.next_frame().await.starts_with("0:init:"));
        assert_eq!(bucket.lock().await.state().inits, 0);
    }

    #[tokio::test]
    async fn test_connection_closed_during_handshake() {
        let ((sink, stream), server) = connection();
        let client = SyncClient::new(test_settings());
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        server.reply("0:auth:user@example.com");
        server.hang_up();

        let result = client
            .run_with(sink, stream, bucket, outgoing_rx, std::future::pending::<()>())
            .await;
        assert!(matches!(result, Err(SyncError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_index_pages_are_followed() {
        let ((sink, stream), mut server) = connection();
        let client = SyncClient::new(test_settings());
        let mut states = client.state();
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[{"id":"a","v":1}],"mark":"m1"}"#);
        server.reply(r#"0:i:{"current":"cv-2","index":[{"id":"b","v":3}]}"#);
        server.reply("0:e:a.1\n{\"data\":{\"content\":\"first\"}}");
        server.reply("0:e:b.3\n{\"data\":{\"content\":\"second\"}}");

        let session = tokio::spawn({
            let bucket = bucket.clone();
            async move {
                client
                    .run_with(sink, stream, bucket, outgoing_rx, std::future::pending::<()>())
                    .await
            }
        });

        server.next_frame().await;
        assert_eq!(server.next_frame().await, "0:i::::500");
        assert_eq!(server.next_frame().await, "0:i::m1::500");
        assert_eq!(server.next_frame().await, "0:e:a.1");
        assert_eq!(server.next_frame().await, "0:e:b.3");

        wait_for_streaming(&mut states).await;
        {
            let bucket = bucket.lock().await;
            assert_eq!(bucket.store().len(), 2);
            assert_eq!(bucket.store().cursor(), "cv-2");
            assert_eq!(bucket.store().get("b").unwrap().version, 3);
        }

        server.hang_up();
        assert_eq!(session.await.unwrap().unwrap(), Disconnect::RemoteClosed);
    }

    #[tokio::test]
    async fn test_broadcast_during_bootstrap_is_applied_afterwards() {
        let ((sink, stream), server) = connection();
        let client = SyncClient::new(test_settings());
        let mut states = client.state();
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[{"id":"a","v":1}]}"#);
        server.reply(
            r#"0:c:[{"id":"a","o":"M","sv":1,"ev":2,"v":{"content":{"o":"d","v":"=5\t+!"}}}]"#,
        );
        server.reply("0:e:a.1\n{\"data\":{\"content\":\"hello\"}}");

        let session = tokio::spawn({
            let bucket = bucket.clone();
            async move {
                client
                    .run_with(sink, stream, bucket, outgoing_rx, std::future::pending::<()>())
                    .await
            }
        });

        wait_for_streaming(&mut states).await;
        {
            let bucket = bucket.lock().await;
            let entity = bucket.store().get("a").unwrap();
            assert_eq!(entity.content, "hello!");
            assert_eq!(entity.version, 2);
        }

        server.hang_up();
        assert_eq!(session.await.unwrap().unwrap(), Disconnect::RemoteClosed);
    }

    #[tokio::test]
    async fn test_heartbeats_count_up_by_two() {
        let ((sink, stream), mut server) = connection();
        let mut settings = test_settings();
        settings.heartbeat_interval = Duration::from_millis(30);
        let client = SyncClient::new(settings);
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[]}"#);

        let session = tokio::spawn(async move {
            client
                .run_with(sink, stream, bucket, outgoing_rx, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        server.next_frame().await;
        assert_eq!(server.next_frame().await, "0:i::::500");
        assert_eq!(server.next_frame().await, "h:0");
        assert_eq!(server.next_frame().await, "h:2");
        assert_eq!(server.next_frame().await, "h:4");

        stop_tx.send(()).unwrap();
        // No server reply to the close frame: the grace period runs out.
        let result = session.await.unwrap();
        assert_eq!(result.unwrap(), Disconnect::Interrupted);
    }

    #[tokio::test]
    async fn test_queued_changes_go_out_one_frame_each_in_order() {
        let ((sink, stream), mut server) = connection();
        let mut settings = test_settings();
        settings.heartbeat_interval = Duration::from_millis(50);
        let client = SyncClient::new(settings);
        let bucket = Bucket::new(Recorder::default()).shared();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let queued: Vec<Change> = ["a", "b", "c"].into_iter().map(Change::delete).collect();
        for change in &queued {
            outgoing_tx.send(change.clone()).await.unwrap();
        }

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[]}"#);

        let session = tokio::spawn(async move {
            client
                .run_with(sink, stream, bucket, outgoing_rx, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        server.next_frame().await;
        assert_eq!(server.next_frame().await, "0:i::::500");

        let mut sent = Vec::new();
        let mut heartbeats = 0;
        while sent.len() < queued.len() || heartbeats == 0 {
            let frame = server.next_frame().await;
            if frame.starts_with("h:") {
                heartbeats += 1;
                continue;
            }
            let body = frame
                .strip_prefix("0:c:")
                .unwrap_or_else(|| panic!("unexpected frame {}", frame));
            let change: Change = serde_json::from_str(body).unwrap();
            sent.push(change);
        }
        assert_eq!(sent, queued);

        stop_tx.send(()).unwrap();
        assert_eq!(session.await.unwrap().unwrap(), Disconnect::Interrupted);
    }

    #[tokio::test]
    async fn test_malformed_broadcast_ends_connection() {
        let ((sink, stream), server) = connection();
        let client = SyncClient::new(test_settings());
        let mut states = client.state();
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[]}"#);

        let session = tokio::spawn(async move {
            client
                .run_with(sink, stream, bucket, outgoing_rx, std::future::pending::<()>())
                .await
        });

        wait_for_streaming(&mut states).await;
        server.reply("0:c:[{not json");

        let result = session.await.unwrap();
        assert!(matches!(result, Err(SyncError::ProtocolDecodeError(_))));
    }

    #[tokio::test]
    async fn test_bad_delta_while_streaming_ends_connection() {
        let ((sink, stream), server) = connection();
        let client = SyncClient::new(test_settings());
        let mut states = client.state();
        let bucket = Bucket::new(Recorder::default()).shared();
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(1);

        queue_handshake(&server);
        server.reply(r#"0:i:{"current":"cv-1","index":[{"id":"a","v":1}]}"#);
        server.reply("0:e:a.1\n{\"data\":{\"content\":\"hello\"}}");

        let session = tokio::spawn({
            let bucket = bucket.clone();
            async move {
                client
                    .run_with(sink, stream, bucket, outgoing_rx, std::future::pending::<()>())
                    .await
            }
        });

        wait_for_streaming(&mut states).await;
        server.reply(r#"0:c:[{"id":"a","o":"M","ev":2,"v":{"content":{"o":"d","v":"=99"}}}]"#);

        let result = session.await.unwrap();
        assert!(matches!(result, Err(SyncError::DeltaApplyError(_))));
        assert_eq!(bucket.lock().await.store().get("a").unwrap().version, 1);
    }
}
