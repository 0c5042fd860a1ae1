//! Embedded MQTT 3.1.1 broker over TCP.
//!
//! One task per socket. Each task reads frames, answers control packets
//! itself and raises [`BrokerHooks`] events; outbound traffic from other
//! tasks reaches the socket through a bounded per-session queue.

use super::{Broker, BrokerClient, BrokerHooks, SessionId};
use crate::config::GeneralConfig;
use crate::error::{GatewayError, Result};
use crate::mqtt::{
    encode_connack, encode_pingresp, encode_puback, encode_pubcomp, encode_publish,
    encode_pubrec, encode_suback, encode_unsuback, frame_length, parse_packet, MqttPacket,
    ParsedConnect, ParsedPublish, ParsedSubscribe, TopicMatcher,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Time a new socket gets to send its CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 4096;

// ============================================================================
// Session
// ============================================================================

/// One and a half times the client's keep-alive; `None` when disabled.
fn keep_alive_window(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500))
}

/// A connected MQTT client.
pub struct Session {
    id: SessionId,
    client_id: String,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    subscriptions: Mutex<Vec<String>>,
    close_reason: Mutex<Option<String>>,
    closed: Notify,
    matcher: TopicMatcher,
    /// Idle time after which the peer is considered gone
    keep_alive: Option<Duration>,
}

impl Session {
    fn new(
        id: SessionId,
        connect: &ParsedConnect,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let client_id = if connect.client_id.is_empty() {
            id.to_string()
        } else {
            connect.client_id.clone()
        };

        Self {
            id,
            client_id,
            remote_addr,
            outbound,
            subscriptions: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
            closed: Notify::new(),
            matcher: TopicMatcher::new(),
            keep_alive: keep_alive_window(connect.keep_alive),
        }
    }

    /// Whether any of this session's filters matches `topic`
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|filter| self.matcher.matches(topic, filter))
    }

    fn subscribe(&self, filter: &str) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|f| f == filter) {
            subscriptions.push(filter.to_string());
        }
    }

    fn unsubscribe(&self, filter: &str) {
        self.subscriptions.lock().retain(|f| f != filter);
    }

    fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| {
            GatewayError::Delivery(format!("{} outbound queue: {}", self.id, e))
        })
    }
}

impl BrokerClient for Session {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.to_string()
    }

    fn forward(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.enqueue(encode_publish(topic, payload)?)
    }

    fn close(&self, reason: Option<&str>) {
        if let Some(reason) = reason {
            *self.close_reason.lock() = Some(reason.to_string());
        }
        self.closed.notify_one();
    }
}

// ============================================================================
// Broker
// ============================================================================

struct BrokerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_session: AtomicU64,
    max_packet_size: usize,
    client_buffer: usize,
    log_packets: bool,
}

/// TCP MQTT broker; cheap to clone.
#[derive(Clone)]
pub struct EmbeddedBroker {
    inner: Arc<BrokerInner>,
}

impl EmbeddedBroker {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, general: &GeneralConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            inner: Arc::new(BrokerInner {
                listener,
                local_addr,
                sessions: DashMap::new(),
                next_session: AtomicU64::new(1),
                max_packet_size: general.max_packet_size,
                client_buffer: general.client_buffer,
                log_packets: general.log_packets,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of sockets past CONNECT
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Accept clients until the task is dropped.
    pub async fn serve(&self, hooks: Arc<dyn BrokerHooks>) -> Result<()> {
        info!(addr = %self.inner.local_addr, "MQTT broker listening");

        loop {
            let (stream, peer) = match self.inner.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let inner = Arc::clone(&self.inner);
            let hooks = Arc::clone(&hooks);
            tokio::spawn(async move {
                if let Err(e) = run_socket(inner, hooks, stream, peer).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

impl BrokerInner {
    fn route(&self, topic: &str, payload: &[u8]) -> Result<usize> {
        let frame = encode_publish(topic, payload)?;
        let mut delivered = 0;

        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_subscribed(topic) {
                continue;
            }
            match session.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(error = %e, "Dropping message for slow subscriber"),
            }
        }

        Ok(delivered)
    }
}

impl Broker for EmbeddedBroker {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let delivered = self.inner.route(topic, payload)?;
        trace!(topic = %topic, delivered, "Broker publish");
        Ok(())
    }
}

// ============================================================================
// Per-socket task
// ============================================================================

enum Flow {
    Continue,
    Disconnect,
}

async fn run_socket<S>(
    inner: Arc<BrokerInner>,
    hooks: Arc<dyn BrokerHooks>,
    stream: S,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = Vec::with_capacity(READ_CHUNK);

    let connect = tokio::time::timeout(
        CONNECT_TIMEOUT,
        read_connect(&mut reader, &mut buf, inner.max_packet_size),
    )
    .await
    .map_err(|_| GatewayError::Protocol("timed out waiting for CONNECT".to_string()))??;

    // A persistent session needs an identifier to be resumed by
    if connect.client_id.is_empty() && !connect.clean_session {
        writer.write_all(&encode_connack(false)?).await?;
        let _ = writer.shutdown().await;
        return Err(GatewayError::Protocol(
            "empty client identifier without clean session".to_string(),
        ));
    }

    let id = SessionId(inner.next_session.fetch_add(1, Ordering::Relaxed));
    let (tx, mut rx) = mpsc::channel(inner.client_buffer);
    let session = Arc::new(Session::new(id, &connect, peer, tx));

    writer.write_all(&encode_connack(true)?).await?;
    inner.sessions.insert(id, Arc::clone(&session));

    debug!(
        session = %id,
        client_id = %session.client_id,
        peer = %peer,
        protocol_version = connect.protocol_version,
        clean_session = connect.clean_session,
        username = ?connect.username,
        keep_alive = connect.keep_alive,
        "Client connected"
    );

    let client: Arc<dyn BrokerClient> = session.clone();
    hooks.client_accepted(Arc::clone(&client));
    {
        let hooks = Arc::clone(&hooks);
        let client = Arc::clone(&client);
        tokio::spawn(async move { hooks.client_connected(client).await });
    }

    let result = session_loop(&inner, &hooks, &session, &mut reader, &mut writer, &mut rx, buf).await;

    inner.sessions.remove(&id);
    let _ = writer.shutdown().await;

    if let Some(reason) = session.close_reason.lock().take() {
        info!(session = %id, reason = %reason, "Session closed");
    }

    hooks.client_disconnecting(Arc::clone(&client)).await;
    hooks.client_disconnected(client).await;

    result
}

async fn read_connect<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_packet_size: usize,
) -> Result<ParsedConnect>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some(len) = frame_length(buf, max_packet_size)? {
            let frame: Vec<u8> = buf.drain(..len).collect();
            return match parse_packet(&frame)? {
                MqttPacket::Connect(connect) => Ok(connect),
                other => Err(GatewayError::Protocol(format!(
                    "expected CONNECT, got {:?}",
                    other
                ))),
            };
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "connection closed before CONNECT".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn session_loop<R, W>(
    inner: &BrokerInner,
    hooks: &Arc<dyn BrokerHooks>,
    session: &Arc<Session>,
    reader: &mut R,
    writer: &mut W,
    rx: &mut mpsc::Receiver<Vec<u8>>,
    mut buf: Vec<u8>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut idle_deadline = Instant::now() + session.keep_alive.unwrap_or_default();

    loop {
        // Frames that arrived together with CONNECT
        while let Some(len) = frame_length(&buf, inner.max_packet_size)? {
            let frame: Vec<u8> = buf.drain(..len).collect();
            let packet = parse_packet(&frame)?;
            if let Flow::Disconnect = handle_packet(inner, hooks, session, writer, packet).await? {
                return Ok(());
            }
        }

        tokio::select! {
            _ = session.closed.notified() => return Ok(()),
            _ = tokio::time::sleep_until(idle_deadline), if session.keep_alive.is_some() => {
                info!(session = %session.id, "Keep-alive expired, closing session");
                return Ok(());
            }
            Some(frame) = rx.recv() => writer.write_all(&frame).await?,
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(window) = session.keep_alive {
                    idle_deadline = Instant::now() + window;
                }
            }
        }
    }
}

async fn handle_packet<W>(
    inner: &BrokerInner,
    hooks: &Arc<dyn BrokerHooks>,
    session: &Arc<Session>,
    writer: &mut W,
    packet: MqttPacket,
) -> Result<Flow>
where
    W: AsyncWrite + Unpin + Send,
{
    if inner.log_packets {
        trace!(session = %session.id, packet = ?packet, "Inbound packet");
    }

    match packet {
        MqttPacket::Connect(_) => {
            return Err(GatewayError::Protocol("second CONNECT on session".to_string()));
        }

        MqttPacket::Publish(publish) => handle_publish(inner, hooks, session, writer, publish).await?,

        MqttPacket::Pubrel(pid) => writer.write_all(&encode_pubcomp(pid)?).await?,

        MqttPacket::Subscribe(subscribe) => {
            let reply = handle_subscribe(hooks, session, &subscribe)?;
            writer.write_all(&reply).await?;
        }

        MqttPacket::Unsubscribe(unsubscribe) => {
            for topic in &unsubscribe.topics {
                session.unsubscribe(topic);
            }
            writer.write_all(&encode_unsuback(unsubscribe.packet_id)?).await?;
        }

        MqttPacket::PingReq => writer.write_all(&encode_pingresp()?).await?,

        MqttPacket::Disconnect => return Ok(Flow::Disconnect),

        MqttPacket::Other(kind) => {
            debug!(session = %session.id, packet = ?kind, "Ignoring client packet");
        }
    }

    Ok(Flow::Continue)
}

async fn handle_publish<W>(
    inner: &BrokerInner,
    hooks: &Arc<dyn BrokerHooks>,
    session: &Arc<Session>,
    writer: &mut W,
    publish: ParsedPublish,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if !session.matcher.is_valid_topic(&publish.topic) {
        return Err(GatewayError::Protocol(format!(
            "invalid topic name in PUBLISH: {:?}",
            publish.topic
        )));
    }

    let authorized = hooks.authorize_publish(session.as_ref(), &publish.topic, &publish.payload);

    // Acknowledge regardless so the client does not retransmit a denied message
    match (publish.qos, publish.packet_id) {
        (1, Some(pid)) => writer.write_all(&encode_puback(pid)?).await?,
        (2, Some(pid)) => writer.write_all(&encode_pubrec(pid)?).await?,
        _ => {}
    }

    if !authorized {
        return Ok(());
    }

    inner.route(&publish.topic, &publish.payload)?;

    let client: Arc<dyn BrokerClient> = session.clone();
    hooks.published(publish, client).await;
    Ok(())
}

fn handle_subscribe(
    hooks: &Arc<dyn BrokerHooks>,
    session: &Session,
    subscribe: &ParsedSubscribe,
) -> Result<Vec<u8>> {
    let granted: Vec<Option<u8>> = subscribe
        .subscriptions
        .iter()
        .map(|sub| {
            let filter = sub.topic_filter.as_str();
            if !session.matcher.is_valid_filter(filter) || !hooks.authorize_subscribe(session, filter) {
                return None;
            }
            session.subscribe(filter);
            Some(0)
        })
        .collect();

    encode_suback(subscribe.packet_id, &granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingHooks {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }

        fn record(&self, event: &'static str) {
            self.events.lock().push(event);
        }
    }

    #[async_trait]
    impl BrokerHooks for RecordingHooks {
        fn client_accepted(&self, _client: Arc<dyn BrokerClient>) {
            self.record("accepted");
        }

        async fn client_connected(&self, _client: Arc<dyn BrokerClient>) {
            self.record("connected");
        }

        async fn client_disconnecting(&self, _client: Arc<dyn BrokerClient>) {
            self.record("disconnecting");
        }

        async fn client_disconnected(&self, _client: Arc<dyn BrokerClient>) {
            self.record("disconnected");
        }

        async fn published(&self, _packet: ParsedPublish, _client: Arc<dyn BrokerClient>) {
            self.record("published");
        }

        fn authorize_publish(&self, _client: &dyn BrokerClient, _topic: &str, _payload: &[u8]) -> bool {
            true
        }

        fn authorize_subscribe(&self, _client: &dyn BrokerClient, _topic: &str) -> bool {
            true
        }
    }

    /// MQTT 3.1.1 CONNECT with the given keep-alive, connect flags and identifier
    fn connect_frame(keep_alive: u16, flags: u8, client_id: &str) -> Vec<u8> {
        let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, flags];
        body.extend_from_slice(&keep_alive.to_be_bytes());
        body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        body.extend_from_slice(client_id.as_bytes());

        let mut frame = vec![0x10, body.len() as u8];
        frame.extend(body);
        frame
    }

    struct Harness {
        broker: EmbeddedBroker,
        hooks: Arc<RecordingHooks>,
        client: DuplexStream,
        task: JoinHandle<Result<()>>,
    }

    async fn open(first_write: &[u8]) -> Harness {
        let broker = EmbeddedBroker::bind("127.0.0.1:0", &GeneralConfig::default())
            .await
            .unwrap();
        let hooks = Arc::new(RecordingHooks::default());
        let (mut client, server) = tokio::io::duplex(4096);

        let task = tokio::spawn(run_socket(
            Arc::clone(&broker.inner),
            hooks.clone(),
            server,
            "127.0.0.1:40000".parse().unwrap(),
        ));

        client.write_all(first_write).await.unwrap();
        Harness {
            broker,
            hooks,
            client,
            task,
        }
    }

    async fn expect_bytes(client: &mut DuplexStream, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_expiry_ends_session() {
        let mut h = open(&connect_frame(2, 0x02, "test")).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x00]).await;
        assert_eq!(h.broker.session_count(), 1);

        // Peer goes silent without closing the socket
        h.task.await.unwrap().unwrap();

        assert_eq!(h.broker.session_count(), 0);
        let events = h.hooks.events();
        assert!(events.contains(&"disconnecting"));
        assert!(events.contains(&"disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_resets_keep_alive() {
        let mut h = open(&connect_frame(2, 0x02, "test")).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x00]).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            h.client.write_all(&[0xC0, 0x00]).await.unwrap();
            expect_bytes(&mut h.client, &[0xD0, 0x00]).await;
        }

        assert_eq!(h.broker.session_count(), 1);
        assert!(!h.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_keep_alive_never_expires() {
        let mut h = open(&connect_frame(0, 0x02, "test")).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x00]).await;

        let waited = tokio::time::timeout(Duration::from_secs(3600), &mut h.task).await;
        assert!(waited.is_err());
        assert_eq!(h.broker.session_count(), 1);
    }

    #[tokio::test]
    async fn test_accept_precedes_early_disconnect() {
        let mut first_write = connect_frame(60, 0x02, "test");
        first_write.extend_from_slice(&[0xE0, 0x00]);

        let mut h = open(&first_write).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x00]).await;
        h.task.await.unwrap().unwrap();

        let events = h.hooks.events();
        assert_eq!(events.first(), Some(&"accepted"));
        let accepted = events.iter().position(|e| *e == "accepted").unwrap();
        let disconnecting = events.iter().position(|e| *e == "disconnecting").unwrap();
        assert!(accepted < disconnecting);
        assert_eq!(h.broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_identifier_needs_clean_session() {
        let mut h = open(&connect_frame(60, 0x00, "")).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x02]).await;

        assert!(h.task.await.unwrap().is_err());
        assert!(h.hooks.events().is_empty());
        assert_eq!(h.broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_wildcard_publish_ends_session() {
        let mut first_write = connect_frame(60, 0x02, "test");
        // PUBLISH "a/#" with an empty payload
        first_write.extend_from_slice(&[0x30, 0x05, 0x00, 0x03, b'a', b'/', b'#']);

        let mut h = open(&first_write).await;
        expect_bytes(&mut h.client, &[0x20, 0x02, 0x00, 0x00]).await;

        assert!(h.task.await.unwrap().is_err());
        assert!(!h.hooks.events().contains(&"published"));
    }
}
