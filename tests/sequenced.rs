//! 全双工序列化客户端的集成测试：响应匹配、断线重连与重试上限
//! Integration tests for the sequenced client: response matching, reconnects
//! and the retry cap

pub mod common;

use async_trait::async_trait;
use bytes::Bytes;
use collector_runtime::{
    config::{ReconnectConfig, SequencedConfig},
    error::{Error, Result},
    lifecycle::{Lifecycle, State},
    transport::{
        Connection, ConnectionFactory, DelimiterFrameParser, Incrementing, SequenceStrategy,
        SequencedClient, SequencedCodec, TcpConnector,
    },
};
use common::harness::init_tracing;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
    time::sleep,
};
use tracing::info;

type Frame = (u32, String);

/// The device side of one in-memory connection.
struct DeviceEnd {
    requests: mpsc::Receiver<Frame>,
    responses: mpsc::Sender<Frame>,
}

impl DeviceEnd {
    /// Answers the next request with `re:<body>`.
    async fn answer_next(&mut self) -> Frame {
        let (seq, body) = self.requests.recv().await.unwrap();
        self.responses
            .send((seq, format!("re:{body}")))
            .await
            .unwrap();
        (seq, body)
    }
}

#[derive(Clone)]
struct MockFactory {
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    delay: Duration,
    ends: mpsc::UnboundedSender<DeviceEnd>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Outbound = Frame;
    type Inbound = Frame;

    async fn connect(&self) -> Result<Connection<Frame, Frame>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        let (outbound, requests) = mpsc::channel(16);
        let (responses, inbound) = mpsc::channel(16);
        let _ = self.ends.send(DeviceEnd {
            requests,
            responses,
        });
        Ok(Connection::new(outbound, inbound))
    }
}

#[derive(Default)]
struct FrameCodec {
    login: bool,
    logins: AtomicUsize,
    no_reconnect: bool,
}

#[async_trait]
impl SequencedCodec for FrameCodec {
    type Seq = u32;
    type Request = String;
    type Response = String;
    type Outbound = Frame;
    type Inbound = Frame;

    fn next_sequence(&self, previous: Option<u32>) -> u32 {
        Incrementing.next(previous)
    }

    fn encode(&self, seq: u32, request: String) -> Result<Frame> {
        Ok((seq, request))
    }

    fn decode(&self, (seq, body): Frame) -> Option<(u32, String)> {
        if body.is_empty() {
            return None;
        }
        Some((seq, body))
    }

    async fn after_connect(&self, outbound: &mpsc::Sender<Frame>) -> Result<()> {
        if self.login {
            outbound
                .send((0, "login".to_string()))
                .await
                .map_err(|_| Error::ConnectionLost)?;
            self.logins.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn should_reconnect(&self, _last_error: Option<&Error>) -> bool {
        !self.no_reconnect
    }
}

type Client = SequencedClient<MockFactory, FrameCodec>;

struct Setup {
    client: Arc<Client>,
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    ends: mpsc::UnboundedReceiver<DeviceEnd>,
}

fn setup(codec: FrameCodec, config: SequencedConfig, delay: Duration) -> Setup {
    init_tracing();
    let (ends_tx, ends) = mpsc::unbounded_channel();
    let factory = MockFactory {
        connects: Arc::new(AtomicUsize::new(0)),
        refuse: Arc::new(AtomicBool::new(false)),
        delay,
        ends: ends_tx,
    };
    let connects = factory.connects.clone();
    let refuse = factory.refuse.clone();
    Setup {
        client: Arc::new(SequencedClient::new("meter", factory, codec, config)),
        connects,
        refuse,
        ends,
    }
}

fn spawn_request(
    client: &Arc<Client>,
    body: &str,
) -> tokio::task::JoinHandle<Result<String>> {
    let client = client.clone();
    let body = body.to_string();
    tokio::spawn(async move { client.request(body).await })
}

#[tokio::test]
async fn test_out_of_order_responses_matched_by_sequence() {
    let mut s = setup(FrameCodec::default(), SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();
    assert_eq!(s.client.state(), State::Running);

    let a = spawn_request(&s.client, "a");
    let b = spawn_request(&s.client, "b");
    let first = end.requests.recv().await.unwrap();
    let second = end.requests.recv().await.unwrap();
    assert_ne!(first.0, second.0);

    // Answer in reverse order.
    for (seq, body) in [second, first] {
        end.responses.send((seq, format!("re:{body}"))).await.unwrap();
    }
    assert_eq!(a.await.unwrap().unwrap(), "re:a");
    assert_eq!(b.await.unwrap().unwrap(), "re:b");
    assert_eq!(s.client.outstanding(), 0);
}

#[tokio::test]
async fn test_unknown_sequence_is_discarded() {
    let mut s = setup(FrameCodec::default(), SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();

    let request = spawn_request(&s.client, "ping");
    let (seq, _) = end.requests.recv().await.unwrap();
    end.responses.send((seq + 1000, "stray".into())).await.unwrap();
    // Undecodable message.
    end.responses.send((seq, String::new())).await.unwrap();
    end.responses.send((seq, "pong".into())).await.unwrap();

    assert_eq!(request.await.unwrap().unwrap(), "pong");
    assert_eq!(s.client.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_and_reconnects_once() {
    let mut s = setup(FrameCodec::default(), SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();

    let requests: Vec<_> = ["r1", "r2", "r3"]
        .into_iter()
        .map(|body| spawn_request(&s.client, body))
        .collect();
    for _ in 0..3 {
        end.requests.recv().await.unwrap();
    }
    assert_eq!(s.client.outstanding(), 3);

    info!("Dropping the device end of the connection");
    drop(end);
    for request in requests {
        assert!(matches!(request.await.unwrap(), Err(Error::ConnectionLost)));
    }
    assert_eq!(s.client.outstanding(), 0);
    assert_eq!(s.client.state(), State::ConnectionClosed);

    // First reconnect fires after 1 * 2s.
    sleep(Duration::from_millis(2_100)).await;
    let mut end = s.ends.recv().await.unwrap();
    assert_eq!(s.connects.load(Ordering::SeqCst), 2);
    assert_eq!(s.client.state(), State::Running);
    assert_eq!(s.client.retries(), 0);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 2);

    let request = spawn_request(&s.client, "again");
    end.answer_next().await;
    assert_eq!(request.await.unwrap().unwrap(), "re:again");
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_withdraws_entry() {
    let config = SequencedConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let mut s = setup(FrameCodec::default(), config, Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();

    let request = spawn_request(&s.client, "slow");
    let (seq, _) = end.requests.recv().await.unwrap();
    assert!(matches!(request.await.unwrap(), Err(Error::Timeout { .. })));
    assert_eq!(s.client.outstanding(), 0);

    // A late response finds nobody waiting.
    end.responses.send((seq, "late".into())).await.unwrap();
    let next = spawn_request(&s.client, "next");
    end.answer_next().await;
    assert_eq!(next.await.unwrap().unwrap(), "re:next");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_request_withdraws_entry() {
    let mut s = setup(FrameCodec::default(), SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), s.client.request("ignored".into())).await;
    assert!(abandoned.is_err());
    end.requests.recv().await.unwrap();
    assert_eq!(s.client.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_connect() {
    let mut s = setup(
        FrameCodec::default(),
        SequencedConfig::default(),
        Duration::from_millis(200),
    );
    s.client.start().unwrap();
    let requests: Vec<_> = (0..5)
        .map(|i| spawn_request(&s.client, &format!("q{i}")))
        .collect();

    let mut end = s.ends.recv().await.unwrap();
    for _ in 0..5 {
        end.answer_next().await;
    }
    for (i, request) in requests.into_iter().enumerate() {
        assert_eq!(request.await.unwrap().unwrap(), format!("re:q{i}"));
    }
    assert_eq!(s.connects.load(Ordering::SeqCst), 1);
    assert!(s.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_retry_cap_disposes_client() {
    let config = SequencedConfig {
        reconnect: ReconnectConfig {
            backoff_unit: Duration::from_secs(2),
            max_retries: Some(2),
        },
        ..Default::default()
    };
    let s = setup(FrameCodec::default(), config, Duration::ZERO);
    s.refuse.store(true, Ordering::SeqCst);
    s.client.start().unwrap();

    // Initial attempt, then retries after 2s and 4s.
    sleep(Duration::from_millis(1_900)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 1);
    assert_eq!(s.client.state(), State::ConnectionClosed);
    sleep(Duration::from_secs(5)).await;

    assert_eq!(s.connects.load(Ordering::SeqCst), 3);
    assert!(s.client.is_disposed());
    assert_eq!(s.client.state(), State::Stopped);
    assert!(matches!(
        s.client.last_error(),
        Some(Error::RetriesExhausted { attempts: 2 })
    ));
    assert!(matches!(
        s.client.request("late".into()).await,
        Err(Error::AlreadyClosed(label)) if label == "meter"
    ));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_on_demand_connect_keeps_single_backoff_schedule() {
    let config = SequencedConfig {
        reconnect: ReconnectConfig {
            backoff_unit: Duration::from_secs(2),
            max_retries: Some(3),
        },
        ..Default::default()
    };
    let s = setup(FrameCodec::default(), config, Duration::ZERO);
    s.refuse.store(true, Ordering::SeqCst);
    s.client.start().unwrap();

    // A request during the first backoff connects on demand and fails.
    sleep(Duration::from_secs(1)).await;
    assert!(spawn_request(&s.client, "early").await.unwrap().is_err());
    assert_eq!(s.connects.load(Ordering::SeqCst), 2);

    // The backoff keeps its schedule: retries at 2s and 6s, nothing extra.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 4);
    assert!(!s.client.is_disposed());

    // Third retry at 12s exhausts the cap.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 5);
    assert!(s.client.is_disposed());
    assert!(matches!(
        s.client.last_error(),
        Some(Error::RetriesExhausted { attempts: 3 })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_can_be_declined() {
    let codec = FrameCodec {
        no_reconnect: true,
        ..Default::default()
    };
    let mut s = setup(codec, SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let end = s.ends.recv().await.unwrap();
    drop(end);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 1);
    assert_eq!(s.client.state(), State::ConnectionClosed);
    assert!(!s.client.is_disposed());
    assert!(!s.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_after_connect_runs_on_every_connection() {
    let codec = FrameCodec {
        login: true,
        ..Default::default()
    };
    let mut s = setup(codec, SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();

    let mut end = s.ends.recv().await.unwrap();
    assert_eq!(end.requests.recv().await.unwrap(), (0, "login".to_string()));
    assert_eq!(s.client.codec().logins.load(Ordering::SeqCst), 1);
    drop(end);

    sleep(Duration::from_millis(2_100)).await;
    let mut end = s.ends.recv().await.unwrap();
    assert_eq!(end.requests.recv().await.unwrap(), (0, "login".to_string()));
    assert_eq!(s.client.codec().logins.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_fails_outstanding_requests() {
    let mut s = setup(FrameCodec::default(), SequencedConfig::default(), Duration::ZERO);
    s.client.start().unwrap();
    let mut end = s.ends.recv().await.unwrap();

    let request = spawn_request(&s.client, "pending");
    end.requests.recv().await.unwrap();
    s.client.dispose().unwrap();
    assert!(matches!(request.await.unwrap(), Err(Error::ConnectionLost)));
    assert_eq!(s.client.state(), State::Stopped);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(s.connects.load(Ordering::SeqCst), 1);
}

/// Text lines of the form `<seq>:<body>`.
struct LineCodec;

impl SequencedCodec for LineCodec {
    type Seq = u16;
    type Request = String;
    type Response = String;
    type Outbound = Bytes;
    type Inbound = Bytes;

    fn next_sequence(&self, previous: Option<u16>) -> u16 {
        Incrementing.next(previous)
    }

    fn encode(&self, seq: u16, request: String) -> Result<Bytes> {
        Ok(Bytes::from(format!("{seq}:{request}\n")))
    }

    fn decode(&self, inbound: Bytes) -> Option<(u16, String)> {
        let line = std::str::from_utf8(&inbound).ok()?;
        let (seq, body) = line.split_once(':')?;
        Some((seq.parse().ok()?, body.to_string()))
    }
}

#[tokio::test]
async fn test_tcp_round_trip() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            let (seq, body) = line.split_once(':').unwrap();
            write
                .write_all(format!("{seq}:re-{body}\n").as_bytes())
                .await
                .unwrap();
        }
    });

    let config = SequencedConfig::default();
    let connector = TcpConnector::new(addr.to_string(), &config, || {
        DelimiterFrameParser::lines(256)
    });
    let client = Arc::new(SequencedClient::new("tcp-meter", connector, LineCodec, config));
    client.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request(format!("read{i}")).await })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), format!("re-read{i}"));
    }
    client.dispose().unwrap();
}
