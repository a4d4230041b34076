//! Connections and the factories that open them.
//!
//! 连接以及打开连接的工厂。

use crate::{
    config::SequencedConfig,
    error::{Error, Result},
    transport::parser::FrameParser,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, trace, warn};

/// An open connection: messages to the device and messages from it.
///
/// The connection is considered dropped once `inbound` yields `None` or
/// `outbound` refuses a message.
///
/// 一个已打开的连接：发往设备的消息和来自设备的消息。当 `inbound` 返回 `None`
/// 或 `outbound` 拒绝消息时，连接被视为已断开。
#[derive(Debug)]
pub struct Connection<O, I> {
    pub outbound: mpsc::Sender<O>,
    pub inbound: mpsc::Receiver<I>,
}

impl<O, I> Connection<O, I> {
    pub fn new(outbound: mpsc::Sender<O>, inbound: mpsc::Receiver<I>) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens connections for a [`super::SequencedClient`].
///
/// 为 [`super::SequencedClient`] 打开连接。
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Outbound: Send + 'static;
    type Inbound: Send + 'static;

    /// Opens a new connection.
    /// 打开一个新连接。
    async fn connect(&self) -> Result<Connection<Self::Outbound, Self::Inbound>>;
}

type ParserFactory<P> = Arc<dyn Fn() -> P + Send + Sync>;

/// A [`ConnectionFactory`] over TCP. Inbound bytes are framed with a fresh
/// parser per connection.
///
/// 基于TCP的 [`ConnectionFactory`]。每个连接使用新的解析器对入站字节分帧。
pub struct TcpConnector<P> {
    addr: String,
    connect_timeout: Duration,
    capacity: usize,
    parser: ParserFactory<P>,
}

impl<P: FrameParser> TcpConnector<P> {
    pub fn new(
        addr: impl Into<String>,
        config: &SequencedConfig,
        parser: impl Fn() -> P + Send + Sync + 'static,
    ) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: config.connect_timeout,
            capacity: config.outbound_capacity.max(1),
            parser: Arc::new(parser),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl<P> std::fmt::Debug for TcpConnector<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl<P: FrameParser> ConnectionFactory for TcpConnector<P> {
    type Outbound = Bytes;
    type Inbound = Bytes;

    async fn connect(&self) -> Result<Connection<Bytes, Bytes>> {
        let stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str()))
                .await
            {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(Error::Timeout {
                        target: self.addr.clone(),
                    });
                }
            };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(self.capacity);
        let (inbound_tx, inbound) = mpsc::channel::<Bytes>(self.capacity);
        let mut parser = (self.parser)();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(%peer, error = %e, "TCP write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            'read: loop {
                let n = tokio::select! {
                    _ = inbound_tx.closed() => break,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            debug!(%peer, error = %e, "TCP read failed");
                            break;
                        }
                    },
                };
                trace!(%peer, len = n, "TCP data received");
                parser.handle(&buf[..n]);
                loop {
                    match parser.next_frame() {
                        Ok(Some(frame)) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => warn!(%peer, error = %e, "Discarding undecodable frame"),
                    }
                }
            }
            parser.close();
            debug!(%peer, "TCP reader finished");
        });

        debug!(%peer, "TCP connection established");
        Ok(Connection::new(outbound, inbound))
    }
}
