//! The port task: the only place that touches the reader, the writer and the
//! frame parser of a [`super::SerialClient`].
//!
//! 端口任务：唯一访问 [`super::SerialClient`] 的读端、写端和帧解析器的地方。

use super::{SerialRequest, Shared};
use crate::{error::Error, transport::parser::FrameParser, transport::pending::Emit};
use std::sync::{Arc, atomic::Ordering};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, error, info, trace, warn};

/// Commands handed to the port task.
/// 发送给端口任务的命令。
pub(crate) enum PortCommand {
    /// Write the payload of the request that was just moved in flight.
    Write(Arc<SerialRequest>),
    /// Drop a partially assembled frame.
    ResetParser,
}

pub(crate) struct PortIo {
    pub(crate) reader: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) parser: Box<dyn FrameParser>,
}

pub(crate) struct PortActor {
    shared: Arc<Shared>,
    port: PortIo,
    command_rx: mpsc::UnboundedReceiver<PortCommand>,
    // The request whose payload was last written to the wire.
    written: Option<Arc<SerialRequest>>,
}

impl PortActor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        port: PortIo,
        command_rx: mpsc::UnboundedReceiver<PortCommand>,
    ) -> Self {
        Self {
            shared,
            port,
            command_rx,
            written: None,
        }
    }

    /// Runs the port event loop until the port closes or the client is
    /// disposed.
    ///
    /// 运行端口事件循环，直到端口关闭或客户端被释放。
    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; self.shared.config.read_buffer_size.max(1)];
        loop {
            tokio::select! {
                // 1. Commands from callers and timers.
                // 1. 来自调用者和计时器的命令。
                command = self.command_rx.recv() => match command {
                    Some(PortCommand::Write(request)) => self.write(request).await,
                    Some(PortCommand::ResetParser) => {
                        trace!(path = %self.shared.path, "Resetting frame parser");
                        self.port.parser.reset();
                    }
                    None => break,
                },
                // 2. Bytes from the device.
                // 2. 来自设备的字节。
                read = self.port.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!(path = %self.shared.path, "端口已断开 | Port disconnected");
                        break;
                    }
                    Ok(n) => self.on_data(&buf[..n]),
                    Err(e) => {
                        error!(path = %self.shared.path, error = %e, "Port read failed");
                        break;
                    }
                },
            }
        }

        self.port.parser.close();
        self.command_rx.close();
        while let Ok(command) = self.command_rx.try_recv() {
            if let PortCommand::Write(request) = command {
                request.fail(Error::AlreadyClosed(self.shared.path.clone()));
            }
        }
        if let Err(e) = self.shared.dispose() {
            warn!(path = %self.shared.path, error = %e, "Dispose after port loss failed");
        }
    }

    async fn write(&mut self, request: Arc<SerialRequest>) {
        // Dispatched without a runtime at hand: the clock starts here.
        self.shared.arm_timeout(&request);
        let interval = self.shared.config.communication_interval;
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        // Cancelled or timed out while waiting for its turn.
        let Some(payload) = request.payload() else {
            trace!(path = %self.shared.path, "Request gone before write");
            return;
        };

        trace!(path = %self.shared.path, len = payload.len(), "Writing request");
        let writer = &mut self.port.writer;
        let written = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };
        // A device that stops draining must not hold the port past the
        // request's deadline.
        let written = match request.deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, written).await {
                Ok(written) => written,
                Err(_) => {
                    warn!(path = %self.shared.path, "写入停滞 | Port write stalled past the request deadline");
                    self.shared.on_timeout(&request);
                    return;
                }
            },
            None => written.await,
        };
        if let Err(e) = written {
            error!(path = %self.shared.path, error = %e, "Port write failed");
            request.fail(e.into());
            self.shared.release(&request);
            return;
        }
        self.shared
            .counters
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.written = Some(request);
    }

    fn on_data(&mut self, data: &[u8]) {
        self.shared
            .counters
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let target = self
            .written
            .take()
            .filter(|request| self.shared.in_flight.holds(request));
        let Some(request) = target else {
            warn!(path = %self.shared.path, len = data.len(), "No pending request, discarding data");
            return;
        };

        trace!(path = %self.shared.path, len = data.len(), "Received data");
        self.port.parser.handle(data);
        let mut target = Some(request);
        loop {
            match self.port.parser.next_frame() {
                Ok(Some(frame)) => match target.take() {
                    Some(request) => match request.emit(frame) {
                        Emit::More => target = Some(request),
                        Emit::Done => {
                            self.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                            debug!(path = %self.shared.path, "Request completed");
                            self.shared.release(&request);
                        }
                        Emit::Gone => self.shared.release(&request),
                    },
                    None => {
                        warn!(path = %self.shared.path, len = frame.len(), "Frame arrived after its request completed, discarding");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %self.shared.path, error = %e, "Discarding undecodable frame");
                }
            }
        }
        self.written = target;
    }
}
