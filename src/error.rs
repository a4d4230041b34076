//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use std::sync::Arc;
use thiserror::Error;

/// The primary error type for the collector runtime.
/// 采集运行时的主要错误类型。
///
/// The type is `Clone` so that a single failure (a lost connection, a failed
/// connect attempt) can be delivered to every waiter that shares it.
///
/// 该类型实现了 `Clone`，以便同一个失败可以分发给所有共享它的等待者。
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An underlying I/O error occurred.
    /// 发生了底层的I/O错误。
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection to the device dropped, or the transport stopped while
    /// the request was outstanding.
    /// 与设备的连接已断开，或传输在请求未完成时停止。
    #[error("Connection lost")]
    ConnectionLost,

    /// No response arrived within the request timeout.
    /// 在请求超时时间内没有收到响应。
    #[error("Request to {target} timed out")]
    Timeout { target: String },

    /// The request queue of a half-duplex transport is at capacity.
    /// 半双工传输的请求队列已满。
    #[error("Request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The resource has already been disposed.
    /// 资源已被释放。
    #[error("{0} is closed")]
    AlreadyClosed(String),

    /// Building a replacement instance during a reload failed.
    /// 重载期间构建替换实例失败。
    #[error("Failed to build instance: {0}")]
    BuildFailure(String),

    /// The frame parser rejected inbound data. Non-fatal to the transport.
    /// 帧解析器拒绝了入站数据。对传输而言不是致命错误。
    #[error("Protocol decode failure: {0}")]
    ProtocolDecode(String),

    /// A lifecycle start or stop hook failed.
    /// 生命周期的启动或停止钩子失败。
    #[error("Lifecycle hook failed: {0}")]
    Hook(String),

    /// No instance has been loaded, and none arrived within the wait budget.
    /// 尚未加载实例，并且在等待时间内也没有加载完成。
    #[error("No instance loaded")]
    NotLoaded,

    /// The reconnect loop gave up after the configured number of attempts.
    /// 重连循环在达到配置的尝试次数后放弃。
    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether this error is a request timeout.
    /// 该错误是否为请求超时。
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => std::io::Error::new(e.kind(), e.to_string()),
            Error::ConnectionLost => ErrorKind::ConnectionReset.into(),
            Error::Timeout { .. } => ErrorKind::TimedOut.into(),
            Error::QueueFull { .. } => ErrorKind::WouldBlock.into(),
            Error::AlreadyClosed(_) => ErrorKind::NotConnected.into(),
            Error::BuildFailure(msg) => std::io::Error::other(msg),
            Error::ProtocolDecode(msg) => std::io::Error::new(ErrorKind::InvalidData, msg),
            Error::Hook(msg) => std::io::Error::other(msg),
            Error::NotLoaded => ErrorKind::NotConnected.into(),
            Error::RetriesExhausted { .. } => ErrorKind::ConnectionRefused.into(),
        }
    }
}
