//! 定义了传输和生命周期运行时的可配置参数。
//! Defines configurable parameters for the transports and the lifecycle runtime.

use std::time::Duration;

/// What happens to an in-flight half-duplex request when its timer expires.
///
/// 半双工请求在计时器到期时的处理策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Fail the request with [`crate::error::Error::Timeout`].
    /// 以超时错误结束请求。
    #[default]
    Fail,
    /// End the response stream quietly. A single-response call yields `None`.
    /// 静默结束响应流。单响应调用返回 `None`。
    Complete,
}

/// Half-duplex client parameters.
///
/// 半双工客户端参数。
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Maximum number of queued (not yet dispatched) requests. New requests
    /// beyond this fail immediately with `QueueFull`.
    /// 排队（尚未发送）请求的最大数量。超出后新请求立即以 `QueueFull` 失败。
    pub max_queue_size: usize,
    /// Delay inserted before each write, for devices that need a gap between
    /// consecutive requests.
    /// 每次写入前插入的延迟，用于需要请求间隔的设备。
    pub communication_interval: Duration,
    /// Timeout behaviour for in-flight requests.
    /// 在途请求的超时行为。
    pub timeout_policy: TimeoutPolicy,
    /// Size of the buffer used for each read from the port.
    /// 每次从端口读取时使用的缓冲区大小。
    pub read_buffer_size: usize,
}

/// Reconnect parameters of the full-duplex client.
///
/// 全双工客户端的重连参数。
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// The backoff unit. The delay before attempt `n` is `n * backoff_unit`.
    /// 退避单位。第 `n` 次尝试之前的延迟为 `n * backoff_unit`。
    pub backoff_unit: Duration,
    /// Maximum number of consecutive failed attempts before the client is
    /// disposed permanently. `None` retries forever.
    /// 客户端被永久释放前允许的最大连续失败次数。`None` 表示无限重试。
    pub max_retries: Option<u32>,
}

/// Full-duplex client parameters.
///
/// 全双工客户端参数。
#[derive(Debug, Clone)]
pub struct SequencedConfig {
    /// Reconnect behaviour.
    /// 重连行为。
    pub reconnect: ReconnectConfig,
    /// Optional upper bound for every request.
    /// 每个请求的可选超时上限。
    pub request_timeout: Option<Duration>,
    /// Capacity of the outbound channel of a connection.
    /// 连接出站通道的容量。
    pub outbound_capacity: usize,
    /// Timeout for establishing a TCP connection.
    /// 建立TCP连接的超时时间。
    pub connect_timeout: Duration,
}

/// Hot-reload controller parameters.
///
/// 热重载控制器参数。
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// How long a caller waits for the first load before falling back to
    /// whatever instance is loaded (possibly none).
    /// 调用者等待首次加载的最长时间，超时后回退到当前已加载的实例（可能为空）。
    pub first_load_wait: Duration,
    /// Whether a failed reload is followed by one more attempt with the
    /// restored configuration.
    /// 重载失败回滚后，是否使用恢复的配置再尝试一次。
    pub retry_after_rollback: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1024,
            communication_interval: Duration::ZERO,
            timeout_policy: TimeoutPolicy::Fail,
            read_buffer_size: 1024,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(2),
            max_retries: None,
        }
    }
}

impl Default for SequencedConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            request_timeout: None,
            outbound_capacity: 128,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            first_load_wait: Duration::from_secs(10),
            retry_after_rollback: true,
        }
    }
}

impl ReconnectConfig {
    /// Linear backoff: the delay before the given attempt.
    /// 线性退避：给定尝试次数之前的延迟。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// Whether `attempts` consecutive failures reached the cap.
    /// 连续失败 `attempts` 次是否已达到上限。
    pub fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_retries, Some(max) if max > 0 && attempts >= max)
    }
}
