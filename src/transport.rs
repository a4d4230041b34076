//! Request/response transports over unreliable, stateful media.
//!
//! - [`serial`]: a half-duplex single-flight queue, one request on the wire at
//!   a time, responses matched by arrival order.
//! - [`sequenced`]: a full-duplex reconnecting client, many requests
//!   outstanding, responses matched by sequence number.
//!
//! 不可靠、有状态介质上的请求/响应传输。
//!
//! - [`serial`]：半双工单飞队列，线路上同一时间只有一个请求，按到达顺序匹配响应。
//! - [`sequenced`]：全双工自动重连客户端，允许多个未完成请求，按序列号匹配响应。

pub mod parser;
pub mod pending;
pub mod sequenced;
pub mod serial;

pub use parser::{DelimiterFrameParser, DirectFrameParser, FrameParser};
pub use pending::{Emit, PendingRequest};
pub use sequenced::{
    Connection, ConnectionFactory, Incrementing, RandomSequence, SequenceStrategy,
    SequencedClient, SequencedCodec, TcpConnector,
};
pub use serial::{ResponseStream, SerialClient, SerialMetrics};
