#![deny(clippy::expect_used, clippy::unwrap_used)]

//! A resilient transport and lifecycle runtime for field-device data
//! collection.
//!
//! - [`lifecycle`]: the state machine and start / pause / dispose contract
//!   shared by every runtime.
//! - [`transport`]: a half-duplex single-flight queue for serial buses and a
//!   reconnecting, sequence-correlated client for full-duplex links.
//! - [`reload`]: hot reload of a running instance with rollback.
//!
//! 面向现场设备数据采集的弹性传输与生命周期运行时。
//!
//! - [`lifecycle`]：所有运行时共享的状态机以及启动/暂停/释放约定。
//! - [`transport`]：用于串口总线的半双工单飞队列，以及用于全双工链路的自动重连、
//!   按序列号关联的客户端。
//! - [`reload`]：带回滚的运行实例热重载。

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod reload;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, State};
pub use reload::{HotReload, Loader};
