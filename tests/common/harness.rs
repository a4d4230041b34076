//! tests/common/harness.rs
use collector_runtime::{
    error::{Error, Result},
    lifecycle::{LifecycleController, LifecycleCore, LifecycleHooks},
};
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "collector_runtime=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::FULL)
            .with_test_writer()
            .init();
    });
}

/// A device runtime that records the configuration it was built from.
#[derive(Debug)]
pub struct Device {
    pub config: String,
    pub fail_start: bool,
}

impl LifecycleHooks for Device {
    fn start0(&self, _core: &LifecycleCore) -> Result<()> {
        if self.fail_start {
            return Err(Error::Hook(format!("device {} refused to start", self.config)));
        }
        Ok(())
    }
}

pub type DeviceRuntime = LifecycleController<Device>;

pub fn device(config: &str, fail_start: bool) -> DeviceRuntime {
    LifecycleController::new(
        format!("device-{config}"),
        Device {
            config: config.to_string(),
            fail_start,
        },
    )
}
