//! Run orchestration: device leasing and step-list execution.

pub mod devices;
pub mod executor;

pub use devices::{DeviceLease, DevicePool};
pub use executor::{ExecutionStats, PipelineExecutor, RunOutput};
