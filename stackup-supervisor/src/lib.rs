pub mod events;
pub mod health;
pub mod sampler;
pub mod shutdown;
pub mod state;
pub mod supervisor;

mod runtime;

pub use events::{Bus, Event};
pub use health::{HealthPoller, ProbeOutcome};
pub use sampler::{format_bytes, sparkline, ResourceSample, ResourceSampler, SamplerConfig};
pub use shutdown::{wait_for_shutdown_signal, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_OK};
pub use state::{ServiceState, ServiceStatus};
pub use supervisor::{
    StartOptions, StopOptions, Supervisor, DEFAULT_STOP_TIMEOUT, DEPENDENCY_WAIT_TIMEOUT,
    RESTART_BACKOFF,
};
