use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("failed to spawn {0}")]
    Spawn(String),

    #[error("healthcheck for {service} exhausted after {attempts} attempts")]
    HealthcheckExhausted { service: String, attempts: u32 },

    #[error("timed out waiting for dependency {dependency} of {service}")]
    DependencyTimeout { service: String, dependency: String },

    #[error("dependency {dependency} of {service} is {status}")]
    DependencyFailed {
        service: String,
        dependency: String,
        status: String,
    },

    #[error("signal error: {0}")]
    Signal(String),

    #[cfg(unix)]
    #[error("unix error: {0}")]
    Unix(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
