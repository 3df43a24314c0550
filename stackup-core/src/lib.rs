pub mod command;
pub mod config;
pub mod duration;
pub mod error;
pub mod graph;

pub use command::{
    send_signal, split_command, ExitStatus, ServiceCommand, SpawnedChild, StopSignal,
};
pub use config::{
    load_project, ConfigDiff, DependencyEdge, GroupConfig, ProbeSpec, Project, RestartPolicy,
    ServiceColor, ServiceConfig, WaitCondition,
};
pub use config::loader::reload_project;
pub use duration::{parse_duration, parse_duration_ms};
pub use error::{Error, Result};
