#![forbid(unsafe_code)]

//! Supervises the queue workers launched on one compute node.

pub mod checks;
pub mod environment;
pub mod error;
pub mod pool;
pub mod probe;
pub mod signals;
pub mod supervisor;

pub use error::LaunchError;
pub use supervisor::{Collaborators, LaunchOptions, LaunchReport, Phase, StopCause, Supervisor};
