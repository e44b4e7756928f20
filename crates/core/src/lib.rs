#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for the worker launcher: configuration, run context and
//! environment records.

pub mod config;
pub mod env_record;
pub mod error;
pub mod run;

pub use config::{RedisConfig, SjsConfig, WorkerCommandConfig};
pub use env_record::{EnvDifference, EnvironmentSnapshot};
pub use error::{Result, SjsError};
pub use run::{LaunchStamp, RunContext, RUNNING_MARKER};
