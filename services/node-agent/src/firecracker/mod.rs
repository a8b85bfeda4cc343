//! Firecracker microVM runtime.
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: API payloads (machine, boot source, drives, network)
//! - `runtime`: the [`Runtime`](crate::runtime::Runtime) implementation
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

mod api;
mod config;
mod runtime;

pub use api::{ApiError, FirecrackerClient};
pub use config::{BootSource, DriveConfig, MachineConfig, NetworkInterface, RateLimiter, VmConfig};
pub use runtime::{FirecrackerRuntime, FirecrackerRuntimeConfig};
