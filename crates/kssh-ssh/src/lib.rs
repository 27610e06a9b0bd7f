pub mod client;
pub mod config;

pub use client::{SshClient, SshSession, SshShell};
pub use config::{HostKeyPolicy, SshConnectConfig, Target, TargetError};
