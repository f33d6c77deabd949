//! Compute device selection
//!
//! Models run on the CPU. Requesting an accelerator is accepted and falls back
//! to the CPU with a warning, so the same command line works on any host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MolPropError;

/// Device requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    /// Accelerator if available, CPU otherwise
    Gpu,
}

impl FromStr for DeviceChoice {
    type Err = MolPropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceChoice::Cpu),
            "gpu" | "cuda" => Ok(DeviceChoice::Gpu),
            other => Err(MolPropError::ConfigError(format!(
                "unknown device '{}', expected cpu or gpu",
                other
            ))),
        }
    }
}

/// Device the pipeline actually runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub requested: DeviceChoice,
    /// Worker threads available for parallel fold training
    pub threads: usize,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            requested: DeviceChoice::Cpu,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    /// Resolve a request, falling back to the CPU when no accelerator backend exists
    pub fn resolve(choice: DeviceChoice) -> Self {
        let device = Self {
            requested: choice,
            ..Self::cpu()
        };
        if choice == DeviceChoice::Gpu {
            warn!("no accelerator backend in this build, falling back to cpu");
        }
        info!(device = %device, threads = device.threads, "compute device");
        device
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn is_accelerator(&self) -> bool {
        false
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.requested {
            DeviceChoice::Cpu => write!(f, "cpu"),
            DeviceChoice::Gpu => write!(f, "cpu (gpu requested)"),
        }
    }
}
