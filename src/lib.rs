//! Discovery and toggling of GPU driver integration artifacts: EGL external
//! platform loaders, Vulkan ICD and layer manifests, GBM backend libraries
//! and proprietary NVIDIA driver installs.

pub mod analyzer;
pub mod backend;
pub mod command;
pub mod config;
pub mod envfile;
pub mod error;
pub mod kernel;
pub mod mutator;
pub mod pci;
pub mod summary;
pub mod system;

pub use analyzer::Analyzer;
pub use error::GpuConfError;
pub use system::System;
