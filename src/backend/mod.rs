//! Distribution-specific knowledge: where GPU artifacts live and how an
//! NVIDIA driver is activated.

mod macaroni;
mod nvidia;

pub use macaroni::MacaroniBackend;

use crate::error::GpuConfError;
use crate::kernel::SystemInspector;
use crate::system::{KernelModule, NvidiaDriver, NvidiaSetup};
use anyhow::Result;
use std::path::PathBuf;

pub const DEFAULT_BACKEND: &str = "macaroni";

pub trait SystemBackend {
    fn name(&self) -> &str;

    fn egl_external_platforms_dirs(&self) -> Vec<PathBuf>;
    fn vulkan_layers_dirs(&self) -> Vec<PathBuf>;
    fn vulkan_icd_dirs(&self) -> Vec<PathBuf>;

    /// `None` when the distribution ships no GBM backend directory.
    fn gbm_lib_dir(&self) -> Option<PathBuf>;
    fn environment_dir(&self) -> PathBuf;

    /// Directory holding one `nvidia-drivers-<version>` tree per install.
    fn nvidia_install_root(&self) -> PathBuf;

    fn nvidia_drivers(&self) -> Result<Vec<NvidiaDriver>>;
    fn nvidia_kernel_modules(&self, open: bool) -> Result<Vec<KernelModule>>;

    /// Version declared in the environment file, unvalidated. Empty when the
    /// file or the key is missing.
    fn nvidia_driver_active(&self) -> Result<String>;

    fn set_nvidia_version(&self, setup: &NvidiaSetup, version: &str) -> Result<()>;
    fn purge_nvidia_driver(&self, setup: &NvidiaSetup) -> Result<()>;
}

/// Backend for the distribution called `kind`, rooted at `root`.
pub fn new_backend(kind: &str, root: impl Into<PathBuf>) -> Result<Box<dyn SystemBackend>> {
    match kind {
        "macaroni" | "funtoo" => Ok(Box::new(MacaroniBackend::with_inspector(
            kind,
            root,
            Box::new(SystemInspector),
        ))),
        other => Err(GpuConfError::UnknownBackend(other.to_string()).into()),
    }
}
