use crate::command::{run_capture, single_line};
use anyhow::Result;
use std::path::Path;

/// Kernel module introspection. The analyzer only sees this trait so that
/// scans can run against fixture trees without real module binaries.
pub trait ModuleInspector {
    /// Value of `field` embedded in the module binary at `module`.
    fn modinfo_field(&self, module: &Path, field: &str) -> Result<String>;

    /// Release string of the running kernel.
    fn runtime_kernel_version(&self) -> Result<String>;
}

/// Inspector backed by `modinfo` and `uname`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

impl ModuleInspector for SystemInspector {
    fn modinfo_field(&self, module: &Path, field: &str) -> Result<String> {
        let out = run_capture(
            "modinfo",
            [
                std::ffi::OsStr::new("-F"),
                std::ffi::OsStr::new(field),
                module.as_os_str(),
            ],
        )?;
        Ok(single_line(&out))
    }

    fn runtime_kernel_version(&self) -> Result<String> {
        let out = run_capture("uname", ["-r"])?;
        Ok(single_line(&out))
    }
}
