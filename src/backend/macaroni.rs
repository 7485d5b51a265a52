use super::SystemBackend;
use crate::envfile;
use crate::error::GpuConfError;
use crate::kernel::ModuleInspector;
use crate::system::{ArtifactState, KernelModule, NvidiaDriver, NvidiaSetup, DISABLED_SUFFIX};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const NVIDIA_PREFIX_DIR: &str = "/opt/nvidia";
const NVIDIA_DIR_PREFIX: &str = "nvidia-drivers-";
pub(super) const NVIDIA_ENV_FILE: &str = "09nvidia";
pub(super) const NVIDIA_VERSION_KEY: &str = "NVIDIA_DRIVER_VERSION";
const MODULES_DIR: &str = "/lib/modules";

// Compressed builds are preferred over plain ones.
const MODULE_FILES: [&str; 3] = ["nvidia.ko.zst", "nvidia.ko.xz", "nvidia.ko"];

/// Layout of Macaroni OS. Funtoo shares it under its own name.
pub struct MacaroniBackend {
    name: String,
    root: PathBuf,
    inspector: Box<dyn ModuleInspector>,
}

impl MacaroniBackend {
    pub fn with_inspector(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        inspector: Box<dyn ModuleInspector>,
    ) -> Self {
        MacaroniBackend {
            name: name.into(),
            root: root.into(),
            inspector,
        }
    }

    /// `abs` resolved under the backend root.
    pub(super) fn path(&self, abs: impl AsRef<Path>) -> PathBuf {
        let abs = abs.as_ref();
        self.root.join(abs.strip_prefix("/").unwrap_or(abs))
    }

    fn module_dir(&self, kernel: &str, open: bool) -> PathBuf {
        let dir = self.path(MODULES_DIR).join(kernel).join("video");
        if open {
            dir.join("nvidia-open")
        } else {
            dir
        }
    }

    /// Versions reported by the enabled modules built for the running kernel.
    fn running_kernel_module_versions(&self) -> Result<Vec<String>> {
        let kernel = self.inspector.runtime_kernel_version()?;
        let mut versions = Vec::new();
        for open in [false, true] {
            if let Some((path, ArtifactState::Enabled)) = find_module(&self.module_dir(&kernel, open)) {
                let version = self.inspector.modinfo_field(&path, "version")?;
                if !version.is_empty() {
                    versions.push(version);
                }
            }
        }
        debug!(kernel = %kernel, ?versions, "nvidia modules for running kernel");
        Ok(versions)
    }
}

// Any enabled build wins over a leftover `.disabled` one.
fn find_module(dir: &Path) -> Option<(PathBuf, ArtifactState)> {
    let enabled = MODULE_FILES
        .iter()
        .map(|file| (dir.join(file), ArtifactState::Enabled));
    let disabled = MODULE_FILES.iter().map(|file| {
        (
            dir.join(format!("{file}{DISABLED_SUFFIX}")),
            ArtifactState::Disabled,
        )
    });
    enabled.chain(disabled).find(|(path, _)| path.is_file())
}

fn sorted_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("error on reading directory {}", dir.display()))?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

impl SystemBackend for MacaroniBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn egl_external_platforms_dirs(&self) -> Vec<PathBuf> {
        vec![self.path("/usr/share/egl/egl_external_platform.d")]
    }

    fn vulkan_layers_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.path("/usr/share/vulkan/explicit_layer.d"),
            self.path("/usr/share/vulkan/implicit_layer.d"),
        ]
    }

    fn vulkan_icd_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.path("/usr/share/vulkan/icd.d"),
            self.path("/etc/vulkan/icd.d"),
        ]
    }

    fn gbm_lib_dir(&self) -> Option<PathBuf> {
        Some(self.path("/usr/lib64/gbm"))
    }

    fn environment_dir(&self) -> PathBuf {
        self.path("/etc/env.d")
    }

    fn nvidia_install_root(&self) -> PathBuf {
        self.path(NVIDIA_PREFIX_DIR)
    }

    fn nvidia_drivers(&self) -> Result<Vec<NvidiaDriver>> {
        let prefix = self.nvidia_install_root();
        if !prefix.exists() {
            debug!(path = %prefix.display(), "no nvidia drivers installed");
            return Ok(Vec::new());
        }

        let installed: Vec<(String, PathBuf)> = sorted_dir_names(&prefix)?
            .into_iter()
            .filter_map(|name| {
                let version = name.strip_prefix(NVIDIA_DIR_PREFIX)?.to_string();
                if version.is_empty() {
                    return None;
                }
                Some((version, prefix.join(&name)))
            })
            .collect();
        if installed.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = self.running_kernel_module_versions()?;
        Ok(installed
            .into_iter()
            .map(|(version, path)| NvidiaDriver {
                with_kernel_modules: loaded.contains(&version),
                path,
                version,
            })
            .collect())
    }

    fn nvidia_kernel_modules(&self, open: bool) -> Result<Vec<KernelModule>> {
        let mut modules = Vec::new();

        for kernel in sorted_dir_names(&self.path(MODULES_DIR))? {
            let Some((path, state)) = find_module(&self.module_dir(&kernel, open)) else {
                continue;
            };
            let version = self.inspector.modinfo_field(&path, "version")?;
            if version.is_empty() {
                continue;
            }

            let mut fields = BTreeMap::new();
            fields.insert("version".to_string(), version);
            modules.push(KernelModule {
                path,
                kernel_version: kernel,
                name: if open { "nvidia-open" } else { "nvidia" }.to_string(),
                fields,
                state,
            });
        }

        Ok(modules)
    }

    fn nvidia_driver_active(&self) -> Result<String> {
        let env_file = self.environment_dir().join(NVIDIA_ENV_FILE);
        match fs::read_to_string(&env_file) {
            Ok(content) => Ok(envfile::lookup(&content, NVIDIA_VERSION_KEY).unwrap_or_default()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err)
                .with_context(|| format!("error on reading env file {}", env_file.display())),
        }
    }

    fn set_nvidia_version(&self, setup: &NvidiaSetup, version: &str) -> Result<()> {
        let driver = setup
            .driver(version)
            .ok_or_else(|| GpuConfError::UnknownVersion(version.to_string()))?;
        self.activate_driver(driver)
    }

    fn purge_nvidia_driver(&self, setup: &NvidiaSetup) -> Result<()> {
        self.deactivate_driver(&setup.version_active)
    }
}
