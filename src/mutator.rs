//! Enable/disable/purge of scanned artifacts.
//!
//! Mutators act on a [`System`] snapshot and touch the filesystem only. The
//! snapshot itself is not updated.

use crate::error::GpuConfError;
use crate::system::{ArtifactState, ConfigDirectory, ConfigFile, Library, System};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::info;

/// GBM backend library shipped by the NVIDIA driver.
pub const NVIDIA_GBM_LIBRARY: &str = "nvidia-drm_gbm.so";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enable,
    Disable,
    /// Removes the artifact in whichever state it is.
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    AlreadyEnabled,
    Enabled,
    AlreadyDisabled,
    Disabled,
    Removed,
    NotPresent,
    Linked,
}

impl Outcome {
    /// Whether the filesystem was modified.
    pub fn changed(self) -> bool {
        matches!(
            self,
            Outcome::Enabled | Outcome::Disabled | Outcome::Removed | Outcome::Linked
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Outcome::AlreadyEnabled => "already enabled, nothing to do",
            Outcome::Enabled => "enabled",
            Outcome::AlreadyDisabled => "not present or already disabled, nothing to do",
            Outcome::Disabled => "disabled",
            Outcome::Removed => "removed",
            Outcome::NotPresent => "not present, nothing to do",
            Outcome::Linked => "linked",
        };
        f.write_str(msg)
    }
}

pub fn egl_loader(system: &System, name: &str, action: Action) -> Result<Outcome> {
    apply_config_file(system.egl_loader(name), name, action)
}

pub fn vulkan_icd_file(system: &System, name: &str, action: Action) -> Result<Outcome> {
    apply_config_file(system.vulkan_icd_file(name), name, action)
}

pub fn vulkan_layers_file(system: &System, name: &str, action: Action) -> Result<Outcome> {
    apply_config_file(system.vulkan_layer_file(name), name, action)
}

fn apply_config_file<T>(
    found: Option<(&ConfigDirectory<T>, &ConfigFile<T>)>,
    name: &str,
    action: Action,
) -> Result<Outcome> {
    let Some((dir, file)) = found else {
        return match action {
            Action::Purge => Ok(Outcome::NotPresent),
            _ => Err(GpuConfError::NotFound(name.to_string()).into()),
        };
    };
    toggle(&dir.path, &file.name, file.state, action)
}

/// Renames or removes `<dir>/<name>` currently in `state`.
fn toggle(dir: &Path, name: &str, state: ArtifactState, action: Action) -> Result<Outcome> {
    let current = dir.join(state.file_name(name));

    let (wanted, outcome) = match (action, state) {
        (Action::Enable, ArtifactState::Enabled) => return Ok(Outcome::AlreadyEnabled),
        (Action::Disable, ArtifactState::Disabled) => return Ok(Outcome::AlreadyDisabled),
        (Action::Enable, ArtifactState::Disabled) => (ArtifactState::Enabled, Outcome::Enabled),
        (Action::Disable, ArtifactState::Enabled) => (ArtifactState::Disabled, Outcome::Disabled),
        (Action::Purge, _) => {
            fs::remove_file(&current)
                .with_context(|| format!("error on removing {}", current.display()))?;
            info!(path = %current.display(), "removed");
            return Ok(Outcome::Removed);
        }
    };

    let target = dir.join(wanted.file_name(name));
    fs::rename(&current, &target).with_context(|| {
        format!(
            "error on renaming {} to {}",
            current.display(),
            target.display()
        )
    })?;
    info!(from = %current.display(), to = %target.display(), "renamed");
    Ok(outcome)
}

/// Toggles the NVIDIA GBM backend library in `gbm_dir`. Enabling a library
/// that is not there yet links it from the active driver.
pub fn nvidia_gbm_library(system: &System, gbm_dir: &Path, action: Action) -> Result<Outcome> {
    let Some(driver) = system.nvidia.active_driver() else {
        bail!("no active NVIDIA driver version available, check that the driver package is installed");
    };

    match (system.gbm_library(NVIDIA_GBM_LIBRARY), action) {
        (None, Action::Enable) => {
            let source = driver.path.join("lib64").join(NVIDIA_GBM_LIBRARY);
            let link = gbm_dir.join(NVIDIA_GBM_LIBRARY);
            fs::create_dir_all(gbm_dir)
                .with_context(|| format!("error on create dir {}", gbm_dir.display()))?;
            symlink(&source, &link).with_context(|| {
                format!("error on create symlink on {}", link.display())
            })?;
            info!(source = %source.display(), link = %link.display(), "linked");
            Ok(Outcome::Linked)
        }
        (None, Action::Disable) => Ok(Outcome::AlreadyDisabled),
        (None, Action::Purge) => Ok(Outcome::NotPresent),
        (Some(Library { name, state, .. }), action) => toggle(gbm_dir, name, *state, action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{IcdDirectory, NvidiaDriver, NvidiaSetup};
    use tempfile::TempDir;

    fn system_with(dir: &Path, file_name: &str) -> System {
        let mut icd: IcdDirectory = ConfigDirectory::new(dir);
        icd.files
            .insert(file_name.to_string(), ConfigFile::new(file_name, None));
        System {
            vulkan_icd_dirs: vec![icd],
            ..Default::default()
        }
    }

    #[test]
    fn disable_renames_and_repeats_as_noop() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("nvidia_icd.json"), "{}").unwrap();

        let system = system_with(tmp.path(), "nvidia_icd.json");
        let outcome = vulkan_icd_file(&system, "nvidia_icd.json", Action::Disable).unwrap();
        assert_eq!(outcome, Outcome::Disabled);
        assert!(outcome.changed());
        assert!(tmp.path().join("nvidia_icd.json.disabled").exists());

        let system = system_with(tmp.path(), "nvidia_icd.json.disabled");
        let outcome = vulkan_icd_file(&system, "nvidia_icd.json", Action::Disable).unwrap();
        assert_eq!(outcome, Outcome::AlreadyDisabled);
        assert!(!outcome.changed());
    }

    #[test]
    fn missing_file_is_an_error_unless_purging() {
        let system = System::default();
        let err = egl_loader(&system, "10_nvidia_wayland.json", Action::Enable).unwrap_err();
        assert_eq!(err.to_string(), "10_nvidia_wayland.json not found");
        assert_eq!(
            egl_loader(&system, "10_nvidia_wayland.json", Action::Purge).unwrap(),
            Outcome::NotPresent
        );
    }

    #[test]
    fn purge_removes_disabled_form() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("nvidia_icd.json.disabled"), "{}").unwrap();
        let system = system_with(tmp.path(), "nvidia_icd.json.disabled");

        let outcome = vulkan_icd_file(&system, "nvidia_icd.json", Action::Purge).unwrap();
        assert_eq!(outcome, Outcome::Removed);
        assert!(!tmp.path().join("nvidia_icd.json.disabled").exists());
    }

    #[test]
    fn gbm_library_requires_active_driver() {
        let tmp = TempDir::new().unwrap();
        let err = nvidia_gbm_library(&System::default(), tmp.path(), Action::Enable).unwrap_err();
        assert!(err.to_string().contains("no active NVIDIA driver"));
    }

    #[test]
    fn gbm_library_is_linked_from_active_driver() {
        let tmp = TempDir::new().unwrap();
        let driver_path = tmp.path().join("opt/nvidia/nvidia-drivers-535.129.03");
        let mut nvidia = NvidiaSetup {
            drivers: vec![NvidiaDriver {
                path: driver_path.clone(),
                version: "535.129.03".into(),
                with_kernel_modules: false,
            }],
            ..Default::default()
        };
        nvidia.set_active_version("535.129.03");
        let system = System {
            nvidia,
            ..Default::default()
        };

        let gbm_dir = tmp.path().join("usr/lib64/gbm");
        let outcome = nvidia_gbm_library(&system, &gbm_dir, Action::Enable).unwrap();
        assert_eq!(outcome, Outcome::Linked);
        assert_eq!(
            fs::read_link(gbm_dir.join(NVIDIA_GBM_LIBRARY)).unwrap(),
            driver_path.join("lib64").join(NVIDIA_GBM_LIBRARY)
        );

        assert_eq!(
            nvidia_gbm_library(&system, &gbm_dir, Action::Purge).unwrap(),
            Outcome::NotPresent
        );
    }
}
