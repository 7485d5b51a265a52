//! Read-only discovery pass building a [`System`] snapshot.

use crate::backend::SystemBackend;
use crate::error::GpuConfError;
use crate::system::{
    ArtifactState, ConfigDirectory, ConfigFile, IcdJson, LayerJson, Library, NvidiaSetup, System,
};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

static JSON_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.json(\.disabled)?$").unwrap());
static SHARED_LIB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.so(\.disabled)?$").unwrap());

pub struct Analyzer {
    backend: Box<dyn SystemBackend>,
}

impl Analyzer {
    pub fn new(backend: Box<dyn SystemBackend>) -> Self {
        Analyzer { backend }
    }

    pub fn backend(&self) -> &dyn SystemBackend {
        self.backend.as_ref()
    }

    /// Scans every location known to the backend.
    ///
    /// Unlistable directories and unreadable files are skipped. Malformed
    /// JSON and failures while probing the NVIDIA setup abort the scan.
    pub fn read(&self) -> Result<System> {
        let backend = self.backend();

        let egl_ext_platform_dirs =
            scan_config_dirs(&backend.egl_external_platforms_dirs(), IcdJson::from_slice)?;
        let vulkan_layers_dirs = scan_config_dirs(&backend.vulkan_layers_dirs(), |data| {
            serde_json::from_slice::<LayerJson>(data)
        })?;
        let vulkan_icd_dirs = scan_config_dirs(&backend.vulkan_icd_dirs(), IcdJson::from_slice)?;
        let gbm_libraries = match backend.gbm_lib_dir() {
            Some(dir) => scan_gbm_libraries(&dir),
            None => Vec::new(),
        };

        let mut nvidia = NvidiaSetup {
            drivers: backend.nvidia_drivers()?,
            ..Default::default()
        };
        let declared = backend.nvidia_driver_active()?;
        if !nvidia.set_active_version(&declared) && !declared.is_empty() {
            warn!(version = %declared, "active nvidia version is not installed");
        }
        nvidia.kernel_modules = backend.nvidia_kernel_modules(false)?;
        nvidia.open_kernel_modules = backend.nvidia_kernel_modules(true)?;

        debug!(
            backend = backend.name(),
            drivers = nvidia.drivers.len(),
            gbm_libs = gbm_libraries.len(),
            "system analyzed"
        );

        Ok(System {
            egl_ext_platform_dirs,
            vulkan_layers_dirs,
            vulkan_icd_dirs,
            gbm_libraries,
            nvidia,
        })
    }
}

/// Lists the regular entries of `dir` whose name matches `re`, sorted.
fn matching_entries(dir: &Path, re: &Regex) -> Option<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), %err, "directory skipped");
            return None;
        }
    };

    let mut files: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            re.is_match(&name).then(|| (name, entry.path()))
        })
        .collect();
    files.sort();
    Some(files)
}

fn scan_config_dirs<T, F>(dirs: &[PathBuf], parse: F) -> Result<Vec<ConfigDirectory<T>>>
where
    F: Fn(&[u8]) -> serde_json::Result<T>,
{
    let mut scanned = Vec::new();

    for dir in dirs {
        let Some(files) = matching_entries(dir, &JSON_FILE_RE) else {
            continue;
        };

        let mut config_dir = ConfigDirectory::new(dir);
        for (name, path) in files {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable file skipped");
                    continue;
                }
            };
            let content = parse(&data).map_err(|source| GpuConfError::Parse {
                path: path.clone(),
                source,
            })?;
            config_dir
                .files
                .insert(name.clone(), ConfigFile::new(&name, Some(content)));
        }
        scanned.push(config_dir);
    }

    Ok(scanned)
}

fn scan_gbm_libraries(dir: &Path) -> Vec<Library> {
    let Some(files) = matching_entries(dir, &SHARED_LIB_RE) else {
        return Vec::new();
    };

    let mut libraries = Vec::new();
    for (file_name, path) in files {
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %path.display(), %err, "library skipped");
                continue;
            }
        };
        let linked_file = if meta.file_type().is_symlink() {
            match fs::read_link(&path) {
                Ok(target) => Some(target),
                Err(err) => {
                    warn!(path = %path.display(), %err, "unresolvable link skipped");
                    continue;
                }
            }
        } else {
            None
        };

        let (name, state) = ArtifactState::from_file_name(&file_name);
        libraries.push(Library {
            name,
            state,
            linked_file,
        });
    }
    libraries
}
