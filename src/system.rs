//! In-memory model of the GPU-related artifacts installed on the host.
//!
//! A [`System`] is produced by [`crate::analyzer::Analyzer::read`] and never
//! updated afterwards: mutations happen on the filesystem and the next
//! invocation scans again.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Suffix that marks a disabled artifact on disk.
pub const DISABLED_SUFFIX: &str = ".disabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    #[default]
    Enabled,
    Disabled,
}

impl ArtifactState {
    /// Splits an on-disk file name into its logical name and state.
    pub fn from_file_name(file_name: &str) -> (String, Self) {
        match file_name.strip_suffix(DISABLED_SUFFIX) {
            Some(stem) => (stem.to_string(), ArtifactState::Disabled),
            None => (file_name.to_string(), ArtifactState::Enabled),
        }
    }

    /// On-disk file name for the logical `name` in this state.
    pub fn file_name(self, name: &str) -> String {
        match self {
            ArtifactState::Enabled => name.to_string(),
            ArtifactState::Disabled => format!("{name}{DISABLED_SUFFIX}"),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ArtifactState::Disabled)
    }

    fn is_enabled(&self) -> bool {
        !self.is_disabled()
    }
}

// Serialized as a plain `disabled` bool.
mod disabled_flag {
    use super::ArtifactState;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(state: &ArtifactState, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(state.is_disabled())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ArtifactState, D::Error> {
        Ok(if bool::deserialize(d)? {
            ArtifactState::Disabled
        } else {
            ArtifactState::Enabled
        })
    }
}

/// Loader descriptor shared by EGL external platforms and Vulkan ICDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcdJson {
    #[serde(default)]
    pub file_format_version: String,
    #[serde(rename = "ICD", default)]
    pub icd: IcdJsonData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcdJsonData {
    #[serde(default)]
    pub library_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

impl IcdJson {
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Vulkan layer manifests differ per vendor, so they are kept as raw JSON.
pub type LayerJson = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile<T> {
    pub name: String,
    #[serde(
        rename = "disabled",
        with = "disabled_flag",
        default,
        skip_serializing_if = "ArtifactState::is_enabled"
    )]
    pub state: ArtifactState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<T>,
}

impl<T> ConfigFile<T> {
    pub fn new(file_name: &str, content: Option<T>) -> Self {
        let (name, state) = ArtifactState::from_file_name(file_name);
        ConfigFile {
            name,
            state,
            content,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    /// Current on-disk file name.
    pub fn file_name(&self) -> String {
        self.state.file_name(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDirectory<T> {
    pub path: PathBuf,
    /// Keyed by on-disk file name, `.disabled` suffix included.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, ConfigFile<T>>,
}

impl<T> ConfigDirectory<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigDirectory {
            path: path.into(),
            files: BTreeMap::new(),
        }
    }

    /// Looks `name` up by on-disk name first, then by logical name.
    pub fn find(&self, name: &str) -> Option<&ConfigFile<T>> {
        self.files
            .get(name)
            .or_else(|| self.files.values().find(|f| f.name == name))
    }
}

pub type IcdDirectory = ConfigDirectory<IcdJson>;
pub type LayersDirectory = ConfigDirectory<LayerJson>;

fn find_in<'a, T>(
    dirs: &'a [ConfigDirectory<T>],
    name: &str,
) -> Option<(&'a ConfigDirectory<T>, &'a ConfigFile<T>)> {
    dirs.iter()
        .find_map(|dir| dir.find(name).map(|file| (dir, file)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    #[serde(rename = "library")]
    pub name: String,
    #[serde(
        rename = "disabled",
        with = "disabled_flag",
        default,
        skip_serializing_if = "ArtifactState::is_enabled"
    )]
    pub state: ArtifactState,
    #[serde(
        rename = "linked_libpath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_file: Option<PathBuf>,
}

impl Library {
    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvidiaDriver {
    pub path: PathBuf,
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub with_kernel_modules: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelModule {
    pub path: PathBuf,
    pub kernel_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(
        rename = "disabled",
        with = "disabled_flag",
        default,
        skip_serializing_if = "ArtifactState::is_enabled"
    )]
    pub state: ArtifactState,
}

impl KernelModule {
    pub fn version(&self) -> &str {
        self.fields.get("version").map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvidiaSetup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drivers: Vec<NvidiaDriver>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version_active: String,
    #[serde(
        rename = "kernel_modules",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub kernel_modules: Vec<KernelModule>,
    #[serde(
        rename = "kernel_open_modules",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub open_kernel_modules: Vec<KernelModule>,
}

impl NvidiaSetup {
    pub fn has_version(&self, version: &str) -> bool {
        self.driver(version).is_some()
    }

    pub fn driver(&self, version: &str) -> Option<&NvidiaDriver> {
        self.drivers.iter().find(|d| d.version == version)
    }

    /// Stores `version` as active when it names a discovered driver,
    /// otherwise clears the active version. Returns whether it was accepted.
    pub fn set_active_version(&mut self, version: &str) -> bool {
        if !version.is_empty() && self.has_version(version) {
            self.version_active = version.to_string();
            true
        } else {
            self.version_active.clear();
            false
        }
    }

    pub fn active_driver(&self) -> Option<&NvidiaDriver> {
        if self.version_active.is_empty() {
            return None;
        }
        self.driver(&self.version_active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    #[serde(
        rename = "egl_external_platforms_dirs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub egl_ext_platform_dirs: Vec<IcdDirectory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulkan_layers_dirs: Vec<LayersDirectory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulkan_icd_dirs: Vec<IcdDirectory>,
    #[serde(rename = "gbm_libs", default, skip_serializing_if = "Vec::is_empty")]
    pub gbm_libraries: Vec<Library>,
    #[serde(default)]
    pub nvidia: NvidiaSetup,
}

impl System {
    pub fn egl_loader(&self, name: &str) -> Option<(&IcdDirectory, &ConfigFile<IcdJson>)> {
        find_in(&self.egl_ext_platform_dirs, name)
    }

    pub fn vulkan_icd_file(&self, name: &str) -> Option<(&IcdDirectory, &ConfigFile<IcdJson>)> {
        find_in(&self.vulkan_icd_dirs, name)
    }

    pub fn vulkan_layer_file(
        &self,
        name: &str,
    ) -> Option<(&LayersDirectory, &ConfigFile<LayerJson>)> {
        find_in(&self.vulkan_layers_dirs, name)
    }

    pub fn gbm_library(&self, name: &str) -> Option<&Library> {
        self.gbm_libraries.iter().find(|l| l.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_file_name() {
        assert_eq!(
            ArtifactState::from_file_name("b.json.disabled"),
            ("b.json".to_string(), ArtifactState::Disabled)
        );
        assert_eq!(
            ArtifactState::from_file_name("a.json"),
            ("a.json".to_string(), ArtifactState::Enabled)
        );
        assert_eq!(ArtifactState::Disabled.file_name("b.json"), "b.json.disabled");
    }

    #[test]
    fn parses_icd_descriptor() {
        let data = br#"{"file_format_version":"1.0.0","ICD":{"library_path":"/usr/lib/libX.so","api_version":"1.3"}}"#;
        let icd = IcdJson::from_slice(data).unwrap();
        assert_eq!(icd.file_format_version, "1.0.0");
        assert_eq!(icd.icd.library_path, "/usr/lib/libX.so");
        assert_eq!(icd.icd.api_version, "1.3");
    }

    #[test]
    fn icd_descriptor_tolerates_missing_fields() {
        let icd = IcdJson::from_slice(br#"{"ICD":{"library_path":"libnvidia-egl-wayland.so.1"}}"#)
            .unwrap();
        assert_eq!(icd.icd.library_path, "libnvidia-egl-wayland.so.1");
        assert!(icd.icd.api_version.is_empty());
        assert!(IcdJson::from_slice(b"{not json").is_err());
    }

    #[test]
    fn directory_lookup_by_disk_or_logical_name() {
        let mut dir: IcdDirectory = ConfigDirectory::new("/usr/share/vulkan/icd.d");
        dir.files.insert(
            "nvidia_icd.json.disabled".into(),
            ConfigFile::new("nvidia_icd.json.disabled", None),
        );
        assert!(dir.find("nvidia_icd.json").is_some());
        assert!(dir.find("nvidia_icd.json.disabled").is_some());
        assert!(dir.find("radeon_icd.json").is_none());
    }

    #[test]
    fn active_version_must_be_installed() {
        let mut setup = NvidiaSetup {
            drivers: vec![NvidiaDriver {
                path: "/opt/nvidia/nvidia-drivers-535.129.03".into(),
                version: "535.129.03".into(),
                with_kernel_modules: true,
            }],
            ..Default::default()
        };
        assert!(setup.set_active_version("535.129.03"));
        assert_eq!(setup.version_active, "535.129.03");
        assert!(setup.active_driver().is_some());

        assert!(!setup.set_active_version("550.40.07"));
        assert!(setup.version_active.is_empty());
        assert!(setup.active_driver().is_none());
    }

    #[test]
    fn disabled_flag_serialization() {
        let file: ConfigFile<IcdJson> = ConfigFile::new("b.json.disabled", None);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["name"], "b.json");
        assert_eq!(json["disabled"], true);

        let enabled: ConfigFile<IcdJson> = ConfigFile::new("a.json", None);
        let json = serde_json::to_value(&enabled).unwrap();
        assert!(json.get("disabled").is_none());
    }
}
