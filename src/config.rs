//! Tool configuration: YAML file, `GPUCONF_*` environment overrides, then
//! command line flags applied by the binary.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backend::DEFAULT_BACKEND;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpu-configurator/config.yml";
pub const CONFIG_PATH_ENV: &str = "GPUCONF_CONFIG";
const ENV_PREFIX: &str = "GPUCONF_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub debug: bool,
    /// Distribution layout, `macaroni` or `funtoo`.
    pub backend: String,
    /// Prefix of every scanned or modified path.
    pub root: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            debug: false,
            backend: DEFAULT_BACKEND.to_string(),
            root: PathBuf::from("/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            color: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error on reading config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("error on parsing config {}", path.display()))
    }

    /// Loads `explicit` when given, failing if it is missing. Otherwise the
    /// default location is tried and a missing file yields the defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Applies `GPUCONF_<SECTION>__<KEY>` overrides from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<()> {
        // Variables that are not UTF-8 cannot be ours.
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        self.apply_overrides(vars)
    }

    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name.to_ascii_lowercase().as_str() {
                "general__debug" => self.general.debug = parse_bool(key.as_ref(), value)?,
                "general__backend" => self.general.backend = value.to_string(),
                "general__root" => self.general.root = PathBuf::from(value),
                "logging__level" => self.logging.level = value.to_string(),
                "logging__color" => self.logging.color = parse_bool(key.as_ref(), value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("invalid boolean {other:?} for {key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert!(!cfg.general.debug);
        assert_eq!(cfg.general.backend, "macaroni");
        assert_eq!(cfg.general.root, PathBuf::from("/"));
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.logging.color);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"general:\n  backend: funtoo\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.general.backend, "funtoo");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::load_or_default(Some(Path::new("/nonexistent/config.yml"))).is_err());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"general: [debug: {{{").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn environment_overrides() {
        let mut cfg = Config::default();
        cfg.apply_overrides([
            ("GPUCONF_GENERAL__DEBUG", "true"),
            ("GPUCONF_GENERAL__ROOT", "/mnt/image"),
            ("GPUCONF_LOGGING__COLOR", "0"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert!(cfg.general.debug);
        assert_eq!(cfg.general.root, PathBuf::from("/mnt/image"));
        assert!(!cfg.logging.color);

        let err = cfg
            .apply_overrides([("GPUCONF_GENERAL__DEBUG", "maybe")])
            .unwrap_err();
        assert!(err.to_string().contains("GPUCONF_GENERAL__DEBUG"));
    }

    #[test]
    fn non_utf8_environment_is_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var("GPUCONF_TEST_RAW_BYTES", OsStr::from_bytes(b"\xff\xfe"));
        let result = Config::default().apply_env();
        std::env::remove_var("GPUCONF_TEST_RAW_BYTES");
        assert!(result.is_ok());
    }

    #[test]
    fn serializes_sections() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(yaml.contains("backend: macaroni"));
        let json = Config::default().to_json().unwrap();
        assert!(json.contains("\"level\": \"info\""));
    }
}
