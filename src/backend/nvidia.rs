//! Activation checklist of a proprietary NVIDIA driver tree.
//!
//! Every installed version lives self-contained under
//! `/opt/nvidia/nvidia-drivers-<version>` mirroring the host layout. Activating
//! a version writes a handful of configuration files and links the rest of the
//! tree into the host; purging removes the same set again.

use super::macaroni::{MacaroniBackend, NVIDIA_ENV_FILE, NVIDIA_VERSION_KEY};
use super::SystemBackend;
use crate::system::NvidiaDriver;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BINARIES: &[&str] = &[
    "nvidia-cuda-mps-control",
    "nvidia-cuda-mps-server",
    "nvidia-debugdump",
    "nvidia-settings",
    "nvidia-smi",
    "nvidia-xconfig",
    "nvidia-powerd",
    "nvidia-persistenced",
];

const INITD_SCRIPTS: &[&str] = &["nvidia-persistenced", "nvidia-powerd", "nvidia-smi"];

// PV is replaced by the driver version.
const SHARE_NVIDIA_FILES: &[&str] = &[
    "nvidia-application-profiles-PV-rc",
    "nvidia-application-profiles-PV-key-documentation",
    "nvoptix.bin",
];

const MAN_PAGES: &[&str] = &[
    "nvidia-smi.1",
    "nvidia-cuda-mps-control.1",
    "nvidia-persistenced.1",
    "nvidia-xconfig.1",
    "nvidia-settings.1",
];

/// Files linked from the same relative location inside the driver tree.
const LINKED_FILES: &[(&str, &str)] = &[
    ("/etc/OpenCL/vendors", "nvidia.icd"),
    ("/usr/share/applications", "nvidia-settings.desktop"),
    ("/usr/share/pixmaps", "nvidia-settings.png"),
    ("/usr/share/vulkan/icd.d", "nvidia_icd.json"),
    ("/usr/share/vulkan/implicit_layer.d", "nvidia_layers.json"),
    ("/usr/share/glvnd/egl_vendor.d", "10_nvidia.json"),
    ("/usr/share/X11/xorg.conf.d", "nvidia-drm-outputclass.conf"),
    ("/usr/share/dbus-1/system.d", "nvidia-dbus.conf"),
    ("/usr/lib64/xorg/modules/drivers", "nvidia_drv.so"),
    ("/usr/lib64/xorg/modules/extensions", "libglxserver_nvidia.so"),
];

const GENERATED_FILES: &[(&str, &str)] = &[
    (
        "/etc/sandbox.d/20nvidia",
        "SANDBOX_PREDICT=\"/dev/nvidiactl:/dev/nvidia-caps:/dev/char\"\n",
    ),
    (
        "/etc/X11/xinit/xinitrc.d/95-nvidia-settings",
        "#!/bin/sh\nif [ $(lsmod | grep nvidia | wc -l) != \"0\" ] ; then\n  /usr/bin/nvidia-settings --load-config-only\nfi\n",
    ),
    (
        "/etc/tmpfiles.d/nvidia-drivers.conf",
        "d /run/nvidia-xdriver 0775 root video -\n",
    ),
];

const USR_BIN: &str = "/usr/bin";
const INITD_DIR: &str = "/etc/init.d";
const SHARE_NVIDIA_DIR: &str = "/usr/share/nvidia";
const MAN_DIR: &str = "/usr/share/man/man1";
const PERSISTENCED_CONF: &str = "/etc/conf.d/nvidia-persistenced";
const LDSO_CONF: &str = "/etc/ld.so.conf.d/07-nvidia";

impl MacaroniBackend {
    /// Links and writes everything `driver` needs to be the active version.
    /// Links left by a previous activation are replaced.
    pub(super) fn activate_driver(&self, driver: &NvidiaDriver) -> Result<()> {
        let version = driver.version.as_str();
        let lib_dir = driver.path.join("lib64");
        info!(version, path = %driver.path.display(), "activating nvidia driver");

        let env_file = self.environment_dir().join(NVIDIA_ENV_FILE);
        let header = format!(
            "# autogenerated file by gpu-configurator on {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        write_file(
            &env_file,
            &format!(
                "{header}LDPATH=\"{}\"\n{NVIDIA_VERSION_KEY}=\"{version}\"\n",
                lib_dir.display()
            ),
        )?;

        for bin in BINARIES {
            link_if_present(&driver.path.join("bin").join(bin), &self.path(USR_BIN).join(bin))?;
        }

        for script in INITD_SCRIPTS {
            let source = driver.path.join("etc/init.d").join(script);
            if source.is_file() {
                copy_file(&source, &self.path(INITD_DIR).join(script), 0o755)?;
            }
        }

        for (path, content) in GENERATED_FILES {
            write_file(&self.path(path), content)?;
        }

        for (dir, file) in LINKED_FILES {
            link_if_present(&self.in_driver(driver, dir).join(file), &self.path(dir).join(file))?;
        }

        let share_source = self.in_driver(driver, SHARE_NVIDIA_DIR);
        for file in share_nvidia_files(version) {
            link_if_present(&share_source.join(&file), &self.path(SHARE_NVIDIA_DIR).join(&file))?;
        }

        let man_source = self.in_driver(driver, MAN_DIR);
        for page in MAN_PAGES {
            link_if_present(&man_source.join(page), &self.path(MAN_DIR).join(page))?;
        }

        // Local edits to the persistenced options are kept.
        let conf = self.path(PERSISTENCED_CONF);
        let conf_source = self.in_driver(driver, PERSISTENCED_CONF);
        if !exists(&conf) && conf_source.is_file() {
            copy_file(&conf_source, &conf, 0o644)?;
        }

        write_file(&self.path(LDSO_CONF), &format!("{}\n", lib_dir.display()))?;

        info!(version, "nvidia driver configured");
        Ok(())
    }

    /// Removes what [`Self::activate_driver`] created, except the
    /// persistenced options. Version specific files are only known when
    /// `version` is not empty.
    pub(super) fn deactivate_driver(&self, version: &str) -> Result<()> {
        info!(version, "purging nvidia driver setup");

        remove_if_present(&self.environment_dir().join(NVIDIA_ENV_FILE))?;

        for bin in BINARIES {
            remove_if_present(&self.path(USR_BIN).join(bin))?;
        }
        for script in INITD_SCRIPTS {
            remove_if_present(&self.path(INITD_DIR).join(script))?;
        }
        for (path, _) in GENERATED_FILES {
            remove_if_present(&self.path(path))?;
        }
        for (dir, file) in LINKED_FILES {
            remove_if_present(&self.path(dir).join(file))?;
        }
        if !version.is_empty() {
            for file in share_nvidia_files(version) {
                remove_if_present(&self.path(SHARE_NVIDIA_DIR).join(file))?;
            }
        }
        for page in MAN_PAGES {
            remove_if_present(&self.path(MAN_DIR).join(page))?;
        }

        remove_if_present(&self.path(LDSO_CONF))
    }

    fn in_driver(&self, driver: &NvidiaDriver, abs: &str) -> PathBuf {
        driver.path.join(abs.trim_start_matches('/'))
    }
}

fn share_nvidia_files(version: &str) -> impl Iterator<Item = String> + '_ {
    SHARE_NVIDIA_FILES
        .iter()
        .map(move |f| f.replace("PV", version))
}

// symlink_metadata also sees dangling links.
fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("error on create dir {}", parent.display()))?;
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, content).with_context(|| format!("error on write file {}", path.display()))?;
    debug!(path = %path.display(), "written");
    Ok(())
}

fn copy_file(source: &Path, target: &Path, mode: u32) -> Result<()> {
    ensure_parent(target)?;
    remove_if_present(target)?;
    fs::copy(source, target).with_context(|| {
        format!("error on copy {} to {}", source.display(), target.display())
    })?;
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
        .with_context(|| format!("error on chmod {}", target.display()))?;
    debug!(source = %source.display(), target = %target.display(), "copied");
    Ok(())
}

fn link_if_present(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        debug!(source = %source.display(), "not shipped by driver, skipped");
        return Ok(());
    }
    ensure_parent(target)?;
    remove_if_present(target)?;
    symlink(source, target).with_context(|| {
        format!(
            "error on linking file {} to {}",
            source.display(),
            target.display()
        )
    })?;
    debug!(source = %source.display(), target = %target.display(), "linked");
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("error on removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ModuleInspector;
    use tempfile::TempDir;

    struct NoModules;

    impl ModuleInspector for NoModules {
        fn modinfo_field(&self, _module: &Path, _field: &str) -> Result<String> {
            Ok(String::new())
        }

        fn runtime_kernel_version(&self) -> Result<String> {
            Ok("6.6.13-macaroni".into())
        }
    }

    const VERSION: &str = "535.129.03";

    fn driver_tree(root: &Path) -> NvidiaDriver {
        let path = root.join("opt/nvidia/nvidia-drivers-535.129.03");
        for (rel, content) in [
            ("bin/nvidia-smi", "#!/bin/sh\n"),
            ("etc/init.d/nvidia-smi", "#!/sbin/openrc-run\n"),
            ("etc/conf.d/nvidia-persistenced", "NVPD_USER=\"\"\n"),
            ("usr/share/vulkan/icd.d/nvidia_icd.json", "{}"),
            (
                "usr/share/nvidia/nvidia-application-profiles-535.129.03-rc",
                "{}",
            ),
            ("usr/lib64/xorg/modules/extensions/libglxserver_nvidia.so", ""),
        ] {
            let file = path.join(rel);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }
        NvidiaDriver {
            path,
            version: VERSION.into(),
            with_kernel_modules: true,
        }
    }

    #[test]
    fn activation_then_purge() {
        let tmp = TempDir::new().unwrap();
        let backend = MacaroniBackend::with_inspector("macaroni", tmp.path(), Box::new(NoModules));
        let driver = driver_tree(tmp.path());

        backend.activate_driver(&driver).unwrap();
        // Running twice replaces the existing links.
        backend.activate_driver(&driver).unwrap();

        assert_eq!(backend.nvidia_driver_active().unwrap(), VERSION);
        let smi = tmp.path().join("usr/bin/nvidia-smi");
        assert_eq!(fs::read_link(&smi).unwrap(), driver.path.join("bin/nvidia-smi"));
        assert!(!exists(&tmp.path().join("usr/bin/nvidia-settings")));

        let initd = tmp.path().join("etc/init.d/nvidia-smi");
        let mode = fs::metadata(&initd).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert!(exists(&tmp.path().join(
            "usr/share/nvidia/nvidia-application-profiles-535.129.03-rc"
        )));
        assert!(exists(
            &tmp.path().join("usr/lib64/xorg/modules/extensions/libglxserver_nvidia.so")
        ));
        let ldso = fs::read_to_string(tmp.path().join("etc/ld.so.conf.d/07-nvidia")).unwrap();
        assert_eq!(ldso.trim(), driver.path.join("lib64").display().to_string());

        backend.deactivate_driver(VERSION).unwrap();
        assert_eq!(backend.nvidia_driver_active().unwrap(), "");
        assert!(!exists(&smi));
        assert!(!exists(&initd));
        assert!(!exists(&tmp.path().join("etc/sandbox.d/20nvidia")));
        assert!(!exists(
            &tmp.path().join("usr/lib64/xorg/modules/extensions/libglxserver_nvidia.so")
        ));
        assert!(exists(&tmp.path().join("etc/conf.d/nvidia-persistenced")));
    }

    #[test]
    fn persistenced_options_are_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let backend = MacaroniBackend::with_inspector("macaroni", tmp.path(), Box::new(NoModules));
        let driver = driver_tree(tmp.path());
        let conf = tmp.path().join("etc/conf.d/nvidia-persistenced");
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, "NVPD_USER=\"nvidia\"\n").unwrap();

        backend.activate_driver(&driver).unwrap();
        assert_eq!(fs::read_to_string(&conf).unwrap(), "NVPD_USER=\"nvidia\"\n");
    }

    #[test]
    fn purge_without_setup_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let backend = MacaroniBackend::with_inspector("macaroni", tmp.path(), Box::new(NoModules));
        backend.deactivate_driver("").unwrap();
    }
}
