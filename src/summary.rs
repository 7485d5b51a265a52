//! Human readable rendition of a [`System`] snapshot.

use crate::pci::PciDevice;
use crate::system::{ConfigDirectory, KernelModule, System};
use std::io::{self, Write};

const RULE: &str = "---------------------------------------------------------------------";

/// Name of this host, `N/A` when it cannot be determined.
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "N/A".to_string())
}

pub fn write_summary<W: Write>(
    out: &mut W,
    system: &System,
    gpus: &[&PciDevice],
    hostname: &str,
) -> io::Result<()> {
    writeln!(
        out,
        "gpu-configurator {} - GPU driver integration helper",
        env!("CARGO_PKG_VERSION")
    )?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "Hostname:\t\t\t\t\t{hostname}")?;
    writeln!(out, "GPUs:\t\t\t\t\t\t{}", gpus.len())?;
    for gpu in gpus {
        writeln!(out, "\t- {} [{}]", gpu.name, gpu.id)?;
        if !gpu.kernel_driver_in_use.is_empty() {
            writeln!(out, "\t\tkernel driver in use: {}", gpu.kernel_driver_in_use)?;
        }
    }
    writeln!(out)?;

    write_dirs(
        out,
        "EGL External Platforms Configs Directories",
        &system.egl_ext_platform_dirs,
    )?;
    write_dirs(
        out,
        "Vulkan Layers Configs Directories",
        &system.vulkan_layers_dirs,
    )?;
    write_dirs(out, "Vulkan ICD Configs Directories", &system.vulkan_icd_dirs)?;

    if system.gbm_libraries.is_empty() {
        writeln!(out, "GBM Backend Libraries:\tNo libraries available.")?;
    } else {
        writeln!(out, "GBM Backend Libraries:")?;
        for lib in &system.gbm_libraries {
            write!(out, "\t- {}{}", lib.name, disabled_marker(lib.is_disabled()))?;
            match &lib.linked_file {
                Some(target) => writeln!(out, " -> {}", target.display())?,
                None => writeln!(out)?,
            }
        }
    }
    writeln!(out)?;

    let nvidia = &system.nvidia;
    if nvidia.drivers.is_empty() {
        writeln!(out, "NVIDIA Drivers:\tNo drivers available.")?;
        return Ok(());
    }
    writeln!(out, "NVIDIA Drivers:")?;
    writeln!(out, "\tActive version: {}", nvidia.version_active)?;
    writeln!(out, "\tAvailable:")?;
    for driver in &nvidia.drivers {
        if driver.with_kernel_modules {
            writeln!(out, "\t\t- {} (with kernel module)", driver.version)?;
        } else {
            writeln!(out, "\t\t- {}", driver.version)?;
        }
    }
    write_modules(out, "NVIDIA Kernel Modules Available", &nvidia.kernel_modules)?;
    write_modules(
        out,
        "NVIDIA Open Kernel Modules Available",
        &nvidia.open_kernel_modules,
    )
}

fn write_dirs<W: Write, T>(
    out: &mut W,
    title: &str,
    dirs: &[ConfigDirectory<T>],
) -> io::Result<()> {
    if dirs.is_empty() {
        writeln!(out, "{title}:\tNo directories available.")?;
    } else {
        writeln!(out, "{title}:")?;
        for dir in dirs {
            writeln!(out, "\t- {}", dir.path.display())?;
            for (file_name, file) in &dir.files {
                writeln!(out, "\t\t* {file_name}{}", disabled_marker(file.is_disabled()))?;
            }
        }
    }
    writeln!(out)
}

fn write_modules<W: Write>(out: &mut W, title: &str, modules: &[KernelModule]) -> io::Result<()> {
    if modules.is_empty() {
        return Ok(());
    }
    writeln!(out, "{title}:")?;
    for module in modules {
        writeln!(
            out,
            "\t* {} - {}{}",
            module.version(),
            module.kernel_version,
            disabled_marker(module.state.is_disabled())
        )?;
    }
    Ok(())
}

fn disabled_marker(disabled: bool) -> &'static str {
    if disabled {
        " (disabled)"
    } else {
        ""
    }
}
