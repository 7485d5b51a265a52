use crate::command::run_capture;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    pub bus_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subsystem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,
    #[serde(
        rename = "kernel_driver_inuse",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kernel_driver_in_use: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_modules: Vec<String>,
}

impl PciDevice {
    /// Display adapters report a class name starting with the `VGA` token.
    pub fn is_vga(&self) -> bool {
        self.class_name.split(' ').next() == Some("VGA")
    }
}

/// PCI devices in `lspci` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PciDevices(pub Vec<PciDevice>);

impl PciDevices {
    /// Runs `lspci -nn -k` and parses its output.
    pub fn detect() -> Result<Self> {
        let output = run_capture("lspci", ["-nn", "-k"]).context("error on reading pci data")?;
        Ok(Self::parse(&output))
    }

    pub fn parse(output: &str) -> Self {
        PciDevices(parse_lspci_output(output))
    }

    pub fn vga_devices(&self) -> Vec<&PciDevice> {
        self.0.iter().filter(|d| d.is_vga()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PciDevice> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// 05:00.0 VGA compatible controller [0300]: Advanced Micro Devices, Inc. [AMD/ATI] Picasso [1002:15d8] (rev c1)
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\S+)\s+(.+?)\s+\[([0-9a-fA-F]{4})\]:\s+(.*?)\s*\[([0-9a-fA-F]{4}:[0-9a-fA-F]{4})\](?:\s+\(.*\))?\s*$",
    )
    .unwrap()
});

fn parse_lspci_output(output: &str) -> Vec<PciDevice> {
    let mut devices: Vec<PciDevice> = Vec::new();
    // false while the last header line could not be parsed
    let mut in_device = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            if !in_device {
                continue;
            }
            if let Some(device) = devices.last_mut() {
                parse_detail(device, line.trim_start());
            }
            continue;
        }

        match parse_header(line) {
            Some(device) => {
                devices.push(device);
                in_device = true;
            }
            None => {
                warn!(line, "unrecognized lspci line");
                in_device = false;
            }
        }
    }

    devices
}

fn parse_header(line: &str) -> Option<PciDevice> {
    let caps = HEADER_RE.captures(line)?;
    Some(PciDevice {
        bus_id: caps[1].to_string(),
        class_name: caps[2].trim().to_string(),
        class_id: caps[3].to_string(),
        name: caps[4].trim().to_string(),
        id: caps[5].to_string(),
        ..Default::default()
    })
}

fn parse_detail(device: &mut PciDevice, body: &str) {
    if let Some(rest) = body.strip_prefix("Subsystem:") {
        device.subsystem = rest.trim().to_string();
    } else if let Some(rest) = body.strip_prefix("DeviceName:") {
        device.device_name = rest.trim().to_string();
    } else if let Some(rest) = body.strip_prefix("Kernel driver in use:") {
        device.kernel_driver_in_use = rest.trim().to_string();
    } else if let Some(rest) = body.strip_prefix("Kernel modules:") {
        device.kernel_modules = rest
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
    }
}
