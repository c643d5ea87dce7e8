//! Block device scanning.
//!
//! Partitions come from `lsblk --json`. udev reports devices as they come
//! and go but knows nothing about mounts, so the Linux backend asks lsblk
//! where a partition ended up.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{Error, IoResultExt, Result};

/// A partition on the system, with the attributes of its parent disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDevice {
    /// Kernel name (e.g., "sdb1").
    pub name: String,
    /// Full device path (e.g., "/dev/sdb1").
    pub path: PathBuf,
    /// Kernel name of the whole disk (e.g., "sdb").
    pub disk_name: Option<String>,
    /// Volume label, if set.
    pub label: Option<String>,
    /// Filesystem type (e.g., "vfat", "exfat").
    pub fstype: Option<String>,
    /// Current mount point, if mounted.
    pub mountpoint: Option<PathBuf>,
    /// Disk vendor string, trimmed (e.g., "SanDisk").
    pub vendor: Option<String>,
    /// Disk model string, trimmed (e.g., "Cruzer Fit").
    pub model: Option<String>,
    /// Transport (e.g., "usb", "nvme").
    pub transport: Option<String>,
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

/// Lists all partitions on the system.
///
/// Calls `lsblk --json` and parses the output.
pub fn list_block_devices() -> Result<Vec<BlockDevice>> {
    let output = Command::new("lsblk")
        .args([
            "--json",
            "--output",
            "NAME,PATH,LABEL,FSTYPE,MOUNTPOINT,VENDOR,MODEL,TRAN,TYPE",
        ])
        .output()
        .command_context("lsblk")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(Error::CommandExit {
            command: "lsblk".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `lsblk --json` output into partitions.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let lsblk_output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut devices = Vec::new();
    collect_devices(&lsblk_output.blockdevices, None, &mut devices);
    Ok(devices)
}

/// Recursively collect partitions, inheriting disk attributes from the parent.
fn collect_devices(
    lsblk_devices: &[LsblkDevice],
    parent: Option<&LsblkDevice>,
    devices: &mut Vec<BlockDevice>,
) {
    for dev in lsblk_devices {
        if dev.device_type.as_deref() == Some("part") {
            devices.push(BlockDevice {
                name: dev.name.clone(),
                path: dev
                    .path
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", dev.name))),
                disk_name: parent.map(|p| p.name.clone()),
                label: non_empty(&dev.label),
                fstype: non_empty(&dev.fstype),
                mountpoint: non_empty(&dev.mountpoint).map(PathBuf::from),
                vendor: inherit(&dev.vendor, parent.map(|p| &p.vendor)),
                model: inherit(&dev.model, parent.map(|p| &p.model)),
                transport: inherit(&dev.tran, parent.map(|p| &p.tran)),
            });
        }

        if let Some(children) = &dev.children {
            let next_parent = if dev.device_type.as_deref() == Some("disk") {
                Some(dev)
            } else {
                parent
            };
            collect_devices(children, next_parent, devices);
        }
    }
}

/// Partition value if set, otherwise the parent disk's.
fn inherit(own: &Option<String>, from_parent: Option<&Option<String>>) -> Option<String> {
    non_empty(own).or_else(|| from_parent.and_then(non_empty))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Current mount point of the partition at `devnode`, per lsblk.
pub fn mountpoint_of(devnode: &Path) -> Result<Option<PathBuf>> {
    Ok(find_mountpoint(&list_block_devices()?, devnode))
}

fn find_mountpoint(devices: &[BlockDevice], devnode: &Path) -> Option<PathBuf> {
    devices
        .iter()
        .find(|d| d.path == devnode)
        .and_then(|d| d.mountpoint.clone())
}
