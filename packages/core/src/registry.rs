//! Candidate volume bookkeeping.
//!
//! Arrival notifications can fire several times for the same device (mount,
//! remount, description changes). The registry keeps the latest sighting per
//! device node and enforces that only one volume is being unlocked at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::DeviceIdentity;

/// Attributes the disk layer reports for an arriving block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskDescriptor {
    /// Partition node, e.g. `/dev/sdb1` or `disk4s1`.
    pub device_node: PathBuf,
    /// Whole-disk node, e.g. `/dev/sdb` or `disk4`.
    pub whole_disk: Option<PathBuf>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub vendor_label: Option<String>,
    pub product_label: Option<String>,
    pub volume_mountable: bool,
    /// Where the volume is mounted, if it is.
    pub volume_path: Option<PathBuf>,
    pub volume_name: Option<String>,
}

impl DiskDescriptor {
    /// True only if all five identifying attributes match `identity`.
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vendor_id == Some(identity.vendor_id)
            && self.product_id == Some(identity.product_id)
            && self.vendor_label.as_deref() == Some(identity.vendor_label.as_str())
            && self.product_label.as_deref() == Some(identity.product_label.as_str())
            && self.volume_mountable
    }
}

/// A mounted volume that may be the hardware key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateVolume {
    pub volume_name: String,
    pub mount_path: PathBuf,
    pub descriptor: DiskDescriptor,
}

impl CandidateVolume {
    /// Builds a candidate from a descriptor that carries a volume path.
    pub fn from_descriptor(descriptor: DiskDescriptor) -> Option<Self> {
        let mount_path = descriptor.volume_path.clone()?;
        let volume_name = descriptor
            .volume_name
            .clone()
            .or_else(|| {
                mount_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| descriptor.device_node.display().to_string());
        Some(Self {
            volume_name,
            mount_path,
            descriptor,
        })
    }

    pub fn device_node(&self) -> &Path {
        &self.descriptor.device_node
    }

    /// Node to eject: the whole disk when known, else the partition.
    pub fn eject_target(&self) -> &Path {
        self.descriptor
            .whole_disk
            .as_deref()
            .unwrap_or(&self.descriptor.device_node)
    }

    /// Whether the underlying device is the configured hardware key.
    pub fn device_descriptor_match(&self, identity: &DeviceIdentity) -> bool {
        self.descriptor.matches(identity)
    }
}

/// Known candidate volumes keyed by device node.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: HashMap<PathBuf, CandidateVolume>,
    active: Option<CandidateVolume>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting, returning the entry it superseded.
    pub fn record(&mut self, volume: CandidateVolume) -> Option<CandidateVolume> {
        self.volumes.insert(volume.device_node().to_path_buf(), volume)
    }

    pub fn get(&self, device_node: &Path) -> Option<&CandidateVolume> {
        self.volumes.get(device_node)
    }

    /// Consumes the latest sighting of `volume`'s device and marks it
    /// active. Falls back to `volume` itself if the device was never
    /// recorded.
    pub fn activate(&mut self, volume: &CandidateVolume) -> CandidateVolume {
        let latest = self
            .volumes
            .remove(volume.device_node())
            .unwrap_or_else(|| volume.clone());
        self.active = Some(latest.clone());
        latest
    }

    /// The volume currently being processed, if any.
    pub fn active(&self) -> Option<&CandidateVolume> {
        self.active.as_ref()
    }

    /// Ends processing of the active volume.
    pub fn finish(&mut self) -> Option<CandidateVolume> {
        self.active.take()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}
