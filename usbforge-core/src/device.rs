use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A removable storage device discovered on the system.
///
/// Devices are immutable value records. Equality is by `(id, name)` only;
/// the block device path is an OS addressing detail carried for the disk
/// writer and is not part of a device's identity.
#[derive(Clone, Debug)]
pub struct Device {
    /// Identifier unique within one enumeration pass.
    pub id: u32,
    /// Display label, e.g. the device model or kernel name.
    pub name: String,
    /// Total capacity in bytes.
    pub size_bytes: u64,
    /// The system path to the device (e.g. `/dev/sdb`).
    pub path: PathBuf,
}

impl Device {
    /// Capacity in gigabytes, for display purposes only.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl Eq for Device {}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<25} {:.1} GB ({})",
            self.name,
            self.size_gb(),
            self.path.display()
        )
    }
}

/// An ordered snapshot of the removable devices attached at one refresh.
///
/// A fresh list is produced on every refresh and wholly replaces the prior
/// one; nothing mutates a list in place. Construction drops duplicate
/// `(id, name)` pairs, keeping the first occurrence, so enumeration order
/// is preserved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceList(Vec<Device>);

impl DeviceList {
    pub fn new(devices: Vec<Device>) -> Self {
        let mut unique: Vec<Device> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        DeviceList(unique)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Device] {
        &self.0
    }

    /// Looks up a device by id, failing with [`Error::NotFound`] if no
    /// device with that id is present.
    pub fn by_id(&self, id: u32) -> Result<&Device> {
        self.0
            .iter()
            .find(|d| d.id == id)
            .ok_or(Error::NotFound(id))
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
