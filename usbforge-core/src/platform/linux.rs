use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sysinfo;
use tracing::debug;

use crate::device::Device;
use crate::error::{Error, Result};

/// Reads one attribute file from /sys/block for the given device.
fn read_sys_attr(device_name: &str, attr: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(attr);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Strips a partition suffix to get the parent device, e.g.
/// /dev/sda1 -> /dev/sda or /dev/nvme0n1p2 -> /dev/nvme0n1. Used to
/// exclude the system drive from enumeration.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// A display label for the device: the hardware model when the kernel
/// exposes one, otherwise the kernel device name.
fn device_label(device_name: &str) -> String {
    match read_sys_attr(device_name, "device/model") {
        Ok(model) if !model.is_empty() => model,
        _ => device_name.to_string(),
    }
}

/// Enumerates removable block devices on Linux by walking /sys/block.
///
/// The system drive's parent device, loop devices, non-removable devices,
/// and devices reporting zero size (typically empty card readers) are
/// skipped. Ids are assigned in enumeration order and are unique within
/// one pass; a device keeps no identity across refreshes.
pub fn removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut system_disk_parent = None;
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev/").join(disk.name());
            system_disk_parent = Some(parent_device_path(&path));
            break;
        }
    }
    let system_disk_parent = system_disk_parent
        .ok_or_else(|| Error::InternalState("could not determine the system drive".into()))?;

    let block_dir = fs::read_dir("/sys/block")
        .map_err(|e| Error::InternalState(format!("could not read /sys/block: {e}")))?;

    let mut devices = Vec::new();
    for entry in block_dir.filter_map(std::result::Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_attr(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !is_removable {
            continue;
        }

        let size_sectors = read_sys_attr(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let device = Device {
            id: devices.len() as u32,
            name: device_label(&device_name),
            size_bytes: size_sectors * 512,
            path: device_path,
        };
        debug!(id = device.id, name = %device.name, "found removable device");
        devices.push(device);
    }

    Ok(devices)
}
