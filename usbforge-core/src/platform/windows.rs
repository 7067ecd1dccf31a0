use crate::device::Device;
use crate::error::Result;

/// Enumerates removable block devices on Windows.
///
/// # Panics
///
/// Windows enumeration is not implemented yet.
pub fn removable_devices() -> Result<Vec<Device>> {
    // TODO: enumerate physical drives via SetupDiGetClassDevsW /
    // SetupDiEnumDeviceInfo and query size and removability with
    // DeviceIoControl, mapping each to a Device record.
    unimplemented!("Windows device enumeration is not yet implemented");
}
