//! Device enumeration behind a pluggable backend.
//!
//! [`DeviceCatalog::refresh`] is a pure query: it asks the enumerator for
//! the currently attached removable devices and returns a fresh
//! [`DeviceList`]. The catalog never polls on its own; the pipeline
//! controller owns the polling loop and its interval, because device
//! insertion is asynchronous from the caller's point of view.

use crate::device::{Device, DeviceList};
use crate::error::Result;
use crate::platform;

/// Source of raw device enumerations. The production implementation is
/// [`SystemEnumerator`]; tests substitute scripted fakes.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Device>>;
}

/// Enumerates real removable block devices via the platform layer.
pub struct SystemEnumerator;

impl DeviceEnumerator for SystemEnumerator {
    fn enumerate(&self) -> Result<Vec<Device>> {
        platform::removable_devices()
    }
}

pub struct DeviceCatalog {
    enumerator: Box<dyn DeviceEnumerator>,
}

impl DeviceCatalog {
    /// A catalog backed by the operating system's device enumeration.
    pub fn system() -> Self {
        Self::with_enumerator(Box::new(SystemEnumerator))
    }

    pub fn with_enumerator(enumerator: Box<dyn DeviceEnumerator>) -> Self {
        DeviceCatalog { enumerator }
    }

    /// Produces a fresh snapshot of the attached removable devices,
    /// replacing any list obtained earlier. Filtering beyond "removable"
    /// (e.g. minimum size) is the caller's policy, not the catalog's.
    pub fn refresh(&self) -> Result<DeviceList> {
        let devices = self.enumerator.enumerate()?;
        Ok(DeviceList::new(devices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Fixed(Vec<Device>);

    impl DeviceEnumerator for Fixed {
        fn enumerate(&self) -> Result<Vec<Device>> {
            Ok(self.0.clone())
        }
    }

    fn device(id: u32, name: &str) -> Device {
        Device {
            id,
            name: name.to_string(),
            size_bytes: 8_000_000_000,
            path: PathBuf::from("/dev/sdz"),
        }
    }

    #[test]
    fn refresh_dedupes_and_keeps_enumeration_order() {
        let catalog = DeviceCatalog::with_enumerator(Box::new(Fixed(vec![
            device(5, "e"),
            device(1, "a"),
            device(5, "e"),
        ])));
        let list = catalog.refresh().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.as_slice()[0].id, 5);
        assert_eq!(list.as_slice()[1].id, 1);
    }

    #[test]
    fn refresh_replaces_the_previous_snapshot() {
        let catalog = DeviceCatalog::with_enumerator(Box::new(Fixed(vec![device(1, "a")])));
        let first = catalog.refresh().unwrap();
        let second = catalog.refresh().unwrap();
        assert_eq!(first, second);
    }
}
