//! Platform-specific device discovery.
//!
//! Each submodule exposes the same `removable_devices` function so the
//! rest of the library never needs to know which operating system it is
//! running on. Only enumeration lives here; writing goes through the
//! regular file API in [`crate::write`].

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
