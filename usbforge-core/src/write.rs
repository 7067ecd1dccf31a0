//! Writes a raw image file onto a target device.
//!
//! This is the destructive stage: once the first byte hits the device the
//! operation is irreversible and a mid-stream failure leaves the device
//! partially written. The stage is modeled as an explicit state machine,
//! `Initial -> Running -> {Success | GetFileSizeFailed | InstallFailed}`,
//! and the final report distinguishes a pre-write failure (safe to retry)
//! from a failure during the write itself (not safe to retry on the same
//! device without re-verification).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::os_options::OpenOptionsExt;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB
const BLOCK_SIZE: usize = 512;

#[cfg(unix)]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// The observable states of one disk write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    /// Nothing has happened yet.
    Initial,
    /// Bytes are being streamed onto the device.
    Running,
    /// The image was written and flushed in full.
    Success,
    /// The image file could not be stat'd; the device is untouched.
    GetFileSizeFailed,
    /// The write failed after it started; the device may be partially
    /// written.
    InstallFailed,
}

/// The final report of a disk write: the observed terminal state plus a
/// human-readable detail for the failure states.
#[derive(Clone, Debug)]
pub struct WriteReport {
    pub state: WriteState,
    pub detail: Option<String>,
}

impl WriteReport {
    fn failed(state: WriteState, detail: String) -> Self {
        WriteReport {
            state,
            detail: Some(detail),
        }
    }

    fn detail_or(&self, fallback: &str) -> String {
        self.detail.clone().unwrap_or_else(|| fallback.to_string())
    }

    /// Maps the observed state to the run's error taxonomy.
    ///
    /// `Initial` or `Running` observed after the operation claims to be
    /// finished is an internal-consistency fault: it is reported as an
    /// explicit error, never coerced to success.
    pub fn verdict(&self) -> Result<()> {
        match self.state {
            WriteState::Success => Ok(()),
            WriteState::GetFileSizeFailed => {
                Err(Error::GetFileSize(self.detail_or("stat failed")))
            }
            WriteState::InstallFailed => Err(Error::Install(self.detail_or("write failed"))),
            WriteState::Initial | WriteState::Running => Err(Error::InternalState(format!(
                "disk write claims completion while still {:?}",
                self.state
            ))),
        }
    }
}

/// Disk-write backend. The production implementation is
/// [`RawDeviceWriter`]; tests substitute scripted fakes.
pub trait ImageWriter: Send + Sync {
    /// Writes `image` onto `device`, reporting `(bytes_written, total)`
    /// progress. Always returns a report; failures are encoded in the
    /// report's state rather than an `Err`, so the caller can apply the
    /// state-machine verdict uniformly.
    fn write_image(
        &self,
        device: &Device,
        image: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> WriteReport;
}

/// Streams an image onto a block device with unbuffered I/O.
pub struct RawDeviceWriter {
    /// Open the device with `O_DIRECT`. Disabled in tests that target a
    /// plain file instead of a block device.
    pub direct_io: bool,
}

impl Default for RawDeviceWriter {
    fn default() -> Self {
        RawDeviceWriter { direct_io: true }
    }
}

impl RawDeviceWriter {
    /// The device's live capacity via `BLKGETSIZE64`, when available.
    /// Falls back to the enumerated size for non-block targets.
    #[cfg(unix)]
    fn device_capacity(device_file: &File, fallback: u64) -> u64 {
        use std::os::unix::io::AsRawFd;
        let mut size: u64 = 0;
        match unsafe { blkgetsize64(device_file.as_raw_fd(), &mut size) } {
            Ok(_) if size > 0 => size,
            _ => fallback,
        }
    }

    #[cfg(not(unix))]
    fn device_capacity(_device_file: &File, fallback: u64) -> u64 {
        fallback
    }

    fn open_device(&self, path: &Path) -> std::io::Result<File> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true);
        #[cfg(unix)]
        if self.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        options.open(path)
    }

    fn stream(
        &self,
        mut image_file: File,
        mut device_file: File,
        image_len: u64,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> std::result::Result<(), String> {
        // O_DIRECT requires 512-byte aligned buffers; over-allocate and
        // slice at the alignment offset.
        let mut buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
        let buffer = &mut buf[offset..offset + BUFFER_SIZE];

        let mut written: u64 = 0;
        while written < image_len {
            if !running.load(Ordering::SeqCst) {
                return Err("operation cancelled by user".to_string());
            }

            let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
            image_file
                .read_exact(&mut buffer[..to_read])
                .map_err(|e| format!("could not read image: {e}"))?;

            // The final chunk may not be block-aligned; pad with zeros so
            // O_DIRECT accepts it.
            let padded = if self.direct_io && to_read % BLOCK_SIZE != 0 {
                let pad = to_read.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                buffer[to_read..pad].fill(0);
                pad
            } else {
                to_read
            };

            device_file
                .write_all(&buffer[..padded])
                .map_err(|e| format!("could not write to device: {e}"))?;
            written += to_read as u64;
            on_progress(written, image_len);
        }

        device_file
            .flush()
            .map_err(|e| format!("could not flush device: {e}"))
    }
}

impl ImageWriter for RawDeviceWriter {
    fn write_image(
        &self,
        device: &Device,
        image: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> WriteReport {
        // Pre-write check: a stat failure is reported distinctly because
        // the device is untouched and the user can retry safely.
        let image_len = match std::fs::metadata(image) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(image = %image.display(), "could not stat image: {e}");
                return WriteReport::failed(
                    WriteState::GetFileSizeFailed,
                    format!("{}: {e}", image.display()),
                );
            }
        };

        let image_file = match File::open(image) {
            Ok(f) => f,
            Err(e) => {
                return WriteReport::failed(
                    WriteState::InstallFailed,
                    format!("could not open image: {e}"),
                );
            }
        };
        let device_file = match self.open_device(&device.path) {
            Ok(f) => f,
            Err(e) => {
                return WriteReport::failed(
                    WriteState::InstallFailed,
                    format!("could not open {}: {e}", device.path.display()),
                );
            }
        };

        let capacity = Self::device_capacity(&device_file, device.size_bytes);
        if capacity > 0 && image_len > capacity {
            return WriteReport::failed(
                WriteState::InstallFailed,
                format!("image ({image_len} bytes) exceeds device capacity ({capacity} bytes)"),
            );
        }

        info!(device = %device.path.display(), image_len, "writing image to device");

        let state = match self.stream(image_file, device_file, image_len, running, on_progress)
        {
            Ok(()) => {
                info!(device = %device.path.display(), "write complete");
                WriteState::Success
            }
            Err(detail) => {
                return WriteReport::failed(WriteState::InstallFailed, detail);
            }
        };

        WriteReport {
            state,
            detail: None,
        }
    }
}
