//! Fetches a remote image archive to local storage.
//!
//! The transfer streams to a file in the scratch directory in fixed-size
//! chunks, reporting byte-level progress as data arrives. The advertised
//! content length may be unknown until response headers are parsed, so
//! progress carries an `Option<u64>` total. A transfer whose byte count
//! does not match a known content length is a truncated transfer and is
//! reported as a network error, never as silent success.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// The artifact of a completed download. Owned by the run that produced
/// it; a restart invalidates it along with the file it points to.
#[derive(Clone, Debug)]
pub struct DownloadResult {
    /// Local path of the fetched archive.
    pub path: PathBuf,
    /// Total bytes written to disk.
    pub total_bytes: u64,
    /// True once the transfer ran to completion.
    pub complete: bool,
}

/// Transfer backend for the download stage. The production implementation
/// is [`HttpFetcher`]; tests substitute scripted fakes.
pub trait Fetcher: Send + Sync {
    /// Fetches `url` into `dest`, invoking `on_progress` with
    /// `(bytes_so_far, total_bytes)` as data arrives.
    ///
    /// `running` is the cooperative cancellation flag: when it goes
    /// false the transfer aborts, the partial file is deleted, and
    /// [`Error::Cancelled`] is returned. Cancellation is safe at any
    /// point, including before any bytes arrive.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<DownloadResult>;
}

/// Streams an HTTP(S) URL to a local file.
pub struct HttpFetcher;

impl HttpFetcher {
    fn transfer(
        mut reader: impl Read,
        dest: &Path,
        total: Option<u64>,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64> {
        let mut file = File::create(dest)
            .map_err(|e| Error::Network(format!("could not create {}: {e}", dest.display())))?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .map_err(|e| Error::Network(format!("transfer interrupted: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| Error::Network(format!("could not write download: {e}")))?;
            written += n as u64;
            on_progress(written, total);
        }
        file.flush()
            .map_err(|e| Error::Network(format!("could not flush download: {e}")))?;

        if let Some(expected) = total {
            if written != expected {
                return Err(Error::Network(format!(
                    "truncated transfer: got {written} of {expected} bytes"
                )));
            }
        }
        Ok(written)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<DownloadResult> {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        debug!(url, "starting download");
        let response = ureq::get(url)
            .call()
            .map_err(|e| Error::Network(e.to_string()))?;
        let total = response.body().content_length();
        let reader = response.into_body().into_reader();

        let result = Self::transfer(reader, dest, total, running, on_progress);
        match result {
            Ok(total_bytes) => {
                info!(url, total_bytes, "download complete");
                Ok(DownloadResult {
                    path: dest.to_path_buf(),
                    total_bytes,
                    complete: true,
                })
            }
            Err(e) => {
                // Never leave a partial archive behind.
                let _ = fs::remove_file(dest);
                Err(e)
            }
        }
    }
}
