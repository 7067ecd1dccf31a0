//! Decompresses a downloaded archive into the raw installable image.
//!
//! The archive has a fixed known layout: exactly one raw-image member.
//! Zip archives are unpacked via the `zip` crate; single-member compressed
//! streams (`.gz`, `.xz`, `.zst`) are decoded directly. Extraction writes
//! through a temp file in the destination directory and persists over the
//! fixed destination name, so a prior run's image is overwritten whole or
//! not at all.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::{Error, Result};

/// The raw image produced by extraction, ready to write to a device.
/// Produced at most once per run and invalidated at restart.
#[derive(Clone, Debug)]
pub struct ExtractedImage {
    pub path: PathBuf,
}

/// Extraction backend. The production implementation is
/// [`ArchiveExtractor`]; tests substitute scripted fakes.
pub trait Extractor: Send + Sync {
    /// Extracts the raw image member of `archive` to `dest`, overwriting
    /// any earlier extraction at that path.
    fn extract(&self, archive: &Path, dest: &Path, running: &AtomicBool)
    -> Result<ExtractedImage>;
}

/// Extracts the single raw-image member from a downloaded archive.
pub struct ArchiveExtractor;

/// File suffixes that identify the raw image member inside a zip archive.
const IMAGE_SUFFIXES: [&str; 2] = [".bin", ".img"];

impl ArchiveExtractor {
    fn copy_cancellable(
        mut reader: impl Read,
        dest: &Path,
        running: &AtomicBool,
    ) -> Result<()> {
        let dest_dir = dest.parent().unwrap_or(Path::new("."));
        let temp = NamedTempFile::new_in(dest_dir)
            .map_err(|e| Error::Extraction(format!("could not create temp file: {e}")))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            let mut buf = [0u8; 8192];
            loop {
                if !running.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
                let n = reader
                    .read(&mut buf)
                    .map_err(|e| Error::Extraction(format!("archive is unreadable: {e}")))?;
                if n == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..n])
                    .map_err(|e| Error::Extraction(format!("could not write image: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| Error::Extraction(format!("could not write image: {e}")))?;
        }
        temp.persist(dest).map_err(|e| {
            Error::Extraction(format!("could not persist {}: {e}", dest.display()))
        })?;
        Ok(())
    }

    fn extract_zip(archive: &Path, dest: &Path, running: &AtomicBool) -> Result<()> {
        let file = File::open(archive)
            .map_err(|e| Error::Extraction(format!("could not open archive: {e}")))?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file))
            .map_err(|e| Error::Extraction(format!("archive is unreadable: {e}")))?;

        let mut member_index = None;
        for i in 0..zip.len() {
            let entry = zip
                .by_index(i)
                .map_err(|e| Error::Extraction(format!("archive is unreadable: {e}")))?;
            let name = entry.name().to_lowercase();
            if entry.is_file() && IMAGE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                member_index = Some(i);
                break;
            }
        }
        let index = member_index.ok_or_else(|| {
            Error::Extraction("archive does not contain a raw image member".into())
        })?;

        let entry = zip
            .by_index(index)
            .map_err(|e| Error::Extraction(format!("archive is unreadable: {e}")))?;
        debug!(member = %entry.name(), "extracting zip member");
        Self::copy_cancellable(entry, dest, running)
    }

    fn extract_stream(archive: &Path, dest: &Path, running: &AtomicBool, ext: &str) -> Result<()> {
        let file = File::open(archive)
            .map_err(|e| Error::Extraction(format!("could not open archive: {e}")))?;
        let reader: Box<dyn Read> = match ext {
            "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(file))),
            "xz" => Box::new(XzDecoder::new(BufReader::new(file))),
            "zst" | "zstd" => Box::new(
                ZstdDecoder::new(BufReader::new(file))
                    .map_err(|e| Error::Extraction(format!("archive is unreadable: {e}")))?,
            ),
            other => {
                return Err(Error::Extraction(format!(
                    "unsupported archive format: .{other}"
                )));
            }
        };
        Self::copy_cancellable(reader, dest, running)
    }
}

impl Extractor for ArchiveExtractor {
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        running: &AtomicBool,
    ) -> Result<ExtractedImage> {
        let ext = archive
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "zip" => Self::extract_zip(archive, dest, running)?,
            other => Self::extract_stream(archive, dest, running, other)?,
        }

        info!(image = %dest.display(), "extraction complete");
        Ok(ExtractedImage {
            path: dest.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn running() -> AtomicBool {
        AtomicBool::new(true)
    }

    fn write_zip(path: &Path, member: &str, payload: &[u8]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(member, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(payload).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_the_raw_image_member_from_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.bin.zip");
        let dest = dir.path().join("installer.img");
        write_zip(&archive, "cloud-image.bin", b"raw image payload");

        let image = ArchiveExtractor
            .extract(&archive, &dest, &running())
            .unwrap();
        assert_eq!(image.path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"raw image payload");
    }

    #[test]
    fn zip_without_an_image_member_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.zip");
        let dest = dir.path().join("installer.img");
        write_zip(&archive, "README.txt", b"not an image");

        let err = ArchiveExtractor
            .extract(&archive, &dest, &running())
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn extracts_a_gzip_stream() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.img.gz");
        let dest = dir.path().join("installer.img");

        let file = File::create(&archive).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        encoder.write_all(b"gzipped payload").unwrap();
        encoder.finish().unwrap();

        ArchiveExtractor
            .extract(&archive, &dest, &running())
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"gzipped payload");
    }

    #[test]
    fn overwrites_a_prior_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.bin.zip");
        let dest = dir.path().join("installer.img");
        std::fs::write(&dest, b"stale image from an earlier run").unwrap();
        write_zip(&archive, "fresh.bin", b"fresh");

        ArchiveExtractor
            .extract(&archive, &dest, &running())
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[test]
    fn unreadable_archive_is_an_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("missing.zip");
        let dest = dir.path().join("installer.img");

        let err = ArchiveExtractor
            .extract(&archive, &dest, &running())
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }
}
