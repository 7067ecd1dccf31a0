//! End-to-end controller scenarios with scripted stage backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use usbforge_core::catalog::{DeviceCatalog, DeviceEnumerator};
use usbforge_core::device::Device;
use usbforge_core::download::{DownloadResult, Fetcher};
use usbforge_core::error::{Error, Result};
use usbforge_core::extract::{ExtractedImage, Extractor};
use usbforge_core::pipeline::{
    ImageSource, PipelineConfig, PipelineController, PipelineEvent, Progress, Stage,
    StageBackends,
};
use usbforge_core::write::{ImageWriter, WriteReport, WriteState};

const WAIT: Duration = Duration::from_secs(5);

fn sandisk() -> Device {
    Device {
        id: 1,
        name: "SanDisk 16GB".to_string(),
        size_bytes: 16_000_000_000,
        path: PathBuf::from("/dev/sdz"),
    }
}

fn source() -> ImageSource {
    ImageSource::new("http://example.invalid/mirror/image.bin.zip", "64-bit")
}

/// Returns each scripted enumeration once, then repeats the last one.
struct ScriptedEnumerator {
    responses: Mutex<Vec<Vec<Device>>>,
    calls: AtomicU32,
}

impl ScriptedEnumerator {
    fn new(responses: Vec<Vec<Device>>) -> Arc<Self> {
        Arc::new(ScriptedEnumerator {
            responses: Mutex::new(responses),
            calls: AtomicU32::new(0),
        })
    }
}

impl DeviceEnumerator for ScriptedEnumerator {
    fn enumerate(&self) -> Result<Vec<Device>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            Ok(responses.remove(0))
        } else {
            Ok(responses.first().cloned().unwrap_or_default())
        }
    }
}

/// Shares one [`ScriptedEnumerator`] between the catalog and the test's
/// call-count assertions.
struct EnumeratorHandle(Arc<ScriptedEnumerator>);

impl DeviceEnumerator for EnumeratorHandle {
    fn enumerate(&self) -> Result<Vec<Device>> {
        self.0.enumerate()
    }
}

/// Delivers the scripted progress pairs, writes the archive, and counts
/// invocations so tests can assert whether a re-download happened.
struct ScriptedFetcher {
    calls: AtomicU32,
}

impl ScriptedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedFetcher {
            calls: AtomicU32::new(0),
        })
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(
        &self,
        _url: &str,
        dest: &Path,
        _running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<DownloadResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_progress(500, Some(1000));
        on_progress(1000, Some(1000));
        std::fs::write(dest, vec![7u8; 1000]).expect("write scripted archive");
        Ok(DownloadResult {
            path: dest.to_path_buf(),
            total_bytes: 1000,
            complete: true,
        })
    }
}

/// Writes a partial file, then parks until cancelled, honoring the
/// downloader contract of deleting the partial on the way out.
struct BlockingFetcher;

impl Fetcher for BlockingFetcher {
    fn fetch(
        &self,
        _url: &str,
        dest: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<DownloadResult> {
        std::fs::write(dest, vec![7u8; 100]).expect("write partial archive");
        on_progress(100, Some(1000));
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = std::fs::remove_file(dest);
        Err(Error::Cancelled)
    }
}

struct InstantExtractor;

impl Extractor for InstantExtractor {
    fn extract(
        &self,
        _archive: &Path,
        dest: &Path,
        _running: &AtomicBool,
    ) -> Result<ExtractedImage> {
        std::fs::write(dest, b"raw image").expect("write scripted image");
        Ok(ExtractedImage {
            path: dest.to_path_buf(),
        })
    }
}

struct ScriptedWriter(WriteState);

impl ImageWriter for ScriptedWriter {
    fn write_image(
        &self,
        _device: &Device,
        _image: &Path,
        _running: &AtomicBool,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> WriteReport {
        on_progress(1, 1);
        WriteReport {
            state: self.0,
            detail: Some("scripted".to_string()),
        }
    }
}

fn config(dir: &Path, reuse_extracted: bool) -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::from_millis(20),
        scratch_dir: dir.to_path_buf(),
        reuse_extracted,
    }
}

fn next_matching<F>(events: &Receiver<PipelineEvent>, mut pred: F) -> Vec<PipelineEvent>
where
    F: FnMut(&PipelineEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("timed out; events so far: {seen:?}"));
        let event = events
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("timed out; events so far: {seen:?}"));
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn stage_changed(stage: Stage) -> impl FnMut(&PipelineEvent) -> bool {
    move |e| matches!(e, PipelineEvent::StageChanged { stage: s } if *s == stage)
}

#[test]
fn polling_surfaces_devices_only_after_a_nonempty_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let enumerator = ScriptedEnumerator::new(vec![vec![], vec![], vec![sandisk()]]);
    let fetcher = ScriptedFetcher::new();
    let backends = StageBackends {
        catalog: Arc::new(DeviceCatalog::with_enumerator(Box::new(EnumeratorHandle(
            Arc::clone(&enumerator),
        )))),
        fetcher: Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        extractor: Arc::new(InstantExtractor),
        writer: Arc::new(ScriptedWriter(WriteState::Success)),
    };
    let controller = PipelineController::spawn(config(dir.path(), false), backends);
    let events = controller.events().clone();

    let seen = next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));

    // The empty refreshes produced no device event and no stage change
    // out of device selection.
    assert!(enumerator.calls.load(Ordering::SeqCst) >= 3);
    assert!(!seen.iter().any(|e| matches!(
        e,
        PipelineEvent::StageChanged {
            stage: Stage::Downloading
        }
    )));
    let PipelineEvent::Devices { list } = seen.last().unwrap() else {
        unreachable!()
    };
    assert_eq!(list.len(), 1);
    assert_eq!(list.by_id(1).unwrap(), &sandisk());

    // Only now does the transition out of SelectingDevice fire.
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();
    next_matching(&events, stage_changed(Stage::Downloading));
}

#[test]
fn download_progress_is_delivered_before_extraction_begins() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    let backends = StageBackends {
        catalog: Arc::new(DeviceCatalog::with_enumerator(Box::new(
            EnumeratorHandle(ScriptedEnumerator::new(vec![vec![sandisk()]])),
        ))),
        fetcher: Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        extractor: Arc::new(InstantExtractor),
        writer: Arc::new(ScriptedWriter(WriteState::Success)),
    };
    let controller = PipelineController::spawn(config(dir.path(), false), backends);
    let events = controller.events().clone();

    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();

    let seen = next_matching(&events, stage_changed(Stage::Extracting));
    let fractions: Vec<f64> = seen
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress {
                stage: Stage::Downloading,
                progress: Progress::Fraction(f),
            } => Some(*f),
            _ => None,
        })
        .collect();
    assert_eq!(fractions, vec![0.5, 1.0]);

    // The run continues through to success.
    let seen = next_matching(&events, |e| matches!(e, PipelineEvent::Finished { .. }));
    assert!(seen.iter().any(|e| matches!(
        e,
        PipelineEvent::StageChanged {
            stage: Stage::Succeeded
        }
    )));
}

#[test]
fn write_failure_surfaces_the_exact_error_and_restart_requires_redownload() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    let backends = StageBackends {
        catalog: Arc::new(DeviceCatalog::with_enumerator(Box::new(
            EnumeratorHandle(ScriptedEnumerator::new(vec![vec![sandisk()]])),
        ))),
        fetcher: Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        extractor: Arc::new(InstantExtractor),
        writer: Arc::new(ScriptedWriter(WriteState::GetFileSizeFailed)),
    };
    let controller = PipelineController::spawn(config(dir.path(), false), backends);
    let events = controller.events().clone();

    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();

    let seen = next_matching(&events, |e| matches!(e, PipelineEvent::Failed { .. }));
    let PipelineEvent::Failed { stage, error } = seen.last().unwrap() else {
        unreachable!()
    };
    assert_eq!(*stage, Stage::Writing);
    assert!(matches!(error, Error::GetFileSize(_)));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // Default policy: a restart is a fully fresh run, so the pipeline
    // must pass through Downloading again.
    controller.restart();
    next_matching(&events, stage_changed(Stage::SelectingDevice));
    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();
    next_matching(&events, stage_changed(Stage::Downloading));
    next_matching(&events, |e| matches!(e, PipelineEvent::Failed { .. }));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn reuse_extracted_restart_short_circuits_to_writing() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    let backends = StageBackends {
        catalog: Arc::new(DeviceCatalog::with_enumerator(Box::new(
            EnumeratorHandle(ScriptedEnumerator::new(vec![vec![sandisk()]])),
        ))),
        fetcher: Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        extractor: Arc::new(InstantExtractor),
        writer: Arc::new(ScriptedWriter(WriteState::GetFileSizeFailed)),
    };
    let controller = PipelineController::spawn(config(dir.path(), true), backends);
    let events = controller.events().clone();

    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();
    next_matching(&events, |e| matches!(e, PipelineEvent::Failed { .. }));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // The extracted image survived the failed write, so the new run may
    // skip straight from device selection to writing.
    controller.restart();
    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.select_device(1);
    controller.advance();
    let seen = next_matching(&events, stage_changed(Stage::Writing));
    assert!(!seen.iter().any(|e| matches!(
        e,
        PipelineEvent::StageChanged {
            stage: Stage::Downloading
        }
    )));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_mid_download_removes_the_partial_and_allows_reselection() {
    let dir = tempfile::tempdir().unwrap();
    let backends = StageBackends {
        catalog: Arc::new(DeviceCatalog::with_enumerator(Box::new(
            EnumeratorHandle(ScriptedEnumerator::new(vec![vec![sandisk()]])),
        ))),
        fetcher: Arc::new(BlockingFetcher),
        extractor: Arc::new(InstantExtractor),
        writer: Arc::new(ScriptedWriter(WriteState::Success)),
    };
    let controller = PipelineController::spawn(config(dir.path(), false), backends);
    let events = controller.events().clone();

    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();

    // Wait for the transfer to actually start before cancelling.
    next_matching(&events, |e| {
        matches!(
            e,
            PipelineEvent::Progress {
                stage: Stage::Downloading,
                ..
            }
        )
    });
    let partial = dir.path().join("image.bin.zip");
    assert!(partial.exists());

    controller.cancel();
    next_matching(&events, stage_changed(Stage::SelectingDevice));

    // The worker notices the flag and deletes the partial shortly after.
    let deadline = Instant::now() + WAIT;
    while partial.exists() {
        assert!(Instant::now() < deadline, "partial download was not removed");
        std::thread::sleep(Duration::from_millis(10));
    }

    // A fresh selection works without leftover-file errors.
    next_matching(&events, |e| matches!(e, PipelineEvent::Devices { .. }));
    controller.choose_image(source());
    controller.select_device(1);
    controller.advance();
    next_matching(&events, stage_changed(Stage::Downloading));
}
