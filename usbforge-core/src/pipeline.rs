//! The pipeline orchestrator.
//!
//! One [`PipelineController`] drives one run at a time through the stages
//! `SelectingDevice -> Downloading -> Extracting -> Writing` and into a
//! terminal `Succeeded` or `Failed`. The controller's coordinator thread
//! is the single writer of run state; front-ends issue commands and read
//! the event feed. Long-running work (device polling, the download
//! transfer, extraction, the disk write) runs on its own worker thread so
//! the coordinator never blocks on device or network I/O and stays
//! responsive to a cancel at all times.
//!
//! Every worker holds a clone of the [`ErrorChannel`]; a post to it from
//! any stage preempts the current stage and ends the run in `Failed`.
//! Recovery is always a fresh run via `restart`, never an in-place retry.
//!
//! Ordering guarantee: workers write progress to the same FIFO event
//! channel they report on, and the coordinator emits a stage change only
//! after consuming the worker's outcome, so a stage's completion is never
//! observed ahead of its progress events.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use tracing::{debug, info, warn};

use crate::catalog::DeviceCatalog;
use crate::device::{Device, DeviceList};
use crate::download::{DownloadResult, Fetcher, HttpFetcher};
use crate::error::Error;
use crate::extract::{ArchiveExtractor, ExtractedImage, Extractor};
use crate::write::{ImageWriter, RawDeviceWriter};

/// Fixed name of the extracted raw image inside the scratch directory.
const IMAGE_FILE_NAME: &str = "installer.img";

/// One sequential phase of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    SelectingDevice,
    Downloading,
    Extracting,
    Writing,
    Succeeded,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SelectingDevice => "selecting device",
            Stage::Downloading => "downloading",
            Stage::Extracting => "extracting",
            Stage::Writing => "writing",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A progress signal: either a known completion fraction or "working,
/// completion unknown".
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Progress {
    Indeterminate,
    Fraction(f64),
}

/// A remote image to download: URL plus a human label. Immutable, chosen
/// once per run.
#[derive(Clone, Debug)]
pub struct ImageSource {
    pub url: String,
    pub label: String,
}

impl ImageSource {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        ImageSource {
            url: url.into(),
            label: label.into(),
        }
    }
}

/// The aggregate state of one run. Created at run start, mutated only by
/// the coordinator as stages complete, and discarded wholesale on restart
/// so no stale artifact references survive into the next run.
#[derive(Debug)]
pub struct PipelineRun {
    pub device: Option<Device>,
    pub source: Option<ImageSource>,
    pub download: Option<DownloadResult>,
    pub image: Option<ExtractedImage>,
    pub stage: Stage,
    pub error: Option<Error>,
    started: Instant,
}

impl PipelineRun {
    fn new() -> Self {
        PipelineRun {
            device: None,
            source: None,
            download: None,
            image: None,
            stage: Stage::SelectingDevice,
            error: None,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The subscription feed a front-end consumes.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// The run entered a new stage.
    StageChanged { stage: Stage },
    /// Device polling produced a non-empty list; polling has stopped.
    Devices { list: DeviceList },
    /// Progress within the named stage.
    Progress { stage: Stage, progress: Progress },
    /// A command was invalid in the current state. Not terminal.
    Rejected { reason: String },
    /// Terminal success record with the run's wall-clock duration.
    Finished { elapsed: Duration },
    /// Terminal failure record with the originating stage.
    Failed { stage: Stage, error: Error },
}

/// Commands a front-end can issue.
#[derive(Debug)]
enum Command {
    SelectDevice(u32),
    ChooseImage(ImageSource),
    Advance,
    Cancel,
    Restart,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Device-list polling interval while no device is attached.
    pub poll_interval: Duration,
    /// Directory for the downloaded archive and the extracted image.
    pub scratch_dir: PathBuf,
    /// When true, a restart carries the previous run's verified extracted
    /// image into the new run, arming the short-circuit that skips the
    /// download and extraction stages. Off by default: each restart is a
    /// fully fresh run.
    pub reuse_extracted: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            poll_interval: Duration::from_millis(1000),
            scratch_dir: std::env::temp_dir().join("usbforge"),
            reuse_extracted: false,
        }
    }
}

/// The four stage backends the controller sequences. Production code uses
/// [`StageBackends::system`]; tests wire in fakes.
pub struct StageBackends {
    pub catalog: Arc<DeviceCatalog>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub writer: Arc<dyn ImageWriter>,
}

impl StageBackends {
    pub fn system() -> Self {
        StageBackends {
            catalog: Arc::new(DeviceCatalog::system()),
            fetcher: Arc::new(HttpFetcher),
            extractor: Arc::new(ArchiveExtractor),
            writer: Arc::new(RawDeviceWriter::default()),
        }
    }
}

/// A stage failure as posted to the [`ErrorChannel`].
#[derive(Clone, Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: Error,
}

struct TaggedFailure {
    run_id: u64,
    failure: StageFailure,
}

/// The single sink any stage posts terminal failures to. Cloned into
/// every worker; posts from a cancelled run are discarded by the
/// coordinator via the run tag.
#[derive(Clone)]
pub struct ErrorChannel {
    run_id: u64,
    tx: Sender<TaggedFailure>,
}

impl ErrorChannel {
    pub fn post(&self, stage: Stage, error: Error) {
        let _ = self.tx.send(TaggedFailure {
            run_id: self.run_id,
            failure: StageFailure { stage, error },
        });
    }
}

/// What a stage worker hands back on success.
enum StageOutcome {
    Devices(DeviceList),
    Downloaded(DownloadResult),
    Extracted(ExtractedImage),
    Written(crate::write::WriteReport),
}

struct TaggedOutcome {
    run_id: u64,
    outcome: StageOutcome,
}

/// The coordinator: single owner and single writer of the run state.
struct Coordinator {
    config: PipelineConfig,
    backends: StageBackends,
    run: PipelineRun,
    devices: Option<DeviceList>,
    /// Bumped on every cancel/restart; messages tagged with an older id
    /// belong to a torn-down run and are dropped.
    run_id: u64,
    /// Cooperative "keep going" flag shared with the current run's
    /// workers. Replaced, not reset, when a new run starts.
    active: Arc<AtomicBool>,
    events_tx: Sender<PipelineEvent>,
    outcome_tx: Sender<TaggedOutcome>,
    outcome_rx: Receiver<TaggedOutcome>,
    error_tx: Sender<TaggedFailure>,
    error_rx: Receiver<TaggedFailure>,
}

impl Coordinator {
    fn new(config: PipelineConfig, backends: StageBackends) -> (Self, Receiver<PipelineEvent>) {
        let (events_tx, events_rx) = unbounded();
        let (outcome_tx, outcome_rx) = unbounded();
        let (error_tx, error_rx) = unbounded();
        let coordinator = Coordinator {
            config,
            backends,
            run: PipelineRun::new(),
            devices: None,
            run_id: 0,
            active: Arc::new(AtomicBool::new(true)),
            events_tx,
            outcome_tx,
            outcome_rx,
            error_tx,
            error_rx,
        };
        (coordinator, events_rx)
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn error_channel(&self) -> ErrorChannel {
        ErrorChannel {
            run_id: self.run_id,
            tx: self.error_tx.clone(),
        }
    }

    fn archive_dest(&self) -> PathBuf {
        let name = self
            .run
            .source
            .as_ref()
            .and_then(|s| {
                s.url
                    .split('?')
                    .next()
                    .and_then(|base| base.rsplit('/').next())
                    .filter(|n| !n.is_empty())
            })
            .unwrap_or("image-archive.zip");
        self.config.scratch_dir.join(name)
    }

    fn image_dest(&self) -> PathBuf {
        self.config.scratch_dir.join(IMAGE_FILE_NAME)
    }

    fn start(&mut self) {
        self.emit(PipelineEvent::StageChanged {
            stage: Stage::SelectingDevice,
        });
        self.spawn_device_poller();
    }

    fn run_loop(mut self, commands: Receiver<Command>) {
        self.start();
        let outcome_rx = self.outcome_rx.clone();
        let error_rx = self.error_rx.clone();
        loop {
            select! {
                recv(commands) -> msg => match msg {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(outcome_rx) -> msg => if let Ok(tagged) = msg {
                    self.handle_outcome(tagged);
                },
                recv(error_rx) -> msg => if let Ok(tagged) = msg {
                    self.handle_failure(tagged);
                },
            }
        }
        // Stop whatever worker is still running before the thread exits.
        self.active.store(false, Ordering::SeqCst);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectDevice(id) => self.select_device(id),
            Command::ChooseImage(source) => self.choose_image(source),
            Command::Advance => self.advance(),
            Command::Cancel => self.cancel(),
            Command::Restart => self.restart(),
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn select_device(&mut self, id: u32) {
        if self.run.stage != Stage::SelectingDevice {
            self.reject(format!(
                "cannot select a device while {}",
                self.run.stage
            ));
            return;
        }
        let Some(devices) = &self.devices else {
            self.reject("no device list available yet".to_string());
            return;
        };
        match devices.by_id(id) {
            Ok(device) => {
                info!(id, name = %device.name, "device selected");
                self.run.device = Some(device.clone());
            }
            Err(e) => self.reject(e.to_string()),
        }
    }

    fn choose_image(&mut self, source: ImageSource) {
        if self.run.stage != Stage::SelectingDevice {
            self.reject(format!(
                "cannot choose an image while {}",
                self.run.stage
            ));
            return;
        }
        info!(label = %source.label, url = %source.url, "image source chosen");
        self.run.source = Some(source);
    }

    /// The (state, event) transition out of device selection. Later
    /// transitions fire automatically as stage outcomes arrive.
    fn advance(&mut self) {
        match self.run.stage {
            Stage::SelectingDevice => {
                if self.run.device.is_none() {
                    self.reject("no device selected".to_string());
                } else if self.run.image.is_some() {
                    // A usable image already exists for this run: skip
                    // straight to the write.
                    self.start_writing();
                } else if self.run.source.is_none() {
                    self.reject("no image source chosen".to_string());
                } else {
                    self.start_downloading();
                }
            }
            Stage::Succeeded | Stage::Failed => {
                self.reject("run is finished; use restart".to_string());
            }
            stage => {
                self.reject(format!("pipeline advances automatically while {stage}"));
            }
        }
    }

    fn cancel(&mut self) {
        info!(stage = %self.run.stage, "cancel requested");
        self.reset();
    }

    fn restart(&mut self) {
        if !self.run.stage.is_terminal() {
            self.reject("cancel the active run before restarting".to_string());
            return;
        }
        info!("starting a fresh run");
        self.reset();
    }

    /// Tears the current run down and re-enters device selection with a
    /// brand-new [`PipelineRun`]. Artifacts of the old run are deleted,
    /// except that `reuse_extracted` may carry a verified image forward.
    fn reset(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.active = Arc::new(AtomicBool::new(true));
        self.run_id += 1;

        let prior = std::mem::replace(&mut self.run, PipelineRun::new());
        let keep_image = self.config.reuse_extracted;
        Self::cleanup_artifacts(&prior, keep_image);
        if keep_image {
            self.run.image = prior.image;
        }

        self.devices = None;
        self.emit(PipelineEvent::StageChanged {
            stage: Stage::SelectingDevice,
        });
        self.spawn_device_poller();
    }

    fn cleanup_artifacts(run: &PipelineRun, keep_image: bool) {
        if let Some(download) = &run.download {
            let _ = std::fs::remove_file(&download.path);
        }
        if !keep_image {
            if let Some(image) = &run.image {
                let _ = std::fs::remove_file(&image.path);
            }
        }
    }

    fn reject(&self, reason: String) {
        debug!(%reason, "command rejected");
        self.emit(PipelineEvent::Rejected { reason });
    }

    fn transition(&mut self, stage: Stage) {
        debug!(from = %self.run.stage, to = %stage, "stage transition");
        self.run.stage = stage;
        self.emit(PipelineEvent::StageChanged { stage });
    }

    fn fail(&mut self, stage: Stage, error: Error) {
        warn!(%stage, %error, "run failed");
        self.active.store(false, Ordering::SeqCst);
        self.run.error = Some(error.clone());
        self.transition(Stage::Failed);
        self.emit(PipelineEvent::Failed { stage, error });
    }

    fn succeed(&mut self) {
        let elapsed = self.run.elapsed();
        info!(?elapsed, "usb installer created");
        self.transition(Stage::Succeeded);
        self.emit(PipelineEvent::Finished { elapsed });
        // The archive has served its purpose either way; only the
        // extracted image may be worth keeping for the next run.
        Self::cleanup_artifacts(&self.run, self.config.reuse_extracted);
    }

    fn handle_outcome(&mut self, tagged: TaggedOutcome) {
        if tagged.run_id != self.run_id {
            debug!("dropping outcome from a torn-down run");
            return;
        }
        match (self.run.stage, tagged.outcome) {
            (Stage::SelectingDevice, StageOutcome::Devices(list)) => {
                info!(count = list.len(), "devices available");
                self.devices = Some(list.clone());
                self.emit(PipelineEvent::Devices { list });
            }
            (Stage::Downloading, StageOutcome::Downloaded(result)) => {
                self.run.download = Some(result);
                self.start_extracting();
            }
            (Stage::Extracting, StageOutcome::Extracted(image)) => {
                self.run.image = Some(image);
                self.start_writing();
            }
            (Stage::Writing, StageOutcome::Written(report)) => match report.verdict() {
                Ok(()) => self.succeed(),
                Err(error) => self.fail(Stage::Writing, error),
            },
            (stage, _) => {
                // A live worker reporting for the wrong stage is an
                // invariant violation, not a recoverable hiccup.
                self.fail(
                    stage,
                    Error::InternalState(format!("unexpected stage outcome while {stage}")),
                );
            }
        }
    }

    fn handle_failure(&mut self, tagged: TaggedFailure) {
        if tagged.run_id != self.run_id {
            debug!("dropping failure from a torn-down run");
            return;
        }
        self.fail(tagged.failure.stage, tagged.failure.error);
    }

    /// Polls the catalog on a worker thread until a non-empty list shows
    /// up, then stops. Enumeration errors are logged and retried; they do
    /// not fail the run.
    fn spawn_device_poller(&self) {
        let catalog = Arc::clone(&self.backends.catalog);
        let interval = self.config.poll_interval;
        let active = Arc::clone(&self.active);
        let outcome_tx = self.outcome_tx.clone();
        let run_id = self.run_id;

        thread::spawn(move || {
            loop {
                if !active.load(Ordering::SeqCst) {
                    return;
                }
                match catalog.refresh() {
                    Ok(list) if !list.is_empty() => {
                        let _ = outcome_tx.send(TaggedOutcome {
                            run_id,
                            outcome: StageOutcome::Devices(list),
                        });
                        return;
                    }
                    Ok(_) => debug!("no removable devices yet"),
                    Err(e) => warn!("device refresh failed: {e}"),
                }
                thread::sleep(interval);
            }
        });
    }

    fn start_downloading(&mut self) {
        let Some(source) = self.run.source.clone() else {
            self.fail(
                Stage::Downloading,
                Error::InternalState("entered the download stage without an image source".into()),
            );
            return;
        };
        let dest = self.archive_dest();
        if let Err(e) = std::fs::create_dir_all(&self.config.scratch_dir) {
            self.fail(
                Stage::Downloading,
                Error::Network(format!("could not create scratch directory: {e}")),
            );
            return;
        }
        self.transition(Stage::Downloading);

        let fetcher = Arc::clone(&self.backends.fetcher);
        let events = self.events_tx.clone();
        let errors = self.error_channel();
        let outcome_tx = self.outcome_tx.clone();
        let active = Arc::clone(&self.active);
        let run_id = self.run_id;

        thread::spawn(move || {
            let mut on_progress = |sofar: u64, total: Option<u64>| {
                let progress = match total {
                    Some(t) if t > 0 => Progress::Fraction(sofar as f64 / t as f64),
                    _ => Progress::Indeterminate,
                };
                let _ = events.send(PipelineEvent::Progress {
                    stage: Stage::Downloading,
                    progress,
                });
            };
            match fetcher.fetch(&source.url, &dest, &active, &mut on_progress) {
                Ok(result) => {
                    let _ = outcome_tx.send(TaggedOutcome {
                        run_id,
                        outcome: StageOutcome::Downloaded(result),
                    });
                }
                Err(Error::Cancelled) => debug!("download cancelled"),
                Err(e) => errors.post(Stage::Downloading, e),
            }
        });
    }

    fn start_extracting(&mut self) {
        let Some(archive) = self.run.download.as_ref().map(|d| d.path.clone()) else {
            self.fail(
                Stage::Extracting,
                Error::InternalState("entered the extract stage without a download".into()),
            );
            return;
        };
        let dest = self.image_dest();
        self.transition(Stage::Extracting);

        let extractor = Arc::clone(&self.backends.extractor);
        let events = self.events_tx.clone();
        let errors = self.error_channel();
        let outcome_tx = self.outcome_tx.clone();
        let active = Arc::clone(&self.active);
        let run_id = self.run_id;

        thread::spawn(move || {
            // Extraction reports no byte-level progress, mirroring the
            // indeterminate bar the front-end shows for this stage.
            let _ = events.send(PipelineEvent::Progress {
                stage: Stage::Extracting,
                progress: Progress::Indeterminate,
            });
            match extractor.extract(&archive, &dest, &active) {
                Ok(image) => {
                    let _ = outcome_tx.send(TaggedOutcome {
                        run_id,
                        outcome: StageOutcome::Extracted(image),
                    });
                }
                Err(Error::Cancelled) => debug!("extraction cancelled"),
                Err(e) => errors.post(Stage::Extracting, e),
            }
        });
    }

    fn start_writing(&mut self) {
        let (Some(device), Some(image)) = (
            self.run.device.clone(),
            self.run.image.as_ref().map(|i| i.path.clone()),
        ) else {
            self.fail(
                Stage::Writing,
                Error::InternalState(
                    "entered the write stage without a device and an extracted image".into(),
                ),
            );
            return;
        };
        self.transition(Stage::Writing);

        let writer = Arc::clone(&self.backends.writer);
        let events = self.events_tx.clone();
        let outcome_tx = self.outcome_tx.clone();
        let active = Arc::clone(&self.active);
        let run_id = self.run_id;

        thread::spawn(move || {
            let mut on_progress = |written: u64, total: u64| {
                let progress = if total > 0 {
                    Progress::Fraction(written as f64 / total as f64)
                } else {
                    Progress::Indeterminate
                };
                let _ = events.send(PipelineEvent::Progress {
                    stage: Stage::Writing,
                    progress,
                });
            };
            let report = writer.write_image(&device, &image, &active, &mut on_progress);
            let _ = outcome_tx.send(TaggedOutcome {
                run_id,
                outcome: StageOutcome::Written(report),
            });
        });
    }
}

/// Handle for issuing commands to a running controller. Cloneable so a
/// signal handler can hold one for cancellation.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: Sender<Command>,
}

impl PipelineHandle {
    pub fn select_device(&self, id: u32) {
        let _ = self.commands.send(Command::SelectDevice(id));
    }

    pub fn choose_image(&self, source: ImageSource) {
        let _ = self.commands.send(Command::ChooseImage(source));
    }

    pub fn advance(&self) {
        let _ = self.commands.send(Command::Advance);
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }
}

/// Owns the coordinator thread. Dropping the controller shuts the
/// coordinator down and stops any in-flight worker.
pub struct PipelineController {
    handle: PipelineHandle,
    events: Receiver<PipelineEvent>,
    coordinator: Option<JoinHandle<()>>,
}

impl PipelineController {
    /// Starts a controller with a fresh run in `SelectingDevice`; device
    /// polling begins immediately.
    pub fn spawn(config: PipelineConfig, backends: StageBackends) -> Self {
        let (commands_tx, commands_rx) = unbounded();
        let (coordinator, events) = Coordinator::new(config, backends);
        let thread = thread::spawn(move || coordinator.run_loop(commands_rx));
        PipelineController {
            handle: PipelineHandle {
                commands: commands_tx,
            },
            events,
            coordinator: Some(thread),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// The event feed. Progress and completion events for a stage arrive
    /// in the order produced.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn select_device(&self, id: u32) {
        self.handle.select_device(id);
    }

    pub fn choose_image(&self, source: ImageSource) {
        self.handle.choose_image(source);
    }

    pub fn advance(&self) {
        self.handle.advance();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn restart(&self) {
        self.handle.restart();
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(thread) = self.coordinator.take() {
            let _ = thread.join();
        }
    }
}
