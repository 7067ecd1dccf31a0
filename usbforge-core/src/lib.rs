//! The core, UI-agnostic library for the `usbforge` USB installer
//! creation utility.
//!
//! `usbforge-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `usbforge`) or a graphical
//! wizard. It handles the complexities of device discovery, image
//! download, archive extraction, raw device I/O, and the orchestration
//! that sequences those stages into one cancellable run.
//!
//! The library is structured into several key modules:
//! - [`device`]: The cross-platform `Device` value record and the
//!   `DeviceList` snapshot produced by each refresh.
//! - [`catalog`]: Device enumeration behind a pluggable backend.
//! - [`platform`]: Platform-specific discovery of removable block devices.
//! - [`download`]: Streams a remote image archive to local storage.
//! - [`extract`]: Decompresses the archive into the raw installable image.
//! - [`write`]: Streams the raw image onto a block device.
//! - [`pipeline`]: The orchestrator that sequences the stages, reports
//!   progress and failures, and supports cancel/restart.
//!
//! The primary entry point is [`pipeline::PipelineController::spawn`]:
//! the front-end issues commands and consumes the event feed while all
//! I/O runs on background threads.
//!
//! ## Example: driving a run
//!
//! ```rust,no_run
//! use usbforge_core::pipeline::{
//!     ImageSource, PipelineConfig, PipelineController, PipelineEvent, StageBackends,
//! };
//!
//! let controller = PipelineController::spawn(PipelineConfig::default(), StageBackends::system());
//! controller.choose_image(ImageSource::new("https://example.com/installer.bin.zip", "64-bit"));
//!
//! // Block until polling finds an attached device, then pick one.
//! for event in controller.events().iter() {
//!     match event {
//!         PipelineEvent::Devices { list } => {
//!             let device = list.as_slice().first().expect("non-empty by contract");
//!             controller.select_device(device.id);
//!             controller.advance();
//!         }
//!         PipelineEvent::Finished { elapsed } => {
//!             println!("installer ready in {elapsed:?}");
//!             break;
//!         }
//!         PipelineEvent::Failed { error, .. } => {
//!             eprintln!("run failed: {error}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod catalog;
pub mod device;
pub mod download;
pub mod error;
pub mod extract;
mod os_options;
pub mod pipeline;
pub mod platform;
pub mod write;

pub use error::{Error, Result};
