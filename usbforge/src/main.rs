use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use usbforge_core::catalog::DeviceCatalog;
use usbforge_core::device::{Device, DeviceList};
use usbforge_core::pipeline::{
    ImageSource, PipelineConfig, PipelineController, PipelineEvent, Progress, Stage,
    StageBackends,
};

/// Bar positions are tracked in per-mille because the pipeline reports
/// completion fractions, not byte counts.
const BAR_SCALE: u64 = 1000;

#[derive(Parser)]
#[command(name = "usbforge")]
#[command(about = "Creates a bootable USB installer from a downloaded disk image", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an image and write it to a USB device interactively
    Create {
        /// Image archive URL (skips the built-in image choices)
        #[arg(long)]
        url: Option<String>,

        /// Label for the image given with --url
        #[arg(long, default_value = "custom image")]
        label: String,

        /// Directory for the downloaded archive and extracted image
        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Keep the extracted image across "make another USB" restarts
        /// instead of re-downloading
        #[arg(long)]
        reuse_image: bool,
    },
    /// List available removable devices
    List,
}

/// The built-in image choices, mirroring the 32-bit/64-bit picker of the
/// original wizard.
fn builtin_sources() -> Vec<ImageSource> {
    vec![
        ImageSource::new(
            "https://ddnynf025unax.cloudfront.net/cloudready-free-56.3.82-64-bit/cloudready-free-56.3.82-64-bit.bin.zip",
            "64-bit (recommended)",
        ),
        ImageSource::new(
            "https://ddnynf025unax.cloudfront.net/cloudready-free-56.3.80-32-bit/cloudready-free-56.3.80-32-bit.bin.zip",
            "32-bit",
        ),
    ]
}

/// Writing to raw devices needs elevated rights. The pipeline itself does
/// not enforce this precondition; the front-end surfaces it up front so
/// the user is not stopped twenty minutes in.
fn ensure_elevated() -> Result<()> {
    #[cfg(unix)]
    if !nix::unistd::geteuid().is_root() {
        bail!(
            "usbforge was run without sufficient rights to write to a USB device. \
             Please re-run with administrator rights (e.g. via sudo)."
        );
    }
    Ok(())
}

/// Presents an interactive menu for the user to select a device.
fn prompt_device(devices: &DeviceList) -> Result<Device> {
    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Choose your target device")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices.as_slice()[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn prompt_source(url: Option<String>, label: String) -> Result<ImageSource> {
    if let Some(url) = url {
        return Ok(ImageSource::new(url, label));
    }

    let sources = builtin_sources();
    let items: Vec<&str> = sources.iter().map(|s| s.label.as_str()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which version of the installer do you need?")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(sources[selection].clone())
}

fn waiting_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_message("Waiting for a removable USB device...");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn fraction_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(BAR_SCALE);
    pb.set_prefix(prefix.to_string());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {percent}% ({eta})")
            .unwrap()
            .progress_chars("■ "),
    );
    pb
}

fn stage_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_prefix(prefix.to_string());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] [{spinner}] {msg}")
            .unwrap(),
    );
    pb.set_message("working...");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn run_create(
    url: Option<String>,
    label: String,
    scratch_dir: Option<PathBuf>,
    reuse_image: bool,
) -> Result<()> {
    ensure_elevated()?;
    let source = prompt_source(url, label)?;

    let mut config = PipelineConfig::default();
    if let Some(dir) = scratch_dir {
        config.scratch_dir = dir;
    }
    config.reuse_extracted = reuse_image;

    let controller = PipelineController::spawn(config, StageBackends::system());

    // Ctrl+C cancels the active run instead of killing the process, so
    // partial downloads get cleaned up.
    let cancel_handle = controller.handle();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        cancel_handle.cancel();
    })?;

    controller.choose_image(source.clone());

    let events = controller.events().clone();
    let mut bar: Option<ProgressBar> = Some(waiting_spinner());

    let clear_bar = |bar: &mut Option<ProgressBar>| {
        if let Some(pb) = bar.take() {
            pb.finish_and_clear();
        }
    };

    loop {
        let event = events.recv()?;
        match event {
            PipelineEvent::StageChanged { stage } => {
                match stage {
                    Stage::SelectingDevice => {
                        clear_bar(&mut bar);
                        bar = Some(waiting_spinner());
                    }
                    Stage::Downloading => {
                        clear_bar(&mut bar);
                        bar = Some(fraction_bar("Downloading"));
                    }
                    Stage::Extracting => {
                        clear_bar(&mut bar);
                        bar = Some(stage_spinner("Extracting"));
                    }
                    Stage::Writing => {
                        clear_bar(&mut bar);
                        bar = Some(fraction_bar("Writing"));
                    }
                    Stage::Succeeded | Stage::Failed => {
                        clear_bar(&mut bar);
                    }
                }
            }
            PipelineEvent::Devices { list } => {
                clear_bar(&mut bar);
                let device = prompt_device(&list)?;
                println!(
                    "{} This will erase all data on '{}' ({:.1} GB).",
                    style("WARNING:").red().bold(),
                    device.name,
                    device.size_gb(),
                );
                if !confirm("Are you sure you want to proceed?")? {
                    println!("Operation cancelled.");
                    break;
                }
                controller.select_device(device.id);
                controller.advance();
            }
            PipelineEvent::Progress { progress, .. } => {
                if let (Some(pb), Progress::Fraction(f)) = (&bar, progress) {
                    pb.set_position((f.clamp(0.0, 1.0) * BAR_SCALE as f64) as u64);
                }
            }
            PipelineEvent::Rejected { reason } => {
                eprintln!("{} {reason}", style("note:").yellow());
            }
            PipelineEvent::Finished { elapsed } => {
                clear_bar(&mut bar);
                println!(
                    "\n✨ Your USB installer is ready ({}).",
                    indicatif::HumanDuration(elapsed)
                );
                if confirm("Make another USB?")? {
                    controller.restart();
                    controller.choose_image(source.clone());
                } else {
                    break;
                }
            }
            PipelineEvent::Failed { stage, error } => {
                clear_bar(&mut bar);
                eprintln!(
                    "{} {error} (while {stage})",
                    style("error:").red().bold()
                );
                if confirm("Try again with a fresh run?")? {
                    controller.restart();
                    controller.choose_image(source.clone());
                } else {
                    bail!("USB creation failed");
                }
            }
        }
    }

    Ok(())
}

fn run_list() -> Result<()> {
    let devices = DeviceCatalog::system().refresh()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<4} {:<25} {:<10} {}", "ID", "NAME", "SIZE", "DEVICE");
    println!("  {:-<4} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in &devices {
        println!(
            "  {:<4} {:<25} {:>7.1} GB {}",
            device.id,
            device.name,
            device.size_gb(),
            device.path.display()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            url,
            label,
            scratch_dir,
            reuse_image,
        } => run_create(url, label, scratch_dir, reuse_image),
        Commands::List => run_list(),
    }
}
