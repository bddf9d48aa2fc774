use anyhow::{Context, Result, anyhow};
use bulkflash_core::artifacts::{DirectoryResolver, ProvisioningMode};
use bulkflash_core::device::{self, ConnectedDevice, DeviceSerial};
use bulkflash_core::fleet::{Fleet, FleetReport};
use bulkflash_core::task::{FlashOptions, Outcome, Phase, Step, TaskObserver, TaskReport};
use bulkflash_core::tool::ProcessTool;
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "bulkflash")]
#[command(about = "Bulk-provision a custom OS onto USB-attached Android devices", version)]
struct Cli {
    /// File the run log is appended to
    #[arg(long, global = true, default_value = "bulkflash.log")]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash every connected device
    Flash(FlashArgs),
    /// List connected devices
    List {
        #[command(flatten)]
        tools: ToolArgs,
    },
}

#[derive(Args)]
struct ToolArgs {
    /// Path to the adb binary
    #[arg(long, default_value = "adb")]
    adb: PathBuf,

    /// Path to the fastboot binary
    #[arg(long, default_value = "fastboot")]
    fastboot: PathBuf,
}

impl ToolArgs {
    fn tool(&self) -> ProcessTool {
        ProcessTool::new(&self.adb, &self.fastboot)
    }
}

#[derive(Args)]
struct FlashArgs {
    #[command(flatten)]
    tools: ToolArgs,

    /// Sideload an OTA package from recovery instead of flashing a factory image
    #[arg(long)]
    ota: bool,

    /// Directory holding the images and the optional AVB key
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Pause after every reboot into the bootloader
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    settle: Duration,

    /// Time given to the operator to answer an unlock/lock prompt
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    confirm_interval: Duration,

    /// Polls of the lock state before an unlock/lock is given up
    #[arg(long, default_value_t = 3)]
    confirm_attempts: u32,

    /// Interval between checks for recovery accepting a sideload
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    sideload_interval: Duration,

    /// Checks for recovery accepting a sideload before the device is given up
    #[arg(long, default_value_t = 60)]
    sideload_attempts: u32,

    /// Product that must stay unlockable; its bootloader is never relocked
    #[arg(long = "relock-exempt", value_name = "PRODUCT")]
    relock_exempt: Vec<String>,

    /// Skip the interactive confirmation
    #[arg(short = 'y', long = "yes")]
    yes: bool,
}

impl FlashArgs {
    fn mode(&self) -> ProvisioningMode {
        if self.ota {
            ProvisioningMode::OtaSideload
        } else {
            ProvisioningMode::FactoryImage
        }
    }

    fn options(&self) -> FlashOptions {
        FlashOptions {
            settle: self.settle,
            confirm_interval: self.confirm_interval,
            confirm_attempts: self.confirm_attempts,
            sideload_interval: self.sideload_interval,
            sideload_attempts: self.sideload_attempts,
            relock_exempt: self.relock_exempt.clone(),
        }
    }
}

/// Routes console log lines around the progress bars so they don't tear.
#[derive(Clone)]
struct ProgressWriter(MultiProgress);

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = ProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs two sinks: the console, filtered by `BULKFLASH_LOG` (default
/// `warn`), and the persistent run log at `debug`.
fn init_logging(log_file: &Path, multi: &MultiProgress) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("cannot open log file {}", log_file.display()))?;

    let console_filter = EnvFilter::builder()
        .with_env_var("BULKFLASH_LOG")
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(ProgressWriter(multi.clone()))
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
    Ok(())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn print_devices(devices: &[ConnectedDevice]) {
    println!("\n  {:<20} {:<9} {}", "SERIAL", "TOOL", "STATE");
    println!("  {:-<20} {:-<9} {:-<12}", "", "", "");
    for device in devices {
        println!("  {device}");
    }
    println!();
}

fn print_preparation(mode: ProvisioningMode) {
    println!("Do the following for each device:");
    println!("  1. Enable Developer Options (Settings -> About phone -> tap \"Build number\" 7 times)");
    println!("  2. Enable USB debugging (Settings -> System -> Developer options) and allow this computer");
    if mode == ProvisioningMode::FactoryImage {
        println!("  3. Enable OEM unlocking in the same Developer options menu");
    }
    println!();
}

/// Feeds task progress into one spinner per device.
struct ProgressObserver {
    bars: HashMap<DeviceSerial, ProgressBar>,
}

impl ProgressObserver {
    fn new(multi: &MultiProgress, devices: &[ConnectedDevice]) -> Result<Self> {
        let spinner = ProgressStyle::with_template("{prefix:20} [{elapsed_precise}] {spinner} {msg}")?;
        let bars = devices
            .iter()
            .map(|device| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner.clone());
                bar.set_prefix(device.serial.to_string());
                bar.set_message("waiting");
                bar.enable_steady_tick(Duration::from_millis(120));
                (device.serial.clone(), bar)
            })
            .collect();
        Ok(Self { bars })
    }

    fn abandon(&self) {
        for bar in self.bars.values() {
            bar.finish_and_clear();
        }
    }
}

impl TaskObserver for ProgressObserver {
    fn phase_entered(&self, serial: &DeviceSerial, phase: Phase) {
        if let Some(bar) = self.bars.get(serial) {
            bar.set_message(phase.to_string());
        }
    }

    fn awaiting_operator(&self, serial: &DeviceSerial, step: Step) {
        let hint = match step {
            Step::BootloaderUnlock => "use the volume and power keys on the device to confirm the unlock",
            Step::BootloaderRelock => "use the volume and power keys on the device to confirm the lock",
            Step::SideloadWait => "select \"Apply update from ADB\" in recovery",
            _ => "waiting for the operator",
        };
        if let Some(bar) = self.bars.get(serial) {
            bar.set_message(style(hint).yellow().bold().to_string());
        }
    }

    fn finished(&self, report: &TaskReport) {
        let Some(bar) = self.bars.get(&report.serial) else {
            return;
        };
        match &report.outcome {
            Outcome::Done => bar.finish_with_message(style("✨ done").green().to_string()),
            Outcome::Failed { error, .. } => {
                bar.finish_with_message(style(format!("❌ {error}")).red().to_string())
            }
        }
    }
}

fn print_summary(report: &FleetReport, log_file: &Path) {
    println!();
    println!("  {:<20} {}", "SERIAL", "RESULT");
    println!("  {:-<20} {:-<30}", "", "");
    for task in &report.tasks {
        match task.outcome.reason() {
            None => match &task.last_error {
                Some(note) => println!(
                    "  {:<20} {} {}",
                    task.serial.as_str(),
                    style("done").green(),
                    style(format!("({note})")).dim()
                ),
                None => println!("  {:<20} {}", task.serial.as_str(), style("done").green()),
            },
            Some(reason) => println!(
                "  {:<20} {}",
                task.serial.as_str(),
                style(format!("failed at {reason}")).red()
            ),
        }
    }
    println!("\nRun log: {}", style(log_file.display()).cyan());
}

fn flash(args: FlashArgs, multi: &MultiProgress, log_file: &Path) -> Result<()> {
    let mode = args.mode();
    let tool = args.tools.tool();
    tool.check()?;
    tool.kill_server();

    print_preparation(mode);
    if !args.yes && !confirm_operation("Are the devices prepared and connected?")? {
        println!("Flash operation cancelled.");
        return Ok(());
    }

    let devices = device::enumerate(&tool)?;
    println!("Found {} device(s):", devices.len());
    print_devices(&devices);

    if mode == ProvisioningMode::FactoryImage {
        println!(
            "{} This will erase all data on {} device(s).",
            style("WARNING:").red().bold(),
            devices.len()
        );
    }
    println!("  Mode:   {}", style(mode).cyan());
    println!("  Images: {}", style(args.dir.display()).cyan());
    println!();

    if !args.yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Flash operation cancelled.");
        return Ok(());
    }
    println!();
    info!(%mode, dir = %args.dir.display(), devices = devices.len(), "run started");

    let observer = ProgressObserver::new(multi, &devices)?;
    let fleet = Fleet::new(&tool)
        .with_observer(&observer)
        .with_options(args.options());

    let report = match fleet.run(&devices, mode, &DirectoryResolver::new(&args.dir)) {
        Ok(report) => report,
        Err(e) => {
            observer.abandon();
            return Err(e.into());
        }
    };

    print_summary(&report, log_file);

    let failed = report.failed().count();
    if failed > 0 {
        warn!(failed, "run finished with failed devices");
        return Err(anyhow!(
            "{failed} of {} device(s) failed and need manual recovery",
            report.tasks.len()
        ));
    }
    println!(
        "\n✨ Bulk flashing complete: {} device(s) provisioned.",
        report.tasks.len()
    );
    Ok(())
}

fn list(tools: ToolArgs) -> Result<()> {
    let tool = tools.tool();
    tool.check()?;

    let devices = match device::enumerate(&tool) {
        Ok(devices) => devices,
        Err(bulkflash_core::FlashError::NoDevices) => {
            println!("No devices connected.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!("Found {} device(s):", devices.len());
    print_devices(&devices);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let multi = MultiProgress::new();
    if let Err(e) = init_logging(&cli.log_file, &multi) {
        eprintln!("{} {e:#}", style("Error:").red().bold());
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Flash(args) => flash(args, &multi, &cli.log_file),
        Commands::List { tools } => list(tools),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Reaches both the console and the run log.
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
