/*++

Licensed under the Apache-2.0 license.

File Name:

    main.rs

Abstract:

    Host emulator for the OTA update engine: file backed flash, boot
    selection, diagnostic gate and update task in a restart loop.

--*/

mod file_flash;
mod http;
mod source;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use file_flash::FileFlash;
use http::HttpImageSource;
use log::{info, warn, LevelFilter};
use ota_config::boot::{PartitionId, RollbackEnable, RollbackState};
use ota_config::UpdateConfig;
use ota_config_emulator::{FlashLayout, PartitionTable};
use ota_image::{parse_header, FirmwareVersion, ImageBuilder, ImageVerifier, MIN_HEADER_LEN};
use ota_lib::boot_cfg::FlashBootConfig;
use ota_lib::bootloader::select_boot_partition;
use ota_lib::config::DIAGNOSTIC_SETTLE_TIME_MS;
use ota_lib::diagnostic::{Diagnostic, SettleDiagnostic};
use ota_lib::fetch::ImageSource;
use ota_lib::flash::{FlashPartition, FlashStorage};
use ota_lib::link::channel_link;
use ota_lib::partition::PartitionDirectory;
use ota_lib::system::RestartLatch;
use ota_lib::timer::StdDelay;
use ota_lib::{Exit, OtaService};
use simple_logger::SimpleLogger;
use source::FileImageSource;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(version, about, long_about = None, name = "OTA Emulator")]
struct Cli {
    /// Flash image file backing the emulated device
    #[arg(short, long, default_value = "ota-flash.bin")]
    flash: PathBuf,

    /// Log at debug level
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an application image
    Pack {
        /// Version string stored in the application descriptor
        #[arg(long)]
        version: String,

        #[arg(long, default_value = "ota-app")]
        project: String,

        #[arg(long, default_value_t = 0)]
        secure_version: u32,

        /// Payload bytes appended to the first segment
        #[arg(long, default_value_t = 64 * 1024)]
        payload_size: usize,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Erase the device and install a factory image in slot A
    Provision {
        #[arg(long)]
        image: PathBuf,
    },
    /// Print the boot record and the versions held by each slot
    Status,
    /// Boot the device and run the update engine
    Run {
        /// TOML file with the update settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Serve the update from a local image file
        #[arg(long, conflicts_with = "url")]
        image: Option<PathBuf>,

        /// Fetch the update from this URL
        #[arg(long)]
        url: Option<String>,

        /// PEM file with the image server certificate
        #[arg(long)]
        cert: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        skip_common_name_check: bool,

        /// Reset the file transfer after this many bytes
        #[arg(long, requires = "image")]
        truncate_at: Option<u64>,

        /// Make the first-boot diagnostics fail
        #[arg(long, default_value_t = false)]
        fail_diagnostics: bool,

        /// Time the diagnostics take, in milliseconds
        #[arg(long, default_value_t = DIAGNOSTIC_SETTLE_TIME_MS)]
        settle_ms: u64,

        /// Stop after this many boots
        #[arg(long, default_value_t = 3)]
        max_boots: u32,
    },
}

/// Diagnostic that always reports a fault.
struct FailingDiagnostic;

impl Diagnostic for FailingDiagnostic {
    fn run(&self, _budget: Duration) -> bool {
        warn!("Diagnostics forced to fail");
        false
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(level).init()?;

    let layout = FlashLayout::default();
    match cli.command {
        Commands::Pack {
            version,
            project,
            secure_version,
            payload_size,
            output,
        } => pack(&version, &project, secure_version, payload_size, &output),
        Commands::Provision { image } => {
            let flash = FileFlash::open(&cli.flash, layout.flash_size())?;
            provision(&flash, &layout, &image)
        }
        Commands::Status => {
            let flash = FileFlash::open(&cli.flash, layout.flash_size())?;
            status(&flash, &layout)
        }
        Commands::Run {
            config,
            image,
            url,
            cert,
            skip_common_name_check,
            truncate_at,
            fail_diagnostics,
            settle_ms,
            max_boots,
        } => {
            let flash = FileFlash::open(&cli.flash, layout.flash_size())?;
            let mut config = match config {
                Some(path) => UpdateConfig::load(&path)?,
                None => UpdateConfig::default(),
            };
            if let Some(url) = url {
                config.firmware_url = url;
            }
            if cert.is_some() {
                config.server_cert_pem = cert;
            }
            config.skip_common_name_check |= skip_common_name_check;
            config.validate()?;
            if settle_ms >= config.diagnostic_timeout_ms {
                bail!(
                    "--settle-ms {} must be shorter than diagnostic_timeout_ms {}",
                    settle_ms,
                    config.diagnostic_timeout_ms
                );
            }

            let options = RunOptions {
                fail_diagnostics,
                settle: Duration::from_millis(settle_ms),
                max_boots,
            };
            match image {
                Some(path) => boot_loop(&flash, &layout, &config, &options, || {
                    Ok(FileImageSource::new(path.clone(), truncate_at))
                }),
                None if !config.firmware_url.is_empty() => {
                    boot_loop(&flash, &layout, &config, &options, || {
                        HttpImageSource::new(&config)
                    })
                }
                None => bail!("no image source: pass --image, --url or set firmware_url"),
            }
        }
    }
}

fn pack(
    version: &str,
    project: &str,
    secure_version: u32,
    payload_size: usize,
    output: &Path,
) -> anyhow::Result<()> {
    let payload = (0..payload_size).map(|i| (i % 251) as u8).collect();
    let image = ImageBuilder::new(version)
        .project_name(project)
        .secure_version(secure_version)
        .payload(payload)
        .build();
    let info = verify(&image)?;
    std::fs::write(output, &image)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "{}: version {} size {} sha256 {}",
        output.display(),
        info.version,
        info.size,
        hex::encode(info.digest)
    );
    Ok(())
}

fn verify(image: &[u8]) -> anyhow::Result<ota_image::ImageInfo> {
    let mut verifier = ImageVerifier::new();
    verifier.update(image)?;
    Ok(verifier.finish()?)
}

fn provision(flash: &FileFlash, layout: &FlashLayout, image_path: &Path) -> anyhow::Result<()> {
    let image = std::fs::read(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    let info = verify(&image)?;

    flash.format()?;
    let slot = layout
        .app(PartitionId::A)
        .ok_or_else(|| anyhow!("layout has no slot A"))?;
    let partition = FlashPartition::from_info(flash, slot)
        .map_err(|err| anyhow!("slot A does not fit the device: {:?}", err))?;
    partition
        .write(0, &image)
        .map_err(|err| anyhow!("writing slot A failed: {:?}", err))?;

    let mut table = PartitionTable::new(PartitionId::A, RollbackEnable::Enabled);
    table.set_partition_state(PartitionId::A, RollbackState::Valid);
    FlashBootConfig::new(flash, layout)
        .and_then(|cfg| cfg.format(table))
        .map_err(|err| anyhow!("writing the boot record failed: {:?}", err))?;

    info!(
        "Provisioned {} ({} bytes) in {}",
        info.version, info.size, slot.name
    );
    Ok(())
}

fn status(flash: &FileFlash, layout: &FlashLayout) -> anyhow::Result<()> {
    let cfg = FlashBootConfig::new(flash, layout)
        .map_err(|err| anyhow!("no boot data partition: {:?}", err))?;
    let table = cfg
        .read_table()
        .map_err(|err| anyhow!("reading the boot record failed: {:?}", err))?;
    println!("sequence:  {}", table.sequence());
    println!("boot:      {:?}", table.get_boot_partition());
    println!("fallback:  {:?}", table.get_fallback_partition());
    println!("rollback:  {}", table.is_rollback_enabled());
    if let Some(invalid) = table.get_invalid_image() {
        println!(
            "invalid:   {:?} ({})",
            invalid.partition,
            FirmwareVersion::from_bytes(invalid.version)
        );
    }
    for slot in layout.apps() {
        let version = slot_version(flash, slot)
            .map(|v| v.to_string())
            .unwrap_or_else(|| String::from("<empty>"));
        println!(
            "{:<8} {:#010x} {:?} {}",
            slot.name,
            slot.offset,
            table.get_partition_state(slot.id),
            version
        );
    }
    Ok(())
}

fn slot_version(
    flash: &dyn FlashStorage,
    slot: &ota_config_emulator::PartitionInfo,
) -> Option<FirmwareVersion> {
    let mut header = [0u8; MIN_HEADER_LEN];
    FlashPartition::from_info(flash, slot)
        .ok()?
        .read(0, &mut header)
        .ok()?;
    parse_header(&header).ok()
}

struct RunOptions {
    fail_diagnostics: bool,
    settle: Duration,
    max_boots: u32,
}

/// Emulated power cycles: every restart request ends the current boot and
/// starts the next one from the boot selector.
fn boot_loop<S: ImageSource>(
    flash: &FileFlash,
    layout: &FlashLayout,
    config: &UpdateConfig,
    options: &RunOptions,
    make_source: impl Fn() -> anyhow::Result<S>,
) -> anyhow::Result<()> {
    let delay = StdDelay;
    let settle = SettleDiagnostic::new(&delay, options.settle);
    let diagnostic: &dyn Diagnostic = if options.fail_diagnostics {
        &FailingDiagnostic
    } else {
        &settle
    };

    for boot in 1..=options.max_boots {
        let selection = select_boot_partition(flash, layout)
            .map_err(|err| anyhow!("boot selection failed: {:?}", err))?;
        info!(
            "Boot {}: starting {:?} ({:?}{})",
            boot,
            selection.partition,
            selection.state,
            if selection.reverted { ", reverted" } else { "" }
        );

        let directory = PartitionDirectory::new(flash, layout, selection.partition)?;
        let latch = RestartLatch::new();
        let (notifier, link) = channel_link();
        let provider = thread::spawn(move || notifier.connected());

        let service = OtaService::new(
            &directory,
            &link,
            diagnostic,
            &latch,
            &delay,
            make_source()?,
            config.clone(),
        );
        let exit = service.run();
        let _ = provider.join();
        match exit {
            Exit::Restart(reason) => info!("Restarting ({:?})", reason),
            Exit::Halted(err) => return Err(err.into()),
        }
    }
    info!("Stopped after {} boots", options.max_boots);
    Ok(())
}
