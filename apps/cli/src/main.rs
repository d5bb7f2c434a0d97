use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dfu_core::file::{SectionTag, VERSION_MINOR_WILDCARD, variant_name};
use dfu_core::partition::{Blocking, Deferred, EraseStrategy, MemoryFlash, MemoryPartitions};
use dfu_core::session::{DfuConfig, DfuSession};
use dfu_core::sim::{DevicePair, HostDriver, HostOptions, HostOutcome, run_single};
use dfu_core::store::MemoryKeyStore;
use dfu_core::validation::file_digest;
use dfu_core::{DfuObserver, PartitionIo, TracingObserver, UpgradeFileBuilder, UpgradeHeader, Version, inspect};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Earbud DFU Tool (in-memory platform)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an upgrade file from partition images
    Build(BuildArgs),
    /// Print the sections and digest of an upgrade file
    Inspect {
        /// Upgrade file
        file: PathBuf,
    },
    /// Run a host-driven upgrade against simulated earbuds
    Simulate(SimulateArgs),
    /// Write a default device configuration
    Config {
        #[arg(short, long, default_value = "dfu.toml")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Device configuration (TOML); defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Partition image as <logical>=<file>; repeatable
    #[arg(long = "partition", value_name = "LOGICAL=FILE", required = true)]
    partitions: Vec<String>,

    /// Version of the new image, e.g. 2.0
    #[arg(long, default_value = "2.0")]
    image_version: String,

    /// Running versions accepted, e.g. 1.0 or 1.* (defaults to the factory version)
    #[arg(long)]
    compatible: Vec<String>,

    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Upgrade file
    file: PathBuf,

    /// Device configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Largest DATA payload the host sends
    #[arg(long, default_value_t = 240)]
    chunk: usize,

    /// Power-cycle the device once this many file bytes have been sent
    #[arg(long)]
    interrupt_at: Option<u64>,

    /// Relay the upgrade to a secondary earbud
    #[arg(long)]
    peer: bool,

    /// Use the flash back-end whose erase completes later
    #[arg(long)]
    deferred_erase: bool,

    #[arg(long, default_value_t = 0x0100_0001)]
    upgrade_id: u32,
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Logging unavailable: {e}");
    }

    let result = match cli.command {
        Command::Build(args) => build(&args),
        Command::Inspect { file } => inspect_file(&file),
        Command::Simulate(args) => simulate(&args),
        Command::Config { output } => write_config(&output),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<DfuConfig> {
    match path {
        Some(path) => DfuConfig::load_from_file(path),
        None => Ok(DfuConfig::default()),
    }
}

/// `2.0` or `1.*`, the latter matching any minor version.
fn parse_version(text: &str) -> Result<Version> {
    let (major, minor) = text
        .split_once('.')
        .with_context(|| format!("Version '{text}' is not <major>.<minor>"))?;
    let major = major.parse().with_context(|| format!("Bad major version in '{text}'"))?;
    let minor = if minor == "*" {
        VERSION_MINOR_WILDCARD
    } else {
        minor.parse().with_context(|| format!("Bad minor version in '{text}'"))?
    };
    Ok(Version::new(major, minor))
}

fn write_config(path: &Path) -> Result<()> {
    DfuConfig::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

// ============================================================================
// build
// ============================================================================

fn build(args: &BuildArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut header = UpgradeHeader::new(
        &config.variant,
        parse_version(&args.image_version)?,
        config.factory_config_version,
    );
    if args.compatible.is_empty() {
        header = header.with_compatible(config.factory_version);
    }
    for text in &args.compatible {
        header = header.with_compatible(parse_version(text)?);
    }

    let mut builder = UpgradeFileBuilder::new(header);
    for entry in &args.partitions {
        let (logical, path) = entry
            .split_once('=')
            .with_context(|| format!("Partition '{entry}' is not <logical>=<file>"))?;
        let logical: u16 = logical
            .parse()
            .with_context(|| format!("Bad logical partition in '{entry}'"))?;
        if config.partitions.get(logical).is_none() {
            bail!("Logical partition {logical} is not in the partition table");
        }
        let payload = std::fs::read(path).with_context(|| format!("Failed to read {path}"))?;
        // The first word identifies the image; erased flash reads 0xFFFF.
        let first_word = match payload.as_slice() {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => 0xFFFF,
        };
        info!(logical, path, len = payload.len(), first_word, "Adding partition");
        builder = builder.partition(logical, first_word, payload);
    }

    let file = builder.build();
    std::fs::write(&args.output, &file).with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!("Wrote {} ({} bytes)", args.output.display(), file.len());
    println!("SHA-256: {}", hex::encode(file_digest(&file)));
    Ok(())
}

// ============================================================================
// inspect
// ============================================================================

fn inspect_file(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let summary = inspect(&data).with_context(|| format!("{} is not a valid upgrade file", path.display()))?;
    let header = &summary.header;

    println!("File:     {} ({} bytes)", path.display(), data.len());
    println!("Variant:  {}", variant_name(&header.variant));
    println!("Version:  {} (config {})", header.version, header.config_version);
    let compatible: Vec<String> = header
        .compatible_versions
        .iter()
        .map(|v| {
            if v.minor == VERSION_MINOR_WILDCARD {
                format!("{}.*", v.major)
            } else {
                v.to_string()
            }
        })
        .collect();
    println!("Upgrades: {}", compatible.join(", "));
    if !header.compatible_config_versions.is_empty() {
        println!("Configs:  {:?}", header.compatible_config_versions);
    }

    println!();
    println!("{:>8}  {:<10}  {:>8}  Partition", "Offset", "Section", "Length");
    for section in &summary.sections {
        let partition = match (section.tag, section.partition) {
            (SectionTag::Partition, Some(p)) => format!("logical {} first word 0x{:04X}", p.logical, p.first_word),
            _ => String::new(),
        };
        println!(
            "{:>8}  {:<10}  {:>8}  {}",
            section.offset,
            section.tag.to_string(),
            section.length,
            partition
        );
    }

    println!();
    println!("Signature: {}", hex::encode(summary.signature_digest));
    println!("Computed:  {}", hex::encode(summary.computed_digest));
    if !summary.digest_matches() {
        bail!("Digest mismatch");
    }
    println!("Digest OK");
    Ok(())
}

// ============================================================================
// simulate
// ============================================================================

fn simulate(args: &SimulateArgs) -> Result<()> {
    let file = std::fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let mut config = load_config(args.config.as_deref())?;
    if args.peer {
        config.peer.enabled = true;
    }
    let options = HostOptions {
        upgrade_id: args.upgrade_id,
        chunk_size: args.chunk.max(1),
        interrupt_at: args.interrupt_at,
        need_data_cfm: config.need_data_cfm,
        request_multiple_blocks: config.request_multiple_blocks,
    };
    info!(
        len = file.len(),
        chunk = options.chunk_size,
        peer = args.peer,
        deferred_erase = args.deferred_erase,
        "Simulating upgrade"
    );

    let outcome = if args.deferred_erase {
        run_simulation::<Deferred>(&config, file, options, args.peer)?
    } else {
        run_simulation::<Blocking>(&config, file, options, args.peer)?
    };
    match outcome {
        HostOutcome::Complete => Ok(()),
        other => bail!("Upgrade did not complete: {other:?}"),
    }
}

type SimSession<E> = DfuSession<MemoryFlash<E>, MemoryKeyStore, TracingObserver>;

fn new_device<E: EraseStrategy>(config: &DfuConfig, partitions: &MemoryPartitions) -> SimSession<E> {
    let mut session = DfuSession::with_observer(
        config.clone(),
        MemoryFlash::<E>::new(partitions.clone()),
        MemoryKeyStore::default(),
        Arc::new(TracingObserver),
    );
    session.init_from_config();
    session
}

fn run_simulation<E: EraseStrategy>(
    config: &DfuConfig,
    file: Vec<u8>,
    options: HostOptions,
    peer: bool,
) -> Result<HostOutcome> {
    let digest = file_digest(&file);
    let primary_flash = config.memory_partitions();
    let mut host = HostDriver::new(file, options);
    let primary = new_device::<E>(config, &primary_flash);

    let outcome = if peer {
        let secondary_flash = config.memory_partitions();
        let secondary = new_device::<E>(config, &secondary_flash);
        let mut pair = DevicePair::new(primary, secondary);
        host.connect(&mut pair.primary);
        let (mut pair, mut outcome) = pair.run(&mut host);
        if let HostOutcome::Interrupted { sent } = outcome {
            warn!(sent, "Power-cycling the primary mid-transfer");
            pair.primary = pair.primary.reboot();
            host.clear_interrupt();
            host.connect(&mut pair.primary);
            (pair, outcome) = pair.run(&mut host);
        }
        report("Primary", &pair.primary, &primary_flash);
        report("Secondary", &pair.secondary, &secondary_flash);
        outcome
    } else {
        let mut session = primary;
        host.connect(&mut session);
        let (mut session, mut outcome) = run_single(session, &mut host);
        if let HostOutcome::Interrupted { sent } = outcome {
            warn!(sent, "Power-cycling the device mid-transfer");
            session = session.reboot();
            host.clear_interrupt();
            host.connect(&mut session);
            (session, outcome) = run_single(session, &mut host);
        }
        report("Device", &session, &primary_flash);
        outcome
    };

    println!("Outcome:   {outcome:?}");
    println!("Host sent: {} bytes", host.bytes_sent());
    println!("File SHA-256: {}", hex::encode(digest));
    Ok(outcome)
}

fn report<F: PartitionIo, O: DfuObserver>(
    name: &str,
    session: &DfuSession<F, MemoryKeyStore, O>,
    partitions: &MemoryPartitions,
) {
    let record = session.store().record();
    println!(
        "{name}: state {} resume point {} version {} (t={} ms)",
        session.state(),
        session.resume_point(),
        record.active_version,
        session.now()
    );
    for (physical, layout) in session.config().flash.iter().enumerate() {
        let contents = partitions.contents(physical as u16);
        if contents.is_empty() {
            continue;
        }
        println!(
            "  partition {physical} ({:?}): {} bytes, SHA-256 {}",
            layout.kind,
            contents.len(),
            hex::encode(file_digest(&contents))
        );
    }
}
