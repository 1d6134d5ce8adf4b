use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oxdokan_core::{InProcessDriver, MountSession};
use oxdokan_memfs::{FileConfig, MemoryFs, Workload, mounter, workload};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serve an in-memory volume through Dokan
#[derive(Parser)]
#[command(name = "oxdokan-memfs")]
#[command(author, version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an empty volume and serve it until interrupted
    Serve(VolumeArgs),

    /// Mount a volume, run a concurrent workload against it and report
    Demo {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Concurrent writer threads
        #[arg(long, default_value_t = 4)]
        writers: usize,

        /// Files each writer creates
        #[arg(long, default_value_t = 16)]
        files: usize,

        /// Bytes written to each file
        #[arg(long, default_value_t = 64 * 1024)]
        payload: usize,
    },
}

#[derive(Args)]
struct VolumeArgs {
    /// JSON config file with `mount` and `volume` sections
    #[arg(short, long, env = "OXDOKAN_MEMFS_CONFIG")]
    config: Option<PathBuf>,

    /// Drive letter or directory to mount at
    #[arg(short, long)]
    mount_point: Option<String>,

    /// Volume label
    #[arg(long)]
    label: Option<String>,

    /// Refuse every mutating operation
    #[arg(long)]
    read_only: bool,

    /// Volume size in bytes
    #[arg(long)]
    capacity: Option<u64>,

    /// Serialise every callback
    #[arg(long)]
    single_thread: bool,
}

impl VolumeArgs {
    /// Config file contents with command-line overrides applied.
    fn resolve(&self) -> Result<FileConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if let Some(mount_point) = &self.mount_point {
            config.mount.mount_point.clone_from(mount_point);
        }
        if let Some(label) = &self.label {
            config.volume.volume_label.clone_from(label);
        }
        if let Some(capacity) = self.capacity {
            config.volume.capacity = capacity;
        }
        config.volume.read_only |= self.read_only;
        config.mount.single_thread |= self.single_thread;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match cli.command {
        Commands::Serve(volume) => serve(&volume),
        Commands::Demo {
            volume,
            writers,
            files,
            payload,
        } => demo(
            &volume,
            &Workload {
                writers,
                files_per_writer: files,
                payload_size: payload,
            },
        ),
    }
}

fn mount(config: &FileConfig) -> Result<(Arc<MemoryFs>, Arc<InProcessDriver>, MountSession)> {
    let fs = Arc::new(MemoryFs::new(config.volume.clone()));
    let driver = Arc::new(InProcessDriver::new().with_workers(config.mount.effective_threads()));
    let session = mounter(config)
        .mount(fs.clone(), driver.clone())
        .with_context(|| format!("Failed to mount at {}", config.mount.mount_point))?;
    Ok((fs, driver, session))
}

fn serve(args: &VolumeArgs) -> Result<()> {
    let config = args.resolve()?;
    let (fs, _driver, session) = mount(&config)?;

    eprintln!("Mounted {} at {}", config.volume.volume_label, session.mount_point());
    eprintln!("Press Ctrl+C to unmount and exit");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, unmounting...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let report = session.unmount().context("Failed to unmount")?;
    info!(
        forced = report.forced,
        released = report.released_handles,
        used_bytes = fs.used_bytes(),
        "Unmounted"
    );
    eprintln!("Unmounted successfully");
    Ok(())
}

fn demo(args: &VolumeArgs, load: &Workload) -> Result<()> {
    let config = args.resolve()?;
    let (fs, driver, session) = mount(&config)?;

    let outcome = workload::run(&driver, load);
    let report = session.unmount().context("Failed to unmount")?;
    let summary = outcome.context("Workload failed")?;

    let output = json!({
        "workload": summary,
        "volume": {
            "entries": fs.entry_count(),
            "used_bytes": fs.used_bytes(),
            "capacity": fs.config().capacity,
        },
        "unmount": report,
    });
    serde_json::to_writer_pretty(io::stdout().lock(), &output).context("Failed to write report")?;
    println!();

    if report.stats.leaked_handles() > 0 {
        anyhow::bail!("{} handles leaked", report.stats.leaked_handles());
    }
    Ok(())
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
