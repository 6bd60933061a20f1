//! ember: thermodynamically-constrained dual-process agent daemon
//!
//! Usage:
//!   ember                                → run (fresh spawn, control on stdin)
//!   ember run --seed ember.seed          → resume from a signed seed
//!   ember keygen                         → create the signing key
//!   ember verify-receipts receipts.jsonl → check a receipt chain
//!   ember inspect-seed ember.seed        → verify and print a seed
//!   ember dump-config                    → print the effective config as TOML

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ember_core::{read_jsonl, Identity, ReceiptChain, SnapshotCodec, TrustedKey};
use ember_daemon::{serve, Coordinator, DaemonConfig, DaemonReport, Origin, Termination};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ember",
    about = "Dual-process agent daemon with a metabolic budget and signed receipts",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file (TOML)
    #[arg(short, long, global = true, default_value = "ember.toml")]
    config: PathBuf,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run(RunArgs),
    /// Generate a signing key
    Keygen {
        /// Key file (default: storage.key_file)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overwrite an existing key
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Verify a JSONL receipt chain
    VerifyReceipts {
        path: PathBuf,
        /// Signer public key, base64 (default: this daemon's key)
        #[arg(long)]
        key: Option<String>,
    },
    /// Verify a seed and print its body
    InspectSeed {
        path: PathBuf,
        /// Signer public key, base64 (default: this daemon's trusted keys)
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the effective configuration
    DumpConfig,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Resume from a signed seed instead of a fresh spawn
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Deliberate without a completion backend
    #[arg(long, default_value_t = false)]
    offline: bool,
    /// Do not read control commands from stdin
    #[arg(long, default_value_t = false)]
    no_control: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = init_tracing(cli.log_file.as_deref(), cli.json_logs)?;
    let config = DaemonConfig::load(&cli.config);

    let code = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await?,
        Commands::Keygen { out, force } => keygen(&config, out, force)?,
        Commands::VerifyReceipts { path, key } => verify_receipts(&config, &path, key.as_deref())?,
        Commands::InspectSeed { path, key } => inspect_seed(&config, &path, key.as_deref())?,
        Commands::DumpConfig => {
            print!("{}", config.to_toml());
            0
        }
    };

    drop(guard);
    // The stdin reader may still be parked on a blocking read.
    std::process::exit(code);
}

fn init_tracing(log_file: Option<&Path>, json: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ember=info,ember_core=info,ember_llm=info,ember_daemon=info".into());

    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let json_layer =
        json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().context("--log-file needs a file name")?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(mut config: DaemonConfig, args: RunArgs) -> anyhow::Result<i32> {
    if args.offline {
        config.completion.provider = "offline".into();
    }
    config.validate()?;

    let identity = Arc::new(
        Identity::load_or_generate(&config.storage.key_file)
            .with_context(|| format!("signing key {}", config.storage.key_file.display()))?,
    );
    let service = config.completion.build_service()?;

    let origin = match &args.seed {
        Some(path) => {
            let seed = Coordinator::load_seed(&config, identity.clone(), path)
                .with_context(|| format!("seed {}", path.display()))?;
            let pulse = seed.resource().pulse_count;
            tracing::info!("Resuming from {} (pulse {})", path.display(), pulse);
            Origin::Seed(seed)
        }
        None => Origin::Fresh,
    };

    let tick_ms = config.fast.tick_ms;
    let cycle = config.cycle_period();
    let coordinator = Coordinator::new(config, identity.clone(), service, origin)?;
    let handle = coordinator.handle();

    println!("ember v{}", env!("CARGO_PKG_VERSION"));
    println!("  instance  {}", coordinator.instance_id());
    println!("  signer    {}", identity.public_key_b64());
    println!("  receipts  {}", coordinator.receipts_path().display());
    println!("  cadence   tick {}ms, deliberate every {:?}", tick_ms, cycle);
    if !args.no_control {
        println!("  type `help` for commands");
    }
    println!();

    if !args.no_control {
        let h = handle.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = serve(stdin, tokio::io::stdout(), h).await {
                tracing::warn!("Control surface closed: {}", e);
            }
        });
    }

    let h = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            h.shutdown();
        }
    });

    let report = coordinator.run().await?;
    print_report(&report);

    Ok(match report.termination {
        _ if !report.chain_intact => 1,
        Termination::Shutdown => 0,
        Termination::Died(_) => 2,
    })
}

fn print_report(report: &DaemonReport) {
    let r = &report.resources;
    println!();
    println!("instance {} {}", report.instance_id, report.termination);
    println!(
        "  pulse {}  energy {:.2}  temp {:.2}  memory {:.2}  stability {:.2}",
        r.pulse_count, r.energy, r.temperature, r.memory_integrity, r.stability
    );
    println!(
        "  receipts {} ({})",
        report.receipts,
        if report.chain_intact { "chain intact" } else { "CHAIN BROKEN" }
    );
    if report.sink_failures > 0 {
        println!("  {} receipts were not persisted", report.sink_failures);
    }
    if let Some(seed) = &report.seed_path {
        println!("  seed {}", seed.display());
    }
    if let Some(dir) = &report.receipts_dir {
        println!("  receipts kept in {}", dir.display());
    }
}

fn keygen(config: &DaemonConfig, out: Option<PathBuf>, force: bool) -> anyhow::Result<i32> {
    let path = out.unwrap_or_else(|| config.storage.key_file.clone());
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    let identity = Identity::generate()?;
    identity.save(&path)?;
    println!("wrote {}", path.display());
    println!("public key {}", identity.public_key_b64());
    Ok(0)
}

fn resolve_key(config: &DaemonConfig, key: Option<&str>) -> anyhow::Result<TrustedKey> {
    match key {
        Some(b64) => Ok(TrustedKey::from_b64(b64)?),
        None => {
            let identity = Identity::load(&config.storage.key_file)
                .with_context(|| format!("signing key {}", config.storage.key_file.display()))?;
            Ok(identity.trusted_key())
        }
    }
}

fn verify_receipts(config: &DaemonConfig, path: &Path, key: Option<&str>) -> anyhow::Result<i32> {
    let key = resolve_key(config, key)?;
    let receipts = read_jsonl(path).with_context(|| format!("reading {}", path.display()))?;
    match ReceiptChain::verify_detailed(&receipts, &key) {
        Ok(()) => {
            println!("ok: {} receipts verify", receipts.len());
            Ok(0)
        }
        Err(fault) => {
            println!("broken: {} ({} receipts form a valid prefix)", fault, fault.index);
            Ok(1)
        }
    }
}

fn inspect_seed(config: &DaemonConfig, path: &Path, key: Option<&str>) -> anyhow::Result<i32> {
    let seed = match key {
        Some(b64) => SnapshotCodec::from_config(&config.metabolism)
            .import_file(path, &TrustedKey::from_b64(b64)?)?,
        None => {
            let identity = Identity::load(&config.storage.key_file)
                .with_context(|| format!("signing key {}", config.storage.key_file.display()))?;
            Coordinator::load_seed(config, Arc::new(identity), path)?
        }
    };
    println!("signer {}", seed.signer_b64());
    println!("{}", serde_json::to_string_pretty(seed.body())?);
    Ok(0)
}
