//! Command-line interface for the Insteon dispatch engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use insteon_engine::{
    AddressId, ChannelLink, DeviceCommand, DeviceManager, EngineConfig, FeatureState,
    HandlerRegistry, InsteonAddress, LoadReport, MessageClass, TemplateCatalog, WireMessage,
};
use tokio::time::Instant;

/// Insteon dispatch engine tools.
#[derive(Parser, Debug)]
#[command(name = "insteon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load feature templates and device types and report problems.
    Validate {
        /// Catalog files to load on top of the built-in catalog.
        files: Vec<PathBuf>,
        /// Start from an empty catalog.
        #[arg(long)]
        no_builtin: bool,
    },
    /// Decode a received-message frame given as hex.
    Inspect {
        /// Frame bytes, e.g. "0250112233445566 2F1100". Spaces and colons are ignored.
        frame: String,
        /// Print the decoded fields as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Build one device, send it a command and print the frames written to the link.
    Simulate {
        /// Product key of the device type.
        #[arg(short, long, default_value = "F00.00.11")]
        product_key: String,
        /// Device address.
        #[arg(short, long, default_value = "11.22.33")]
        address: String,
        /// Feature receiving the command.
        #[arg(short, long, default_value = "switch")]
        feature: String,
        /// Command: ON, OFF, NN%, INCREASE, DECREASE, REFRESH or a number.
        #[arg(short, long, default_value = "ON")]
        command: String,
        /// Poll the whole device instead of sending a command.
        #[arg(long)]
        poll: bool,
        /// Answer every direct frame with an ack carrying the same cmd1/cmd2.
        #[arg(long)]
        reply: bool,
        /// Extra catalog files.
        #[arg(long)]
        catalog: Vec<PathBuf>,
        /// How long to run the scheduler.
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Validate { files, no_builtin } => run_validate(&files, no_builtin),
        Command::Inspect { frame, json } => run_inspect(&frame, json),
        Command::Simulate {
            product_key,
            address,
            feature,
            command,
            poll,
            reply,
            catalog,
            wait_ms,
        } => {
            run_simulate(SimulateArgs {
                product_key,
                address,
                feature,
                command,
                poll,
                reply,
                catalog,
                wait: Duration::from_millis(wait_ms),
            })
            .await
        }
    }
}

fn init_logging(verbose: bool) {
    // JSON output for log collectors
    let json_logging = std::env::var("INSTEON_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "insteon=debug" } else { "insteon=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

type LoadedCatalog = (TemplateCatalog, Vec<(PathBuf, LoadReport)>);

fn load_catalog(files: &[PathBuf], builtin: bool) -> Result<LoadedCatalog> {
    let mut catalog = if builtin {
        TemplateCatalog::builtin()
    } else {
        TemplateCatalog::new()
    };
    let mut reports = Vec::new();
    for path in files {
        let report = catalog
            .load_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        tracing::debug!(
            "Loaded {}: {} templates, {} device types",
            path.display(),
            report.templates_loaded,
            report.device_types_loaded
        );
        reports.push((path.clone(), report));
    }
    Ok((catalog, reports))
}

fn run_validate(files: &[PathBuf], no_builtin: bool) -> Result<()> {
    let (catalog, reports) = load_catalog(files, !no_builtin)?;

    let mut issues = 0;
    for (path, report) in &reports {
        println!(
            "{}: {} templates, {} device types",
            path.display(),
            report.templates_loaded,
            report.device_types_loaded
        );
        for issue in &report.issues {
            println!("  error in {}: {}", issue.context, issue.error);
        }
        issues += report.issues.len();
    }

    println!(
        "Catalog: {} templates, {} device types",
        catalog.template_count(),
        catalog.device_type_count()
    );
    for key in catalog.product_keys() {
        if let Some(definition) = catalog.device_type(key) {
            println!(
                "  {} {} ({} features, {} groups)",
                key,
                definition.model.as_deref().unwrap_or("-"),
                definition.features.len(),
                definition.feature_groups.len()
            );
        }
    }

    if issues > 0 {
        return Err(anyhow!("{} problem(s) found", issues));
    }
    println!("OK");
    Ok(())
}

fn run_inspect(frame: &str, json: bool) -> Result<()> {
    let cleaned: String = frame
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    let bytes = hex::decode(cleaned).context("Frame is not valid hex")?;
    let msg = WireMessage::decode(&bytes).context("Failed to decode frame")?;

    if json {
        let value = serde_json::json!({
            "from": msg.from_address().to_string(),
            "to": msg.to_address().to_string(),
            "class": msg.class(),
            "extended": msg.is_extended(),
            "hops_left": msg.hops_left(),
            "max_hops": msg.max_hops(),
            "cmd1": format!("0x{:02X}", msg.cmd1()),
            "cmd2": format!("0x{:02X}", msg.cmd2()),
            "group": msg.group(),
            "user_data": msg.user_data().map(hex::encode_upper),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("From:      {}", msg.from_address());
    println!("To:        {}", msg.to_address());
    println!("Class:     {}", msg.class());
    println!("Extended:  {}", msg.is_extended());
    println!("Hops:      {}/{}", msg.hops_left(), msg.max_hops());
    println!("Cmd1:      0x{:02X}", msg.cmd1());
    println!("Cmd2:      0x{:02X}", msg.cmd2());
    if let Some(group) = msg.group() {
        println!("Group:     {}", group);
    }
    if let Some(data) = msg.user_data() {
        println!("User data: {}", hex::encode_upper(data));
    }
    if msg.class() == MessageClass::NackOfDirect {
        println!("Nack:      {}", insteon_engine::nack_reason(msg.cmd2()));
    }
    Ok(())
}

struct SimulateArgs {
    product_key: String,
    address: String,
    feature: String,
    command: String,
    poll: bool,
    reply: bool,
    catalog: Vec<PathBuf>,
    wait: Duration,
}

async fn run_simulate(args: SimulateArgs) -> Result<()> {
    let address: AddressId = args
        .address
        .parse()
        .with_context(|| format!("Bad address {}", args.address))?;
    let command: DeviceCommand = args.command.parse().map_err(|e: String| anyhow!(e))?;

    let (catalog, reports) = load_catalog(&args.catalog, true)?;
    for (path, report) in &reports {
        for issue in &report.issues {
            eprintln!("{}: error in {}: {}", path.display(), issue.context, issue.error);
        }
    }

    let (link, mut frames) = ChannelLink::new();
    let manager = DeviceManager::new(
        EngineConfig::from_env(),
        HandlerRegistry::with_builtins(),
        catalog,
        Arc::new(link),
    );
    let device = manager.add_device(address, &args.product_key)?;
    println!(
        "Device {} ({}, {} features)",
        device.address(),
        device.product_key(),
        device.features().len()
    );
    for feature in device.features() {
        feature.add_listener(|name: &str, state: &FeatureState| {
            println!("State {} = {}", name, state);
        });
    }

    manager.start().await;
    let started = Instant::now();
    if args.poll {
        println!("Poll {}", device.address());
        manager.poll(&address, Duration::ZERO)?;
    } else {
        println!("Command {} -> {}", command, args.feature);
        manager.send_command(&address, &args.feature, &command)?;
    }

    let deadline = started + args.wait;
    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames.recv()).await {
        println!(
            "[{:>6}ms] {} {}",
            frame.at.duration_since(started).as_millis(),
            hex::encode_upper(frame.msg.encode()),
            frame.msg
        );
        if args.reply && frame.msg.is_direct() {
            if let Some(from) = frame.target.as_insteon() {
                let ack = WireMessage::standard(
                    from,
                    InsteonAddress::default(),
                    MessageClass::AckOfDirect,
                    frame.msg.cmd1(),
                    frame.msg.cmd2(),
                );
                manager.on_frame_received(&ack);
            }
        }
    }
    manager.stop().await;

    if let Some(feature) = device.outstanding_feature() {
        println!("Still waiting for a reply to {}", feature);
    }
    Ok(())
}
