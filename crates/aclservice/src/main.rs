//! `aclcompile`: compiles a JSON snapshot of ACLs and ports and prints the
//! resulting flows.
//!
//! Diagnostic tool; nothing is programmed on a switch.

use aclservice::ofctl::render_line;
use aclservice::{
    AclService, AclServiceConfig, AclServiceError, FlowEntry, FlowInstaller, LocalTagPool,
};
use aclservice_types::{Acl, AclInterface};
use anyhow::{bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// ACL flow compiler
#[derive(Parser, Debug)]
#[command(name = "aclcompile")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON snapshot with `acls` and `ports`
    #[arg(short = 's', long)]
    snapshot: PathBuf,

    /// TOML service configuration
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Print flows as JSON instead of ofctl lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Snapshot {
    acls: Vec<Acl>,
    ports: Vec<AclInterface>,
}

#[derive(Serialize)]
struct JsonBatch<'a> {
    key: &'a str,
    flows: &'a [FlowEntry],
}

/// Writes every submitted batch to stdout.
#[derive(Debug)]
struct PrintingInstaller {
    json: bool,
}

impl FlowInstaller for PrintingInstaller {
    fn submit(&self, batch_key: &str, flows: Vec<FlowEntry>) -> aclservice::Result<()> {
        if self.json {
            let line = serde_json::to_string(&JsonBatch {
                key: batch_key,
                flows: &flows,
            })
            .map_err(|e| AclServiceError::installer(batch_key, e.to_string()))?;
            println!("{}", line);
        } else {
            println!("# {}", batch_key);
            for flow in &flows {
                println!("{}", render_line(flow));
            }
        }
        Ok(())
    }
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => AclServiceConfig::from_file(path)?,
        None => AclServiceConfig::default(),
    };
    config.validate()?;

    let content = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("failed to read snapshot {}", args.snapshot.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse snapshot {}", args.snapshot.display()))?;
    info!(
        acls = snapshot.acls.len(),
        ports = snapshot.ports.len(),
        "loaded snapshot"
    );

    let pool = LocalTagPool::new(
        config.tag_pool.name.clone(),
        config.tag_pool.min,
        config.tag_pool.max,
    );
    let service = AclService::new(
        config,
        Arc::new(pool),
        Arc::new(|_: &str| -> Option<u64> { None }),
        Arc::new(PrintingInstaller { json: args.json }),
    );

    let mut failed = 0usize;
    let dpns: BTreeSet<u64> = snapshot.ports.iter().filter_map(AclInterface::dp_id).collect();
    for dp_id in dpns {
        if !service.on_switch_up(dp_id) {
            failed += 1;
        }
    }
    for acl in snapshot.acls {
        if !service.on_acl_added(acl) {
            failed += 1;
        }
    }
    for port in &snapshot.ports {
        if !service.on_port_bound(port) {
            failed += 1;
        }
    }

    let stats = service.stats();
    info!(
        batches = stats.batches_submitted,
        added = stats.flows_added,
        removed = stats.flows_removed,
        "compilation finished"
    );
    if failed > 0 {
        bail!("{} operations failed", failed);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
