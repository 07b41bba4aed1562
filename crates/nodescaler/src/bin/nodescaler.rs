use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use nodescaler::common::setup::setup_logging;
use nodescaler::config::AutoScalerConfig;
use nodescaler::nodegroup::NodeGroupSnapshot;
use nodescaler::state::SavedState;

#[derive(Parser)]
#[command(author, about, version, disable_help_subcommand(true))]
struct RootOptions {
    /// Enables more detailed log output
    #[arg(long, env = "NODESCALER_DEBUG", global = true)]
    verbose: bool,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Load and validate a configuration file, then print the effective configuration
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,
    },
    /// Print the node groups stored in a state file
    ShowState {
        /// Path to the state file
        path: PathBuf,
    },
}

fn command_check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = AutoScalerConfig::load(&path)
        .with_context(|| format!("Cannot load configuration {}", path.display()))?;
    log::info!("Configuration {} is valid", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn bound(value: Option<u32>) -> String {
    value.map_or_else(|| "?".to_string(), |value| value.to_string())
}

fn print_group(group: &NodeGroupSnapshot) {
    let spec = &group.spec;
    println!(
        "{} ({:?}): {} node(s), {} pending, size {}..={}, high-water mark {}",
        spec.id,
        group.status,
        group.nodes.len(),
        group.pending.len(),
        bound(spec.min_size),
        bound(spec.max_size),
        group.ledger.high_water_mark()
    );
    for node in group.nodes.iter().chain(&group.pending) {
        println!(
            "  {:>3} {:<32} {:<10} {}",
            node.index,
            node.node_name,
            format!("{:?}", node.node_type),
            node.state
        );
    }
}

fn command_show_state(path: PathBuf) -> anyhow::Result<()> {
    let state = SavedState::load(&path)
        .with_context(|| format!("Cannot load state file {}", path.display()))?;
    println!("Saved at {}", state.saved_at.to_rfc3339());
    if state.groups.is_empty() {
        println!("No node groups");
    }
    for group in &state.groups {
        print_group(group);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.verbose);

    match opts.subcmd {
        SubCommand::CheckConfig { path } => command_check_config(path),
        SubCommand::ShowState { path } => command_show_state(path),
    }
}
