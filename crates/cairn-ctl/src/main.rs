//! cairn-ctl — operator CLI for the cairn daemon.
//!
//! `feature` edits the dynamic feature configuration directory the daemon
//! watches; `features` dumps the materialized state tree once. Neither
//! talks to the daemon directly — the filesystem is the interface.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cairn_core::node;

#[derive(Parser, Debug)]
#[command(name = "cairn-ctl", version, about = "operator CLI for the cairn daemon")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set, print or delete one feature in the configuration directory
    Feature {
        /// Feature name ([A-Za-z0-9_-]+)
        name: String,

        /// JSON value to set; prints the current value when omitted
        value: Option<String>,

        /// Write a deletion marker (an empty file removes the feature
        /// even when the daemon carries it as a static feature)
        #[arg(long)]
        delete: bool,

        /// Dynamic feature configuration directory
        #[arg(long, default_value = "/etc/cairn/features")]
        feature_dir: PathBuf,
    },

    /// Dump the materialized state tree: FEATURE<tab>HOST<tab>VALUE lines
    Features {
        /// Runtime state root
        #[arg(long, default_value = "/run/cairn/state")]
        state_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    match Args::parse().command {
        Command::Feature {
            name,
            value,
            delete,
            feature_dir,
        } => feature(&name, value.as_deref(), delete, &feature_dir),
        Command::Features { state_dir } => features(&state_dir),
    }
}

fn feature(name: &str, value: Option<&str>, delete: bool, feature_dir: &Path) -> Result<()> {
    if !node::is_valid_feature_name(name) {
        bail!("bad feature name: {name}");
    }

    let path = feature_dir.join(name);

    if delete {
        if value.is_some() {
            bail!("--delete takes no value");
        }
        std::fs::write(&path, b"")
            .with_context(|| path.display().to_string())?;
        return Ok(());
    }

    match value {
        Some(text) => {
            let value: serde_json::Value =
                serde_json::from_str(text).context("value is not valid JSON")?;
            std::fs::write(&path, serde_json::to_string(&value)?)
                .with_context(|| path.display().to_string())?;
        }
        None => match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => println!("{name}: deleted"),
            Ok(text) => println!("{}", text.trim_end()),
            Err(_) => println!("{name}: not set"),
        },
    }

    Ok(())
}

fn features(state_dir: &Path) -> Result<()> {
    let feature_dir = state_dir.join("features");

    for entry in walkdir::WalkDir::new(&feature_dir).min_depth(2).max_depth(2) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let host = entry.file_name().to_string_lossy();
        let feature = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();

        let data = std::fs::read(entry.path())
            .with_context(|| entry.path().display().to_string())?;
        let value: serde_json::Value = serde_json::from_slice(&data)
            .with_context(|| entry.path().display().to_string())?;

        println!("{feature}\t{host}\t{}", serde_json::to_string(&value)?);
    }

    Ok(())
}
