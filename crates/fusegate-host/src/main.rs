// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fusegate host: mounts one of the sample filesystems through the bridge

mod error;
mod jsonfs;
mod memfs;
mod mirrorfs;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fusegate_core::MountConfig;
use fusegate_logging::{CliLogLevel, CliLoggingArgs};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SampleFs {
    /// Path-addressed JSON tree
    Jsonfs,
    /// Inode-addressed in-memory store
    Memfs,
    /// Path-addressed passthrough onto `--source`
    Mirrorfs,
}

#[derive(Parser, Debug)]
#[command(name = "fusegate-host", version, about = "Mount a sample fusegate filesystem")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Mount configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Which sample filesystem to serve
    #[arg(long, value_enum, default_value_t = SampleFs::Jsonfs)]
    fs: SampleFs,

    /// JSON document to populate the filesystem from
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Write the jsonfs tree here on unmount
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Directory mirrored by mirrorfs
    #[arg(long, required_if_eq("fs", "mirrorfs"))]
    source: Option<PathBuf>,

    /// Extra mount options, comma separated
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Log every dispatched call
    #[arg(short, long)]
    debug: bool,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn load_config(config_path: Option<&Path>) -> Result<MountConfig> {
    match config_path {
        Some(path) => MountConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(MountConfig::default()),
    }
}

fn load_seed(seed_path: Option<&Path>) -> Result<Option<Value>> {
    let Some(path) = seed_path else {
        return Ok(None);
    };
    let content = fs::read_to_string(path).with_context(|| format!("failed to read seed {}", path.display()))?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Fold the command line into the loaded configuration
fn mount_config(args: &Args) -> Result<MountConfig> {
    let mut config = load_config(args.config.as_deref())?;
    config.mount_point = args.mount_point.clone();
    config.debug |= args.debug;
    config.options.extend(args.options.iter().cloned());
    for (enabled, option) in [
        (args.allow_other, "allow_other"),
        (args.allow_root, "allow_root"),
        (args.auto_unmount, "auto_unmount"),
    ] {
        if enabled {
            config.options.push(option.to_string());
        }
    }
    Ok(config.apply_env())
}

fn main() -> Result<()> {
    let mut args = Args::parse();

    let config = mount_config(&args)?;
    if config.debug && args.logging.log_level.is_none() {
        args.logging.log_level = Some(CliLogLevel::Debug);
    }
    args.logging.clone().init("fusegate-host")?;

    info!(mount_point = %config.mount_point.display(), fs = ?args.fs, "starting fusegate host");
    info!("Configuration loaded: {:?}", config);

    let seed = load_seed(args.seed.as_deref())?;
    match args.fs {
        SampleFs::Jsonfs => {
            let tree = match &seed {
                Some(document) => jsonfs::JsonTree::from_json(document)?,
                None => jsonfs::JsonTree::default(),
            };
            let snapshot = args.snapshot.clone().or_else(|| args.seed.clone());
            serve_jsonfs(config, tree, snapshot)
        }
        SampleFs::Memfs => {
            if args.snapshot.is_some() {
                warn!("--snapshot only applies to jsonfs; ignoring");
            }
            let store = match &seed {
                Some(document) => memfs::MemFs::from_json(document)?,
                None => memfs::MemFs::default(),
            };
            serve_memfs(config, store)
        }
        SampleFs::Mirrorfs => {
            if args.seed.is_some() || args.snapshot.is_some() {
                warn!("--seed and --snapshot do not apply to mirrorfs; ignoring");
            }
            let source = args.source.clone().context("mirrorfs needs --source")?;
            let mirror = mirrorfs::Mirror::new(&source)
                .with_context(|| format!("cannot mirror {}", source.display()))?;
            serve_mirrorfs(config, mirror)
        }
    }
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn serve_jsonfs(config: MountConfig, tree: jsonfs::JsonTree, snapshot: Option<PathBuf>) -> Result<()> {
    fusegate_core::mount_path(config, jsonfs::handlers(tree, snapshot))?;
    info!("jsonfs unmounted");
    Ok(())
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn serve_memfs(config: MountConfig, store: memfs::MemFs) -> Result<()> {
    fusegate_core::mount_inode(config, memfs::handlers(store))?;
    info!("memfs unmounted");
    Ok(())
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn serve_mirrorfs(config: MountConfig, mirror: mirrorfs::Mirror) -> Result<()> {
    fusegate_core::mount_path(config, mirrorfs::handlers(mirror))?;
    info!("mirrorfs unmounted");
    Ok(())
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
fn serve_jsonfs(config: MountConfig, tree: jsonfs::JsonTree, snapshot: Option<PathBuf>) -> Result<()> {
    let handlers = jsonfs::handlers(tree, snapshot);
    warn!("FUSE support not compiled in; nothing will be mounted");
    info!(mount_point = %config.mount_point.display(), operations = ?handlers.implemented(), "jsonfs handlers ready");
    info!("To enable FUSE support, compile with: cargo build --features fuse");
    Ok(())
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
fn serve_memfs(config: MountConfig, store: memfs::MemFs) -> Result<()> {
    let files = store.statfs().files;
    let handlers = memfs::handlers(store);
    warn!("FUSE support not compiled in; nothing will be mounted");
    info!(mount_point = %config.mount_point.display(), files, operations = ?handlers.implemented(), "memfs handlers ready");
    info!("To enable FUSE support, compile with: cargo build --features fuse");
    Ok(())
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
fn serve_mirrorfs(config: MountConfig, mirror: mirrorfs::Mirror) -> Result<()> {
    let source = mirror.root().to_path_buf();
    let handlers = mirrorfs::handlers(mirror);
    warn!("FUSE support not compiled in; nothing will be mounted");
    info!(
        mount_point = %config.mount_point.display(),
        source = %source.display(),
        operations = ?handlers.implemented(),
        "mirrorfs handlers ready"
    );
    info!("To enable FUSE support, compile with: cargo build --features fuse");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn command_line_extends_the_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "mount_point": "/ignored", "options": ["ro"], "attr_ttl_ms": 500 }}"#).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = Args::parse_from([
            "fusegate-host",
            "/mnt/json",
            "--config",
            path.as_str(),
            "-o",
            "noatime,fsname=demo",
            "--allow-other",
        ]);
        let config = mount_config(&args).unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/mnt/json"));
        assert_eq!(config.options, vec!["ro", "noatime", "fsname=demo", "allow_other"]);
        assert_eq!(config.attr_ttl_ms, 500);
        assert_eq!(args.fs, SampleFs::Jsonfs);
    }

    #[test]
    fn defaults_without_a_config_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config, MountConfig::default());
        assert!(load_seed(None).unwrap().is_none());
    }

    #[test]
    fn mirrorfs_requires_a_source() {
        assert!(Args::try_parse_from(["fusegate-host", "/mnt/m", "--fs", "mirrorfs"]).is_err());
        let args = Args::parse_from(["fusegate-host", "/mnt/m", "--fs", "mirrorfs", "--source", "/srv/data"]);
        assert_eq!(args.fs, SampleFs::Mirrorfs);
        assert_eq!(args.source, Some(PathBuf::from("/srv/data")));
    }

    #[test]
    fn seed_must_be_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load_seed(Some(file.path())).is_err());
    }
}
