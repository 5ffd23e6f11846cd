mod branch;
mod cache;
mod clonepath;
mod config;
mod engine;
mod fs;
mod fsio;
mod handle_table;
mod policy;
mod ugid;
mod util;

use branch::{Branches, parse_branch_list, parse_size};
use clap::Parser;
use config::{CacheFiles, Config, FollowSymlinks};
use fs::PoolFs;
use fuse3::MountOptions;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use policy::{Category, Policy};
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "poolfs-rs")]
#[command(about = "FUSE union filesystem pooling multiple directories with per-operation branch policies")]
struct Cli {
    /// Colon-separated branch list: /path[=RW|=RO|=NC[=<minfreespace>]].
    branches: String,

    /// Mount point for the pooled filesystem.
    mountpoint: PathBuf,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Global free-space floor for create policies (K/M/G/T suffixes).
    #[arg(long, default_value = "4G", value_parser = parse_size)]
    min_free_space: u64,

    /// Per-operation policy override, e.g. --func create=mfs. Repeatable.
    #[arg(long, value_name = "OP=POLICY")]
    func: Vec<String>,

    /// Per-category policy override, e.g. --category action=all. Repeatable.
    #[arg(long, value_name = "CATEGORY=POLICY")]
    category: Vec<String>,

    /// Page-cache mode: libfuse, off, partial, full, auto-full, per-process.
    #[arg(long, default_value = "libfuse")]
    cache_files: String,

    /// Process names exempted from direct I/O in per-process mode,
    /// pipe-separated.
    #[arg(long, value_name = "NAME|NAME|...")]
    cache_files_process_names: Option<String>,

    #[arg(long, default_value_t = false)]
    direct_io: bool,

    #[arg(long, default_value_t = false)]
    kernel_cache: bool,

    #[arg(long, default_value_t = false)]
    auto_cache: bool,

    #[arg(long, default_value_t = false)]
    writeback_cache: bool,

    /// Entry cache timeout in seconds.
    #[arg(long, default_value_t = 1)]
    cache_entry: u64,

    /// Negative entry cache timeout in seconds.
    #[arg(long, default_value_t = 0)]
    cache_negative_entry: u64,

    /// Attribute cache timeout in seconds.
    #[arg(long, default_value_t = 1)]
    cache_attr: u64,

    /// Symlink handling: never, directory, or all.
    #[arg(long, default_value = "never")]
    follow_symlinks: String,
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let branches = parse_branch_list(&cli.branches).map_err(anyhow::Error::msg)?;
    let mut cfg = Config::new(Arc::new(Branches::new(branches)), cli.min_free_space);

    cfg.cache_files = cli
        .cache_files
        .parse::<CacheFiles>()
        .map_err(anyhow::Error::msg)?;
    if let Some(names) = &cli.cache_files_process_names {
        cfg.cache_files_process_names = names
            .split('|')
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
    }
    cfg.direct_io = cli.direct_io;
    cfg.kernel_cache = cli.kernel_cache;
    cfg.auto_cache = cli.auto_cache;
    cfg.writeback_cache = cli.writeback_cache;
    cfg.cache_entry = Duration::from_secs(cli.cache_entry);
    cfg.cache_negative_entry = Duration::from_secs(cli.cache_negative_entry);
    cfg.cache_attr = Duration::from_secs(cli.cache_attr);
    cfg.follow_symlinks = cli
        .follow_symlinks
        .parse::<FollowSymlinks>()
        .map_err(anyhow::Error::msg)?;

    for spec in &cli.category {
        let (category, policy) = split_assignment(spec)?;
        let category = category.parse::<Category>().map_err(anyhow::Error::msg)?;
        let policy = policy.parse::<Policy>().map_err(anyhow::Error::msg)?;
        cfg.func.set_category(category, policy);
    }
    for spec in &cli.func {
        let (func, policy) = split_assignment(spec)?;
        let policy = policy.parse::<Policy>().map_err(anyhow::Error::msg)?;
        if !cfg.func.set(func, policy) {
            anyhow::bail!("unknown operation {func:?} in --func");
        }
    }

    Ok(cfg)
}

fn split_assignment(spec: &str) -> anyhow::Result<(&str, &str)> {
    spec.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected NAME=POLICY, got {spec:?}"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let poolfs = PoolFs::new(config);

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("poolfs-rs");
    mount_opts.allow_other(cli.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let handle = session.mount(poolfs, cli.mountpoint).await?;

    #[cfg(unix)]
    {
        // Listen for termination signals and unmount cleanly before exiting.
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| {
                let handle = handle.as_mut().expect("mount handle missing");
                Pin::new(handle).poll(cx)
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => {
                    let handle = handle.take().expect("mount handle missing");
                    handle.unmount().await
                }
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        // Block until the filesystem is unmounted. This keeps the
        // process alive instead of exiting immediately after mount.
        handle.await?;
    }

    Ok(())
}
