use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use etcdfs::config::EtcdConfig;
use etcdfs::fuse::EtcdFuse;
use etcdfs::fuse::mount::mount_unprivileged;
use etcdfs::store::EtcdTreeStore;
use etcdfs::PathFs;
use log::{error, info};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "etcdfs", version, about = "Mount an etcd key space as a filesystem")]
struct Args {
    /// Empty directory to mount on
    mountpoint: PathBuf,
    /// etcd endpoint, e.g. http://127.0.0.1:2379
    endpoint: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = EtcdConfig::from_endpoint(&args.endpoint)?.with_env()?;
    let store = EtcdTreeStore::connect(&cfg)
        .await
        .with_context(|| format!("connect to etcd at {}", args.endpoint))?;
    // fail now rather than on the first request
    store
        .ping()
        .await
        .with_context(|| format!("etcd at {} is not reachable", args.endpoint))?;
    info!("connected to etcd at {:?}", cfg.endpoints);

    let fs = EtcdFuse::new(PathFs::new(Arc::new(store)));
    let mut handle = mount_unprivileged(fs, &args.mountpoint)
        .await
        .with_context(|| format!("mount on {}", args.mountpoint.display()))?;
    info!("mounted etcdfs at {}", args.mountpoint.display());

    tokio::select! {
        res = &mut handle => {
            res.context("FUSE session")?;
            info!("FUSE session ended");
        }
        _ = signal::ctrl_c() => {
            info!("unmounting {}", args.mountpoint.display());
            handle.unmount().await.context("unmount")?;
        }
    }
    Ok(())
}
