use anyhow::Context;
use clap::Parser;

use remotefs::cadapter::open_backend;
use remotefs::cli::{Cli, Command, MountArgs, S3Args, ServeArgs};
use remotefs::fuse::mount::mount_remote;
use remotefs::serve;
use remotefs::vfs::fs::RemoteFs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = remotefs::logging::init(cli.log_file.as_deref(), cli.debug_fuse)
        .context("failed to set up logging")?;

    match &cli.command {
        Command::Mount(args) => run_mount(args, &cli.s3).await,
        Command::Serve(args) => run_serve(args, &cli.s3).await,
    }
}

async fn run_mount(args: &MountArgs, s3: &S3Args) -> anyhow::Result<()> {
    let config = args.to_config(s3)?;
    let backend = open_backend(&config.remote, &config.s3)
        .await
        .with_context(|| format!("failed to open remote {:?}", config.remote))?;
    let fs = RemoteFs::new(backend, config.vfs.clone()).with_attr_ttl(config.attr_ttl);

    let mut handle = mount_remote(fs, &config).await.with_context(|| {
        format!(
            "mount at {} failed; is FUSE (fusermount3) available?",
            config.mount_point.display()
        )
    })?;
    tracing::info!(mount_point = %config.mount_point.display(), "mounted, press Ctrl+C to unmount");

    tokio::select! {
        res = &mut handle => res.context("filesystem session ended with an error")?,
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl+C")?;
            tracing::info!("unmounting");
            handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}

async fn run_serve(args: &ServeArgs, s3: &S3Args) -> anyhow::Result<()> {
    let config = args.to_config(s3);
    let backend = open_backend(&config.remote, &config.s3)
        .await
        .with_context(|| format!("failed to open remote {:?}", config.remote))?;
    serve::run(&config, backend)
        .await
        .with_context(|| format!("HTTP server on {} failed", config.bind))
}
