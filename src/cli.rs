use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cadapter::s3::S3Config;
use crate::config::{ConfigError, MountConfig, RemoteSpec, ServeConfig};
use crate::vfs::{DEFAULT_WRITE_BUFFER, VfsOptions};

#[derive(Parser, Debug)]
#[command(name = "remotefs", version, about = "Mount or browse an object store", long_about = None)]
pub struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "REMOTEFS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Log every FUSE request
    #[arg(long, global = true)]
    pub debug_fuse: bool,

    #[command(flatten)]
    pub s3: S3Args,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount REMOTE at MOUNTPOINT
    Mount(MountArgs),
    /// Serve REMOTE read-only over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct MountArgs {
    /// memory:, local:<path>, <absolute path> or s3://<bucket>[/<prefix>]
    pub remote: RemoteSpec,

    pub mount_point: PathBuf,

    /// Don't report object modification times
    #[arg(long)]
    pub no_modtime: bool,

    /// Bytes buffered between kernel writes and the upload
    #[arg(long, default_value_t = DEFAULT_WRITE_BUFFER)]
    pub write_buffer_size: usize,

    /// How long the kernel may cache attributes and entries
    #[arg(long, default_value_t = 1000)]
    pub attr_ttl_ms: u64,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Mount directly instead of through fusermount3 (needs root)
    #[arg(long)]
    pub privileged: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    pub remote: RemoteSpec,

    /// IP address and port to listen on
    #[arg(long, env = "REMOTEFS_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,
}

#[derive(Args, Debug)]
pub struct S3Args {
    /// Custom S3 endpoint, e.g. a MinIO server
    #[arg(long, global = true, env = "REMOTEFS_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, global = true, env = "REMOTEFS_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Multipart upload part size in bytes
    #[arg(long, global = true, default_value_t = 8 * 1024 * 1024)]
    pub s3_part_size: usize,
}

impl S3Args {
    pub fn to_config(&self) -> S3Config {
        S3Config {
            endpoint: self.s3_endpoint.clone(),
            region: self.s3_region.clone(),
            part_size: self.s3_part_size,
            ..S3Config::default()
        }
    }
}

impl MountArgs {
    pub fn to_config(&self, s3: &S3Args) -> Result<MountConfig, ConfigError> {
        let config = MountConfig {
            mount_point: self.mount_point.clone(),
            remote: self.remote.clone(),
            vfs: VfsOptions {
                no_modtime: self.no_modtime,
                write_buffer_size: self.write_buffer_size,
            },
            attr_ttl: Duration::from_millis(self.attr_ttl_ms),
            allow_other: self.allow_other,
            privileged: self.privileged,
            s3: s3.to_config(),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ServeArgs {
    pub fn to_config(&self, s3: &S3Args) -> ServeConfig {
        ServeConfig {
            remote: self.remote.clone(),
            bind: self.bind,
            s3: s3.to_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount() {
        let cli = Cli::try_parse_from([
            "remotefs",
            "mount",
            "memory:",
            "/mnt/x",
            "--no-modtime",
            "--write-buffer-size",
            "4096",
            "--s3-region",
            "eu-west-1",
        ])
        .unwrap();
        let Command::Mount(args) = &cli.command else {
            panic!("expected mount");
        };
        assert_eq!(args.remote, RemoteSpec::Memory);
        assert!(args.no_modtime);
        assert_eq!(args.attr_ttl_ms, 1000);
        let s3 = cli.s3.to_config();
        assert_eq!(s3.region, "eu-west-1");
        assert_eq!(s3.part_size, 8 * 1024 * 1024);

        let config = args.to_config(&cli.s3).unwrap();
        assert_eq!(config.vfs.write_buffer_size, 4096);
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["remotefs", "serve", "s3://bucket/p", "--bind", "0.0.0.0:9000"])
            .unwrap();
        let Command::Serve(args) = &cli.command else {
            panic!("expected serve");
        };
        let config = args.to_config(&cli.s3);
        assert_eq!(config.bind.port(), 9000);
        assert!(matches!(config.remote, RemoteSpec::S3 { .. }));
    }

    #[test]
    fn test_rejects_bad_remote() {
        assert!(Cli::try_parse_from(["remotefs", "serve", "relative/dir"]).is_err());
    }
}
