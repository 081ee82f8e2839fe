use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cadapter::s3::S3Config;
use crate::vfs::VfsOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid remote `{0}`: expected memory:, local:<path>, <absolute path> or s3://<bucket>[/<prefix>]")]
    InvalidRemote(String),

    #[error("mount point `{0}` is not a directory")]
    MountPointNotDir(PathBuf),

    #[error("write buffer size must be positive")]
    ZeroWriteBuffer,
}

/// Where the objects live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteSpec {
    Memory,
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl FromStr for RemoteSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory:" {
            return Ok(RemoteSpec::Memory);
        }
        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(ConfigError::InvalidRemote(s.to_string()));
            }
            return Ok(RemoteSpec::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }
        if let Some(path) = s.strip_prefix("local:") {
            if path.is_empty() {
                return Err(ConfigError::InvalidRemote(s.to_string()));
            }
            return Ok(RemoteSpec::Local(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(RemoteSpec::Local(PathBuf::from(s)));
        }
        Err(ConfigError::InvalidRemote(s.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    pub remote: RemoteSpec,
    pub vfs: VfsOptions,
    /// TTL the kernel may cache entries and attributes for.
    pub attr_ttl: Duration,
    pub allow_other: bool,
    /// Mount through the kernel directly instead of fusermount3.
    pub privileged: bool,
    pub s3: S3Config,
}

impl MountConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vfs.write_buffer_size == 0 {
            return Err(ConfigError::ZeroWriteBuffer);
        }
        if self.mount_point.exists() && !self.mount_point.is_dir() {
            return Err(ConfigError::MountPointNotDir(self.mount_point.clone()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub remote: RemoteSpec,
    pub bind: SocketAddr,
    pub s3: S3Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_spec() {
        assert_eq!("memory:".parse::<RemoteSpec>().unwrap(), RemoteSpec::Memory);
        assert_eq!(
            "local:/srv/data".parse::<RemoteSpec>().unwrap(),
            RemoteSpec::Local(PathBuf::from("/srv/data"))
        );
        assert_eq!(
            "/srv/data".parse::<RemoteSpec>().unwrap(),
            RemoteSpec::Local(PathBuf::from("/srv/data"))
        );
        assert_eq!(
            "s3://bucket/some/prefix/".parse::<RemoteSpec>().unwrap(),
            RemoteSpec::S3 {
                bucket: "bucket".into(),
                prefix: "some/prefix".into()
            }
        );
        assert_eq!(
            "s3://bucket".parse::<RemoteSpec>().unwrap(),
            RemoteSpec::S3 {
                bucket: "bucket".into(),
                prefix: String::new()
            }
        );
        assert!("s3://".parse::<RemoteSpec>().is_err());
        assert!("relative/path".parse::<RemoteSpec>().is_err());
        assert!("local:".parse::<RemoteSpec>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let cfg = MountConfig {
            mount_point: std::env::temp_dir(),
            remote: RemoteSpec::Memory,
            vfs: VfsOptions {
                no_modtime: false,
                write_buffer_size: 0,
            },
            attr_ttl: Duration::from_secs(1),
            allow_other: false,
            privileged: false,
            s3: S3Config::default(),
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroWriteBuffer)));
    }
}
