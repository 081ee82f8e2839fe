use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "remotefs=info";
const DEBUG_FUSE_FILTER: &str = "rfuse3=debug,remotefs=debug";

fn filter(debug_fuse: bool) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    if !debug_fuse {
        return base;
    }
    DEBUG_FUSE_FILTER
        .split(',')
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(base, |f, directive| f.add_directive(directive))
}

/// Install the global subscriber. Logs go to stderr, or to `log_file` when
/// given; keep the returned guard alive so buffered lines get flushed.
pub fn init(log_file: Option<&Path>, debug_fuse: bool) -> std::io::Result<Option<WorkerGuard>> {
    let registry = tracing_subscriber::registry().with(filter(debug_fuse));
    match log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let name = path.file_name().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "log file has no name")
            })?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_fuse_raises_levels() {
        let text = filter(true).to_string();
        assert!(text.contains("rfuse3=debug"));
        assert!(text.contains("remotefs=debug"));
    }
}
