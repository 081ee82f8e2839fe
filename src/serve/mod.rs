//! Read-only HTTP browser over a remote.
//!
//! `GET /dir/` renders an HTML index of one directory level and `GET /file`
//! streams an object. Every request goes straight to the backend.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use thiserror::Error;
use tokio::signal;
use tokio_util::io::ReaderStream;

use crate::cadapter::{BackendError, ObjectBackend, ObjectInfo, is_clean_remote, leaf_of};
use crate::config::ServeConfig;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Directory not found")]
    DirNotFound,

    #[error("File not found")]
    FileNotFound,

    #[error("Invalid path")]
    BadPath,

    #[error("Failed to list directory.")]
    List(#[source] BackendError),

    #[error("Failed to find file.")]
    Stat(#[source] BackendError),

    #[error("Failed to open file.")]
    Open(#[source] BackendError),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServeError::DirNotFound | ServeError::FileNotFound => StatusCode::NOT_FOUND,
            ServeError::BadPath => StatusCode::BAD_REQUEST,
            ServeError::List(e) | ServeError::Stat(e) | ServeError::Open(e) => {
                tracing::error!("{self}: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct ServeState {
    backend: Arc<dyn ObjectBackend>,
}

impl ServeState {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }
}

pub fn create_router(state: ServeState) -> Router {
    Router::new()
        .route("/", get(browse_root))
        .route("/{*path}", get(browse))
        .with_state(state)
}

/// Serve `backend` until Ctrl-C or SIGTERM.
pub async fn run(config: &ServeConfig, backend: Arc<dyn ObjectBackend>) -> std::io::Result<()> {
    let app = create_router(ServeState::new(backend.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(remote = %backend.name(), "serving on http://{}/", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn browse_root(State(state): State<ServeState>) -> Result<Response, ServeError> {
    serve_dir(&state, "").await
}

async fn browse(
    State(state): State<ServeState>,
    Path(path): Path<String>,
) -> Result<Response, ServeError> {
    let (remote, is_dir) = match path.strip_suffix('/') {
        Some(dir) => (dir, true),
        None => (path.as_str(), false),
    };
    if !is_clean_remote(remote) {
        tracing::debug!(path = %path, "rejecting unclean path");
        return Err(ServeError::BadPath);
    }
    if is_dir {
        serve_dir(&state, remote).await
    } else {
        serve_file(&state, remote).await
    }
}

async fn serve_dir(state: &ServeState, dir: &str) -> Result<Response, ServeError> {
    let listing = match state.backend.list(dir).await {
        Ok(listing) => listing,
        Err(BackendError::DirNotFound(_)) => return Err(ServeError::DirNotFound),
        Err(e) => return Err(ServeError::List(e)),
    };
    let mut entries: Vec<(String, bool)> = listing
        .objects
        .iter()
        .map(|o| (o.remote.clone(), false))
        .chain(listing.dirs.into_iter().map(|d| (d, true)))
        .collect();
    entries.sort();
    tracing::debug!(dir, count = entries.len(), "serving directory index");
    Ok(Html(render_index(dir, &entries)).into_response())
}

async fn serve_file(state: &ServeState, remote: &str) -> Result<Response, ServeError> {
    let info = match state.backend.stat(remote).await {
        Ok(info) => info,
        Err(e) if e.is_not_found() => return Err(ServeError::FileNotFound),
        Err(e) => return Err(ServeError::Stat(e)),
    };
    let reader = state.backend.open(&info).await.map_err(ServeError::Open)?;
    tracing::debug!(remote, size = info.size, "serving file");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, info.size);
    if let Some(content_type) = content_type_for(&info) {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok(response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Declared type, else a guess from the extension. `None` only when the
/// object has neither, leaving the client to sniff.
fn content_type_for(info: &ObjectInfo) -> Option<String> {
    if let Some(declared) = &info.content_type {
        return Some(declared.clone());
    }
    let path = std::path::Path::new(leaf_of(&info.remote));
    path.extension()?;
    Some(
        mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string(),
    )
}

/// HTML index of one directory; `entries` are `(remote, is_dir)` in display order.
pub fn render_index(dir: &str, entries: &[(String, bool)]) -> String {
    let mut out = String::from("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(out, "<title>{}</title>", escape_html(&format!("Directory: {dir}")));
    out.push_str("</head>\n<body>\n");
    for (remote, is_dir) in entries {
        let mut leaf = leaf_of(remote).to_string();
        if *is_dir {
            leaf.push('/');
        }
        let escaped = escape_html(&leaf);
        let _ = writeln!(out, "<a href=\"{escaped}\">{escaped}</a><br />");
    }
    out.push_str("</body>\n</html>\n");
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
}
