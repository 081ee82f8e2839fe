//! S3 adapter: objects under `<bucket>/<prefix>/`, streaming puts split into
//! multipart uploads so memory stays bounded by `part_size * max_concurrency`.

use super::{BackendError, Listing, ObjectBackend, ObjectInfo, ObjectStream, join_remote};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// S3 backend options
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint, e.g. a MinIO server. Path-style addressing is always used.
    pub endpoint: Option<String>,
    pub region: String,
    /// Part size in bytes; objects smaller than one part use a single PutObject.
    pub part_size: usize,
    /// Maximum concurrent part uploads per put.
    pub max_concurrency: usize,
    pub max_retries: u32,
    /// First retry delay, doubled on every attempt.
    pub initial_retry_delay_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 4,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    config: S3Config,
}

impl S3Backend {
    pub async fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        config: S3Config,
    ) -> Result<Self, BackendError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            config,
        })
    }

    fn key_for(&self, remote: &str) -> String {
        key_for(&self.prefix, remote)
    }

    fn remote_for<'a>(&self, key: &'a str) -> &'a str {
        remote_for(&self.prefix, key)
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn put_single(&self, key: &str, data: Vec<u8>) -> Result<(), BackendError> {
        let checksum = Self::md5_base64(&data);
        let operation = || {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_md5(checksum.clone())
                .body(ByteStream::from(data.clone()))
                .send()
        };
        execute_with_retry(&self.config, "put_object", operation).await?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        body: &mut ObjectStream,
    ) -> Result<(), BackendError> {
        let create = execute_with_retry(&self.config, "create_multipart_upload", || {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| BackendError::remote("create_multipart_upload", "missing upload id"))?
            .to_string();

        let parts = match self.upload_parts(key, &upload_id, first, body).await {
            Ok(parts) => parts,
            Err(e) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    tracing::warn!(
                        key,
                        "abort multipart upload failed: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                return Err(e);
            }
        };

        let completed_parts = parts
            .into_iter()
            .map(|(pn, etag)| CompletedPart::builder().part_number(pn).set_e_tag(etag).build())
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        execute_with_retry(&self.config, "complete_multipart_upload", || {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(completed.clone())
                .send()
        })
        .await?;
        Ok(())
    }

    /// Upload `first` and every following part read from `body`, keeping at
    /// most `max_concurrency` parts in flight.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut ObjectStream,
    ) -> Result<Vec<(i32, Option<String>)>, BackendError> {
        let mut tasks = JoinSet::new();
        let mut done = Vec::new();
        let mut part_number = 1i32;
        let mut data = first;
        loop {
            if tasks.len() >= self.config.max_concurrency.max(1) {
                if let Some(joined) = tasks.join_next().await {
                    done.push(joined.map_err(|e| BackendError::remote("upload_part", e))??);
                }
            }
            tasks.spawn(upload_part(
                self.client.clone(),
                self.config.clone(),
                self.bucket.clone(),
                key.to_string(),
                upload_id.to_string(),
                part_number,
                data,
            ));
            part_number += 1;
            data = read_part(body, self.config.part_size).await?;
            if data.is_empty() {
                break;
            }
        }
        while let Some(joined) = tasks.join_next().await {
            done.push(joined.map_err(|e| BackendError::remote("upload_part", e))??);
        }
        done.sort_by_key(|(pn, _)| *pn);
        Ok(done)
    }
}

/// Object key for `remote`; the root maps to the bare prefix.
fn key_for(prefix: &str, remote: &str) -> String {
    if remote.is_empty() {
        prefix.to_string()
    } else {
        join_remote(prefix, remote)
    }
}

/// Inverse of [`key_for`]. Only strips `prefix` at a segment boundary.
fn remote_for<'a>(prefix: &str, key: &'a str) -> &'a str {
    if prefix.is_empty() {
        return key;
    }
    key.strip_prefix(prefix)
        .and_then(|k| k.strip_prefix('/'))
        .unwrap_or(key)
}

async fn upload_part(
    client: Client,
    config: S3Config,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    data: Vec<u8>,
) -> Result<(i32, Option<String>), BackendError> {
    let checksum = S3Backend::md5_base64(&data);
    let operation = || {
        client
            .upload_part()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .content_md5(checksum.clone())
            .body(ByteStream::from(data.clone()))
            .send()
    };
    let resp = execute_with_retry(&config, "upload_part", operation).await?;
    Ok((part_number, resp.e_tag().map(|s| s.to_string())))
}

async fn execute_with_retry<T, E, F, Fut>(
    config: &S3Config,
    operation_name: &'static str,
    operation: F,
) -> Result<T, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let message = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => DisplayErrorContext(&e).to_string(),
        };
        if attempt > config.max_retries {
            return Err(BackendError::remote(
                operation_name,
                format!("after {attempt} attempts: {message}"),
            ));
        }
        let delay_ms = config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
        tracing::debug!(operation_name, attempt, delay_ms, "retrying S3 request: {message}");
        sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Read up to `size` bytes, short only at end of stream.
async fn read_part(body: &mut ObjectStream, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size);
    (&mut *body).take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

fn to_system_time(dt: &DateTime) -> SystemTime {
    match u64::try_from(dt.secs()) {
        Ok(secs) => UNIX_EPOCH + Duration::new(secs, dt.subsec_nanos()),
        Err(_) => UNIX_EPOCH,
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn list(&self, dir: &str) -> Result<Listing, BackendError> {
        let dir_key = self.key_for(dir);
        let list_prefix = if dir_key.is_empty() {
            String::new()
        } else {
            format!("{dir_key}/")
        };
        let mut listing = Listing::default();
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .delimiter("/")
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| BackendError::remote("list_objects_v2", DisplayErrorContext(&e)))?;
            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                // Skip "directory marker" objects some tools create.
                if key == list_prefix {
                    continue;
                }
                let size = obj.size().unwrap_or(0).max(0) as u64;
                let mod_time = obj.last_modified().map(to_system_time).unwrap_or(UNIX_EPOCH);
                listing
                    .objects
                    .push(ObjectInfo::new(self.remote_for(key), size, mod_time));
            }
            for cp in resp.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    listing
                        .dirs
                        .push(self.remote_for(p.trim_end_matches('/')).to_string());
                }
            }
            match resp.next_continuation_token() {
                Some(t) if resp.is_truncated().unwrap_or(false) => token = Some(t.to_string()),
                _ => break,
            }
        }
        if !dir.is_empty() && listing.is_empty() {
            return Err(BackendError::DirNotFound(dir.to_string()));
        }
        Ok(listing)
    }

    async fn stat(&self, remote: &str) -> Result<ObjectInfo, BackendError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key_for(remote))
            .send()
            .await;
        match resp {
            Ok(o) => {
                let size = o.content_length().unwrap_or(0).max(0) as u64;
                let mod_time = o.last_modified().map(to_system_time).unwrap_or(UNIX_EPOCH);
                let mut info = ObjectInfo::new(remote, size, mod_time);
                info.content_type = o.content_type().map(str::to_string);
                Ok(info)
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                Err(BackendError::ObjectNotFound(remote.to_string()))
            }
            Err(e) => Err(BackendError::remote("head_object", DisplayErrorContext(&e))),
        }
    }

    async fn open(&self, object: &ObjectInfo) -> Result<ObjectStream, BackendError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(&object.remote))
            .send()
            .await;
        match resp {
            Ok(o) => Ok(Box::new(Box::pin(o.body.into_async_read()))),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                Err(BackendError::ObjectNotFound(object.remote.clone()))
            }
            Err(e) => Err(BackendError::remote("get_object", DisplayErrorContext(&e))),
        }
    }

    async fn put(&self, remote: &str, mut body: ObjectStream) -> Result<ObjectInfo, BackendError> {
        let key = self.key_for(remote);
        let first = read_part(&mut body, self.config.part_size).await?;
        if first.len() < self.config.part_size {
            self.put_single(&key, first).await?;
        } else {
            self.put_multipart(&key, first, &mut body).await?;
        }
        self.stat(remote).await
    }

    async fn remove(&self, object: &ObjectInfo) -> Result<(), BackendError> {
        execute_with_retry(&self.config, "delete_object", || {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.key_for(&object.remote))
                .send()
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Needs a reachable S3 endpoint: REMOTEFS_S3_TEST=1 REMOTEFS_S3_ENDPOINT=http://127.0.0.1:9000
    #[tokio::test]
    async fn test_s3_backend_roundtrip() {
        if std::env::var("REMOTEFS_S3_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip s3 test: set REMOTEFS_S3_TEST=1 to enable");
            return;
        }
        let config = S3Config {
            endpoint: std::env::var("REMOTEFS_S3_ENDPOINT").ok(),
            part_size: 5 * 1024 * 1024,
            ..S3Config::default()
        };
        let backend = S3Backend::new("main", "remotefs-test", config).await.unwrap();

        let data = vec![7u8; 6 * 1024 * 1024];
        let info = backend
            .put("big/blob.bin", Box::new(Cursor::new(data.clone())))
            .await
            .unwrap();
        assert_eq!(info.size, data.len() as u64);

        let listing = backend.list("big").await.unwrap();
        assert!(listing.objects.iter().any(|o| o.remote == "big/blob.bin"));

        let mut out = Vec::new();
        backend
            .open(&info)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, data);
        backend.remove(&info).await.unwrap();
    }

    #[test]
    fn test_key_mapping_under_prefix() {
        assert_eq!(key_for("pre", ""), "pre");
        assert_eq!(key_for("pre", "a/b"), "pre/a/b");
        assert_eq!(key_for("", ""), "");
        assert_eq!(key_for("", "a"), "a");

        assert_eq!(remote_for("pre", "pre/a/b"), "a/b");
        assert_eq!(remote_for("pre", "prefix/a"), "prefix/a");
        assert_eq!(remote_for("", "a/b"), "a/b");
    }

    #[test]
    fn test_root_listing_prefix() {
        // list("") must ask S3 for "pre/", not "pre//"
        let dir_key = key_for("pre", "");
        assert_eq!(format!("{dir_key}/"), "pre/");
        assert_eq!(remote_for("pre", "pre/sub/".trim_end_matches('/')), "sub");
    }

    #[test]
    fn test_md5_base64() {
        assert_eq!(S3Backend::md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }
}
