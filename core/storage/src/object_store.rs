//! S3-compatible object store provider (AWS S3, MinIO, Backblaze, etc.)

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream as S3ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Object};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, warn};

use polystore_common::{fold_case, split_name_prefix, Error, Result};

use crate::checksum::{self, Md5Digest};
use crate::config::ObjectStoreConfig;
use crate::descriptor::StorageDescriptor;
use crate::filter::{self, StorageFilter};
use crate::provider::{self, BackendKind, ByteStream, DescriptorStream, StorageProvider};

/// Size of every multipart upload part except the last.
///
/// S3 rejects parts under 5 MiB unless they are the final one.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Storage provider over one bucket.
///
/// Directories are virtual: a key `a/b/c.txt` implies `a` and `a/b`. Keys are
/// taken verbatim from the logical path, so `a//b.txt` and `/lead.txt` are
/// distinct objects that round-trip through enumerate and read.
pub struct ObjectStoreProvider {
    name: String,
    client: Client,
    bucket: String,
    part_size: usize,
}

impl ObjectStoreProvider {
    /// Build the client from static credentials.
    ///
    /// No request is made until the first operation.
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        if config.bucket_name.is_empty() {
            return Err(Error::Configuration("bucket name is empty".to_string()));
        }

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.expose().to_string(),
            None,
            None,
            "polystore",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region_name.clone()))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::with_client(
            config.name(),
            Client::from_conf(builder.build()),
            config.bucket_name.clone(),
        ))
    }

    /// Wrap an existing client.
    pub fn with_client(name: impl Into<String>, client: Client, bucket: impl Into<String>) -> Self {
        Self {
            name: fold_case(&name.into()).trim_end_matches('/').to_string(),
            client,
            bucket: bucket.into(),
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Switch writes to multipart uploads once `bytes` have been buffered.
    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    /// Object key of a logical path: everything after the name and one
    /// separator, unmodified.
    fn to_key<'p>(&self, logical: &'p str) -> Result<&'p str> {
        split_name_prefix(logical, &self.name).ok_or_else(|| {
            Error::Configuration(format!(
                "path '{}' is not addressed to storage '{}'",
                logical, self.name
            ))
        })
    }

    fn describe(
        &self,
        key: &str,
        size: Option<i64>,
        modified: Option<&S3DateTime>,
    ) -> StorageDescriptor {
        StorageDescriptor::file(
            key_name(key),
            logical_path(&self.name, key),
            to_utc(modified),
            size.unwrap_or_default().max(0) as u64,
        )
    }

    fn directory(&self, key: &str) -> StorageDescriptor {
        let name = match key.trim_end_matches('/') {
            "" => self.bucket.as_str(),
            trimmed => key_name(trimmed),
        };
        StorageDescriptor::directory(name, logical_path(&self.name, key), Utc::now())
    }

    /// Fetch one page of the listing under `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<String>,
        max_keys: Option<i32>,
    ) -> Result<(Vec<Object>, Option<String>)> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(token)
            .set_max_keys(max_keys)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, prefix, e))?;

        let next = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok((output.contents().to_vec(), next))
    }

    async fn begin_upload(&self, key: &str) -> Result<Multipart> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, key, e))?;

        let upload_id = output.upload_id().ok_or_else(|| {
            Error::io(logical_path(&self.name, key), "S3", "no upload id returned")
        })?;
        debug!(key, upload_id, "Started multipart upload");
        Ok(Multipart {
            upload_id: upload_id.to_string(),
            parts: Vec::new(),
        })
    }

    async fn upload_part(&self, key: &str, upload: &mut Multipart, body: Vec<u8>) -> Result<()> {
        let part_number = upload.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .content_md5(checksum::digest(&body))
            .body(S3ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, key, e))?;

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    /// Send the buffered tail as the last part and assemble the object.
    async fn complete_upload(
        &self,
        key: &str,
        upload: &mut Multipart,
        tail: Vec<u8>,
    ) -> Result<()> {
        if !tail.is_empty() {
            self.upload_part(key, upload, tail).await?;
        }

        let parts = CompletedMultipartUpload::builder()
            .set_parts(Some(upload.parts.clone()))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .multipart_upload(parts)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, key, e))?;
        Ok(())
    }

    /// Best effort: a failed abort leaves parts the bucket lifecycle reaps.
    async fn abort_upload(&self, key: &str, upload: &Multipart) {
        let aborted = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .send()
            .await;
        if let Err(e) = aborted {
            warn!(key, upload_id = %upload.upload_id, "Abort failed: {}", DisplayErrorContext(&e));
        }
    }
}

/// An open multipart upload and the parts sent so far.
struct Multipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

/// Logical path of `key`: the provider name, one separator, the raw key.
fn logical_path(name: &str, key: &str) -> String {
    if key.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", name, key)
    }
}

/// Last `/`-separated segment of a key.
fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Listing prefix for the children of the directory `key`.
fn directory_prefix(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

/// Whether `key` sits directly under `prefix`, with no further separator.
pub(crate) fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn to_utc(modified: Option<&S3DateTime>) -> DateTime<Utc> {
    modified
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// Translate an SDK failure on `key`.
fn map_sdk_error<E>(name: &str, key: &str, err: SdkError<E>) -> Error
where
    E: std::error::Error + 'static,
{
    let path = logical_path(name, key);
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            Error::connection(name, DisplayErrorContext(&err))
        }
        SdkError::ServiceError(service) => match service.raw().status().as_u16() {
            404 => Error::NotFound(path),
            status @ (401 | 403) => Error::connection(
                name,
                format!("HTTP {}: {}", status, DisplayErrorContext(&err)),
            ),
            status => Error::io(path, status.to_string(), DisplayErrorContext(&err)),
        },
        _ => Error::io(path, "SDK", DisplayErrorContext(&err)),
    }
}

struct Pages<'a> {
    provider: &'a ObjectStoreProvider,
    prefix: String,
    recursive: bool,
    filter: Option<&'a StorageFilter>,
    token: Option<String>,
    exhausted: bool,
    pending: VecDeque<Object>,
}

/// Produce the next matching object, fetching pages as needed.
async fn next_object(mut pages: Pages<'_>) -> Result<Option<(StorageDescriptor, Pages<'_>)>> {
    loop {
        if let Some(object) = pages.pending.pop_front() {
            let Some(key) = object.key() else { continue };
            if key.ends_with('/') || (!pages.recursive && !is_direct_child(&pages.prefix, key)) {
                continue;
            }
            let descriptor = pages
                .provider
                .describe(key, object.size(), object.last_modified());
            if filter::matches(pages.filter, &descriptor) {
                return Ok(Some((descriptor, pages)));
            }
            continue;
        }

        if pages.exhausted {
            return Ok(None);
        }

        let (objects, next) = pages
            .provider
            .list_page(&pages.prefix, pages.token.take(), None)
            .await?;
        pages.pending.extend(objects);
        pages.exhausted = next.is_none();
        pages.token = next;
    }
}

async fn next_body_chunk(
    mut body: S3ByteStream,
    logical: String,
) -> Result<Option<(Vec<u8>, S3ByteStream)>> {
    match body.try_next().await {
        Ok(Some(bytes)) => Ok(Some((bytes.to_vec(), body))),
        Ok(None) => Ok(None),
        Err(e) => Err(Error::io(logical, "BODY", DisplayErrorContext(&e))),
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn enumerate<'a>(
        &'a self,
        root: &str,
        recursive: bool,
        filter: Option<&'a StorageFilter>,
    ) -> DescriptorStream<'a> {
        let key = match self.to_key(root) {
            Ok(key) => key,
            Err(e) => return provider::failed(e),
        };

        let pages = Pages {
            provider: self,
            prefix: directory_prefix(key),
            recursive,
            filter,
            token: None,
            exhausted: false,
            pending: VecDeque::new(),
        };
        stream::try_unfold(pages, next_object).boxed()
    }

    async fn stat(&self, path: &str) -> Result<StorageDescriptor> {
        let key = self.to_key(path)?;
        if key.is_empty() {
            return Ok(self.directory(key));
        }

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match head {
            Ok(output) => {
                Ok(self.describe(key, output.content_length(), output.last_modified()))
            }
            Err(SdkError::ServiceError(e)) if e.raw().status().as_u16() == 404 => {
                let (objects, _) = self.list_page(&directory_prefix(key), None, Some(1)).await?;
                if objects.is_empty() {
                    Err(Error::NotFound(path.to_string()))
                } else {
                    Ok(self.directory(key))
                }
            }
            Err(e) => Err(map_sdk_error(&self.name, key, e)),
        }
    }

    async fn read(&self, descriptor: &StorageDescriptor) -> Result<ByteStream> {
        if descriptor.is_directory() {
            return Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                descriptor.logical_path
            )));
        }

        let key = self.to_key(&descriptor.logical_path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, key, e))?;

        let logical = descriptor.logical_path.clone();
        let stream = stream::try_unfold(output.body, move |body| {
            next_body_chunk(body, logical.clone())
        });
        Ok(Box::pin(stream))
    }

    /// Small objects go up in one `PutObject`. Once a part's worth of data
    /// has arrived the write switches to a multipart upload, which is aborted
    /// if the stream or any request fails. Prefix-only directories need no
    /// parents.
    async fn write(
        &self,
        path: &str,
        mut data: ByteStream,
        _create_parent_directories: bool,
    ) -> Result<String> {
        let key = self.to_key(path)?;

        let mut digest = Md5Digest::new();
        let mut buffer = Vec::new();
        let mut upload: Option<Multipart> = None;
        let mut size = 0usize;

        let streamed = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                digest.update(&chunk);
                size += chunk.len();
                buffer.extend_from_slice(&chunk);

                while buffer.len() >= self.part_size {
                    let rest = buffer.split_off(self.part_size);
                    let part = std::mem::replace(&mut buffer, rest);
                    if upload.is_none() {
                        upload = Some(self.begin_upload(key).await?);
                    }
                    if let Some(open) = upload.as_mut() {
                        self.upload_part(key, open, part).await?;
                    }
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = streamed {
            if let Some(open) = &upload {
                self.abort_upload(key, open).await;
            }
            return Err(e);
        }

        let checksum = digest.finish();
        match upload {
            None => {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_md5(&checksum)
                    .body(S3ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(&self.name, key, e))?;
            }
            Some(mut open) => {
                if let Err(e) = self.complete_upload(key, &mut open, buffer).await {
                    self.abort_upload(key, &open).await;
                    return Err(e);
                }
                debug!(key, parts = open.parts.len(), "Completed multipart upload");
            }
        }

        debug!("Put {} bytes to {}", size, path);
        Ok(checksum)
    }

    /// S3 delete is already idempotent.
    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.to_key(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.name, key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ObjectStoreProvider {
        let config = ObjectStoreConfig::new("id", "secret", "us-east-1", "bucketA")
            .with_endpoint("http://localhost:9000");
        ObjectStoreProvider::new(&config).unwrap()
    }

    #[test]
    fn test_direct_child() {
        assert!(is_direct_child("folder/", "folder/file.csv"));
        assert!(!is_direct_child("folder/", "folder/sub/file.csv"));
        assert!(!is_direct_child("folder/", "folder/"));
        assert!(is_direct_child("", "top.txt"));
        assert!(!is_direct_child("", "a/b.txt"));
        assert!(is_direct_child("a//", "a//b.txt"));
        assert!(!is_direct_child("a/", "a//b.txt"));
    }

    #[test]
    fn test_unusual_keys_round_trip() {
        let provider = provider();
        for key in ["a//b.txt", "/lead.txt", "logs/./x.txt", "up/../x.txt", r"win\dir.txt"] {
            let descriptor = provider.describe(key, Some(1), None);
            assert_eq!(provider.to_key(&descriptor.logical_path).unwrap(), key);
        }
        assert_eq!(
            provider.describe("/lead.txt", None, None).logical_path,
            "s3://bucketa//lead.txt"
        );
        assert_eq!(directory_prefix("a"), "a/");
        assert_eq!(directory_prefix("a/"), "a/");
        assert_eq!(directory_prefix(""), "");
    }

    #[test]
    fn test_key_translation() {
        let provider = provider();
        assert_eq!(provider.name(), "s3://bucketa");
        assert_eq!(provider.to_key("S3://BucketA/folder/file.csv").unwrap(), "folder/file.csv");
        assert_eq!(provider.to_key("s3://bucketa").unwrap(), "");
        assert!(matches!(
            provider.to_key("s3://other/file.csv"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_smithy_timestamp_conversion() {
        let modified = S3DateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_utc(Some(&modified));
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);
    }

    #[test]
    fn test_describe_uses_bucket_relative_key() {
        let provider = provider();
        let descriptor = provider.describe("folder/file.csv", Some(20), None);
        assert_eq!(descriptor.logical_path, "s3://bucketa/folder/file.csv");
        assert_eq!(descriptor.name, "file.csv");
        assert_eq!(descriptor.size_bytes, 20);
        assert_eq!(provider.directory("").name, "bucketA");
    }

    #[tokio::test]
    async fn test_read_rejects_directory() {
        let provider = provider();
        let descriptor = provider.directory("folder");
        assert!(matches!(
            provider.read(&descriptor).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
