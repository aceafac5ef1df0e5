//! S3 endpoint served in-process, so the SDK client runs without a network.
#![allow(dead_code)]

use aws_sdk_s3::config::http::{HttpRequest, HttpResponse};
use aws_sdk_s3::config::{
    BehaviorVersion, Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::primitives::SdkBody;
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::http::{
    http_client_fn, HttpConnector, HttpConnectorFuture, SharedHttpConnector,
};
use aws_smithy_runtime_api::http::StatusCode;
use percent_encoding::percent_decode_str;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use url::form_urlencoded;

pub const BUCKET: &str = "bucketA";

const LAST_MODIFIED_ISO: &str = "2024-05-01T12:00:00.000Z";
const LAST_MODIFIED_HTTP: &str = "Wed, 01 May 2024 12:00:00 GMT";

#[derive(Debug, Default)]
struct Bucket {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, BTreeMap<i32, Vec<u8>>>,
    next_upload: u32,
    requests: Vec<String>,
}

/// One bucket answering the REST calls the provider makes.
///
/// Listings return at most `page_size` keys per page; the continuation token
/// is the first key of the next page.
#[derive(Debug, Clone)]
pub struct FakeS3 {
    bucket: Arc<Mutex<Bucket>>,
    page_size: usize,
}

impl FakeS3 {
    pub fn new(page_size: usize) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket::default())),
            page_size: page_size.max(1),
        }
    }

    /// SDK client whose every request is answered by this bucket.
    pub fn client(&self) -> Client {
        let connector = SharedHttpConnector::new(self.clone());
        let config = aws_sdk_s3::Config::builder()
            .http_client(http_client_fn(move |_, _| connector.clone()))
            .endpoint_url("http://s3.test")
            .force_path_style(true)
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("id", "secret", None, None, "test"))
            .behavior_version(BehaviorVersion::latest())
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();
        Client::from_conf(config)
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.lock().objects.insert(key.to_string(), data.to_vec());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// `METHOD path?query` of every request so far.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap()
    }

    fn respond(&self, request: &HttpRequest) -> HttpResponse {
        let uri = request.uri();
        let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
        let path_and_query = after_scheme
            .find('/')
            .map_or("/", |index| &after_scheme[index..]);
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));

        let bucket_path = format!("/{}", BUCKET);
        let raw_key = path.strip_prefix(&bucket_path).unwrap_or(path);
        let raw_key = raw_key.strip_prefix('/').unwrap_or(raw_key);
        let key = percent_decode_str(raw_key).decode_utf8_lossy().into_owned();
        let params: HashMap<String, String> =
            form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let body = request.body().bytes().unwrap_or_default().to_vec();

        let mut bucket = self.lock();
        bucket
            .requests
            .push(format!("{} {}", request.method(), path_and_query));

        let upload_id = params.get("uploadId").cloned();
        match (request.method(), upload_id) {
            ("GET", _) if params.contains_key("list-type") => self.list(&bucket, &params),
            ("POST", None) if params.contains_key("uploads") => {
                bucket.next_upload += 1;
                let id = format!("upload-{}", bucket.next_upload);
                bucket.uploads.insert(id.clone(), BTreeMap::new());
                xml(format!(
                    "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                     <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    BUCKET,
                    escape(&key),
                    id
                ))
            }
            ("PUT", Some(id)) => {
                let part: i32 = params
                    .get("partNumber")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_default();
                match bucket.uploads.get_mut(&id) {
                    Some(parts) => {
                        parts.insert(part, body);
                        with_etag(empty(200), format!("\"part-{}\"", part))
                    }
                    None => error(404, "NoSuchUpload"),
                }
            }
            ("POST", Some(id)) => match bucket.uploads.remove(&id) {
                Some(parts) => {
                    let data: Vec<u8> = parts.into_values().flatten().collect();
                    bucket.objects.insert(key.clone(), data);
                    xml(format!(
                        "<CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                         <ETag>\"done\"</ETag></CompleteMultipartUploadResult>",
                        BUCKET,
                        escape(&key)
                    ))
                }
                None => error(404, "NoSuchUpload"),
            },
            ("DELETE", Some(id)) => {
                bucket.uploads.remove(&id);
                empty(204)
            }
            ("HEAD", _) => match bucket.objects.get(&key) {
                Some(data) => {
                    let mut response = empty(200);
                    let headers = response.headers_mut();
                    headers.insert("content-length", data.len().to_string());
                    headers.insert("last-modified", LAST_MODIFIED_HTTP);
                    with_etag(response, "\"object\"".to_string())
                }
                None => empty(404),
            },
            ("GET", _) => match bucket.objects.get(&key) {
                Some(data) => {
                    let mut response =
                        HttpResponse::new(status(200), SdkBody::from(data.clone()));
                    let headers = response.headers_mut();
                    headers.insert("content-length", data.len().to_string());
                    headers.insert("last-modified", LAST_MODIFIED_HTTP);
                    response
                }
                None => error(404, "NoSuchKey"),
            },
            ("PUT", None) => {
                bucket.objects.insert(key, body);
                with_etag(empty(200), "\"object\"".to_string())
            }
            ("DELETE", None) => {
                bucket.objects.remove(&key);
                empty(204)
            }
            _ => error(400, "InvalidRequest"),
        }
    }

    fn list(&self, bucket: &Bucket, params: &HashMap<String, String>) -> HttpResponse {
        let prefix = params.get("prefix").cloned().unwrap_or_default();
        let max_keys = params
            .get("max-keys")
            .and_then(|m| m.parse::<usize>().ok())
            .unwrap_or(1000)
            .min(self.page_size);
        let start = params.get("continuation-token").cloned().unwrap_or_default();

        let matching: Vec<(&String, &Vec<u8>)> = bucket
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix) && key.as_str() >= start.as_str())
            .take(max_keys + 1)
            .collect();
        let truncated = matching.len() > max_keys;

        let mut contents = String::new();
        for (key, data) in matching.iter().take(max_keys) {
            contents.push_str(&format!(
                "<Contents><Key>{}</Key><LastModified>{}</LastModified>\
                 <ETag>\"object\"</ETag><Size>{}</Size>\
                 <StorageClass>STANDARD</StorageClass></Contents>",
                escape(key),
                LAST_MODIFIED_ISO,
                data.len()
            ));
        }
        let next = match matching.get(max_keys) {
            Some((key, _)) if truncated => format!(
                "<NextContinuationToken>{}</NextContinuationToken>",
                escape(key)
            ),
            _ => String::new(),
        };

        xml(format!(
            "<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Name>{}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount>\
             <MaxKeys>{}</MaxKeys><IsTruncated>{}</IsTruncated>{}{}</ListBucketResult>",
            BUCKET,
            escape(&prefix),
            matching.len().min(max_keys),
            max_keys,
            truncated,
            contents,
            next
        ))
    }
}

impl HttpConnector for FakeS3 {
    fn call(&self, request: HttpRequest) -> HttpConnectorFuture {
        HttpConnectorFuture::ready(Ok(self.respond(&request)))
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::try_from(code).unwrap()
}

fn empty(code: u16) -> HttpResponse {
    HttpResponse::new(status(code), SdkBody::empty())
}

fn with_etag(mut response: HttpResponse, etag: String) -> HttpResponse {
    response.headers_mut().insert("etag", etag);
    response
}

fn xml(body: String) -> HttpResponse {
    let document = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body);
    let mut response = HttpResponse::new(status(200), SdkBody::from(document));
    response
        .headers_mut()
        .insert("content-type", "application/xml");
    response
}

fn error(code: u16, kind: &str) -> HttpResponse {
    let document = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code>\
         <Message>{}</Message></Error>",
        kind, kind
    );
    let mut response = HttpResponse::new(status(code), SdkBody::from(document));
    response
        .headers_mut()
        .insert("content-type", "application/xml");
    response
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
