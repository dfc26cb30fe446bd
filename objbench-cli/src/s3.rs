//! [`ObjectClient`] for S3-compatible services, built on `rust-s3`.

use std::fmt;
use std::io::Cursor;

use futures_util::{StreamExt, TryStreamExt};
use objbench_engine::client::{
    ClientError, ClientResult, GetOptions, ObjectClient, ObjectReader, PutOptions, PutResponse,
};
use objbench_engine::source::DEFAULT_CONTENT_TYPE;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, BucketConfiguration, Region};
use tokio_util::io::StreamReader;

/// Number of concurrent deletions while removing a prefix.
const DELETE_CONCURRENCY: usize = 16;

/// Talks to one S3 endpoint.
pub struct S3Client {
    region: Region,
    credentials: Credentials,
    path_style: bool,
    endpoint: String,
}

impl S3Client {
    /// Creates a client for `endpoint`.
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
        path_style: bool,
    ) -> anyhow::Result<Self> {
        let credentials = Credentials::new(access_key, secret_key, None, None, None)?;
        let region = Region::Custom {
            region: region.to_owned(),
            endpoint: endpoint.to_owned(),
        };

        Ok(Self {
            region,
            credentials,
            path_style,
            endpoint: endpoint.to_owned(),
        })
    }

    fn bucket(&self, name: &str) -> ClientResult<Box<Bucket>> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| ClientError::generic(format!("opening bucket `{name}`"), e))?;

        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("endpoint", &self.endpoint)
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

fn map_error(context: impl Into<String>, object: &str, error: S3Error) -> ClientError {
    match error {
        S3Error::HttpFailWithBody(404, _) => ClientError::NotFound(object.to_owned()),
        error => ClientError::generic(context, error),
    }
}

#[async_trait::async_trait]
impl ObjectClient for S3Client {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ensure_bucket(&self, bucket: &str) -> ClientResult<()> {
        let config = BucketConfiguration::default();
        let result = if self.path_style {
            Bucket::create_with_path_style(
                bucket,
                self.region.clone(),
                self.credentials.clone(),
                config,
            )
            .await
        } else {
            Bucket::create(bucket, self.region.clone(), self.credentials.clone(), config).await
        };

        match result {
            Ok(response) if response.success() || response.response_code == 409 => Ok(()),
            Ok(response) => Err(ClientError::generic(
                format!("creating bucket `{bucket}`"),
                format!(
                    "status {}: {}",
                    response.response_code, response.response_text
                ),
            )),
            // The bucket already exists.
            Err(S3Error::HttpFailWithBody(409, _)) => Ok(()),
            Err(error) => Err(ClientError::generic(
                format!("creating bucket `{bucket}`"),
                error,
            )),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        mut body: ObjectReader,
        _size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutResponse> {
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        let response = self
            .bucket(bucket)?
            .put_object_stream_with_content_type(&mut body, name, content_type)
            .await
            .map_err(|e| map_error(format!("uploading `{name}`"), name, e))?;

        Ok(PutResponse {
            key: name.to_owned(),
            etag: String::new(),
            size: response.uploaded_bytes() as u64,
            version_id: None,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        options: &GetOptions,
    ) -> ClientResult<ObjectReader> {
        let bucket = self.bucket(bucket)?;
        let context = || format!("downloading `{name}`");

        if let Some(range) = options.range {
            let response = bucket
                .get_object_range(name, range.start, Some(range.end))
                .await
                .map_err(|e| map_error(context(), name, e))?;
            return Ok(Box::pin(Cursor::new(response.bytes().clone())));
        }

        let response = bucket
            .get_object_stream(name)
            .await
            .map_err(|e| map_error(context(), name, e))?;
        let stream = response.bytes.map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> ClientResult<u64> {
        let bucket = self.bucket(bucket)?;
        let pages = bucket
            .list(prefix.to_owned(), None)
            .await
            .map_err(|e| ClientError::generic(format!("listing `{prefix}`"), e))?;

        let keys: Vec<_> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .collect();

        let deleted = futures_util::stream::iter(keys)
            .map(|key| {
                let bucket = &bucket;
                async move {
                    match bucket.delete_object(&key).await {
                        Ok(_) => true,
                        Err(error) => {
                            tracing::warn!(error = &error as &dyn std::error::Error, %key, "failed to delete object");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .filter(|deleted| std::future::ready(*deleted))
            .count()
            .await;

        Ok(deleted as u64)
    }
}
