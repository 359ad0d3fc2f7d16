//! Object store on S3. Large videos go up as multipart uploads.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    Tag, Tagging,
};
use deepsea_ai_core::contract::{ObjectStore, ObjectTag};
use deepsea_ai_core::error::BackendError;
use deepsea_ai_core::location::S3Uri;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::error::classify;
use super::Finish;

/// Buckets in this region are created without a location constraint.
const DEFAULT_BUCKET_REGION: &str = "us-east-1";

/// Files above this size are uploaded in parts.
pub const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
const PART_SIZE: u64 = 64 * 1024 * 1024;

pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    fn tagging(tags: &[ObjectTag]) -> Result<Tagging, BackendError> {
        let tag_set = tags
            .iter()
            .map(|t| Tag::builder().key(&t.key).value(&t.value).build().finish("tag"))
            .collect::<Result<Vec<_>, _>>()?;
        Tagging::builder().set_tag_set(Some(tag_set)).build().finish("tagging")
    }

    async fn upload_single(&self, path: &Path, uri: &S3Uri) -> Result<(), BackendError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| BackendError::Rejected(format!("cannot read {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .body(body)
            .send()
            .await
            .map_err(|e| classify("put object", e))?;
        Ok(())
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        uri: &S3Uri,
        size: u64,
    ) -> Result<(), BackendError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(uri.bucket())
            .key(uri.key())
            .send()
            .await
            .map_err(|e| classify("create multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackendError::Rejected("multipart upload returned no id".into()))?
            .to_string();

        match self.upload_parts(path, uri, size, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
                self.client
                    .complete_multipart_upload()
                    .bucket(uri.bucket())
                    .key(uri.key())
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| classify("complete multipart upload", e))?;
                Ok(())
            }
            Err(e) => {
                warn!(uri = %uri, error = %e, "Aborting multipart upload");
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(uri.bucket())
                    .key(uri.key())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    let error = classify("abort multipart upload", abort);
                    warn!(uri = %uri, error = %error, "Abort failed");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        uri: &S3Uri,
        size: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, BackendError> {
        let io_error = |e: std::io::Error| {
            BackendError::Rejected(format!("cannot read {}: {e}", path.display()))
        };
        let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let len = PART_SIZE.min(size - offset);
            let mut chunk = vec![0u8; len as usize];
            file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_error)?;
            file.read_exact(&mut chunk).await.map_err(io_error)?;

            let out = self
                .client
                .upload_part()
                .bucket(uri.bucket())
                .key(uri.key())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| classify("upload part", e))?;
            debug!(uri = %uri, part_number, bytes = len, "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(out.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += len;
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn object_exists(&self, uri: &S3Uri) -> Result<bool, BackendError> {
        match self
            .client
            .head_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(classify("head object", e)),
        }
    }

    async fn upload_file(&self, path: &Path, uri: &S3Uri) -> Result<(), BackendError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| BackendError::Rejected(format!("cannot read {}: {e}", path.display())))?
            .len();
        info!(path = %path.display(), uri = %uri, bytes = size, "Uploading to S3");
        if size > MULTIPART_THRESHOLD {
            self.upload_multipart(path, uri, size).await
        } else {
            self.upload_single(path, uri).await
        }
    }

    async fn put_object(&self, uri: &S3Uri, body: Vec<u8>) -> Result<(), BackendError> {
        self.client
            .put_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("put object", e))?;
        Ok(())
    }

    async fn tag_object(&self, uri: &S3Uri, tags: &[ObjectTag]) -> Result<(), BackendError> {
        let tagging = Self::tagging(tags)?;
        self.client
            .put_object_tagging()
            .bucket(uri.bucket())
            .key(uri.key())
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| classify("put object tagging", e))?;
        debug!(uri = %uri, count = tags.len(), "Tagged object");
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str, tags: &[ObjectTag]) -> Result<bool, BackendError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                debug!(bucket, "Bucket exists");
                return Ok(false);
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {}
            Err(e) => return Err(classify("head bucket", e)),
        }

        let mut create = self.client.create_bucket().bucket(bucket);
        let region = self.client.config().region().map(|r| r.as_ref().to_string());
        if let Some(region) = region.filter(|r| r != DEFAULT_BUCKET_REGION) {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region.as_str()))
                    .build(),
            );
        }
        create.send().await.map_err(|e| classify("create bucket", e))?;
        info!(bucket, "Created bucket");

        self.client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(Self::tagging(tags)?)
            .send()
            .await
            .map_err(|e| classify("put bucket tagging", e))?;
        Ok(true)
    }
}
