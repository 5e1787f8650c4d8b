//! s3s::S3 trait implementation for GatewayBackend

use crate::backend::{GatewayBackend, ObjectVersion, Versioning as VersioningState};
use crate::error::{GatewayError, QuotaError};

use bytes::Bytes;
use futures::{stream, TryStreamExt};
use hyper::StatusCode;
use s3s::dto::*;
use s3s::s3_error;
use s3s::{S3ErrorCode, S3Request, S3Response, S3Result};
use std::time::SystemTime;

/// User metadata key that marks a PUT as the completion of an admitted
/// restore. Honoured only on requests signed by the restore principal.
pub const RESTORE_COMPLETION_META: &str = "x-internal-restore-completion";

fn custom_error(code: &'static str, status: StatusCode, message: String) -> s3s::S3Error {
    let mut err = s3s::S3Error::with_message(S3ErrorCode::Custom(code.into()), message);
    err.set_status_code(status);
    err
}

/// Convert a quota error to its S3 response
pub fn quota_error(err: QuotaError) -> s3s::S3Error {
    match &err {
        QuotaError::QuotaExceeded { .. } => {
            custom_error("QuotaExceeded", StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
        QuotaError::NoSuchQuota(_) => {
            custom_error("NoSuchQuota", StatusCode::NOT_FOUND, err.to_string())
        }
        QuotaError::InvalidQuotaConfig(msg) | QuotaError::MalformedRequest(msg) => {
            s3_error!(InvalidArgument, "{}", msg)
        }
        QuotaError::NoSuchBucket(bucket) => {
            s3_error!(NoSuchBucket, "Bucket does not exist: {}", bucket)
        }
        QuotaError::MeteringUnavailable(msg) => s3_error!(ServiceUnavailable, "{}", msg),
        QuotaError::OperationTimedOut(msg) => s3_error!(RequestTimeout, "{}", msg),
        QuotaError::LedgerInconsistency(_) | QuotaError::Config(_) => {
            s3_error!(InternalError, "{}", err)
        }
    }
}

/// Convert GatewayError to s3s error
fn map_error(err: GatewayError) -> s3s::S3Error {
    match err {
        GatewayError::NoSuchBucket(bucket) => {
            s3_error!(NoSuchBucket, "Bucket does not exist: {}", bucket)
        }
        GatewayError::NoSuchKey(key) => s3_error!(NoSuchKey, "Key does not exist: {}", key),
        GatewayError::NoSuchVersion(v) => s3_error!(NoSuchVersion, "Version does not exist: {}", v),
        GatewayError::NoSuchUpload(id) => s3_error!(NoSuchUpload, "Upload does not exist: {}", id),
        GatewayError::BucketAlreadyExists(bucket) => {
            s3_error!(BucketAlreadyOwnedByYou, "Bucket already exists: {}", bucket)
        }
        GatewayError::BucketNotEmpty(bucket) => {
            s3_error!(BucketNotEmpty, "Bucket not empty: {}", bucket)
        }
        GatewayError::InvalidBucketName(msg) => s3_error!(InvalidBucketName, "{}", msg),
        GatewayError::InvalidKey(msg) => s3_error!(InvalidArgument, "Invalid key: {}", msg),
        GatewayError::InvalidPart(msg) => s3_error!(InvalidPart, "{}", msg),
        GatewayError::AccessDenied(msg) => s3_error!(AccessDenied, "{}", msg),
        GatewayError::InvalidObjectState(msg) => s3_error!(InvalidObjectState, "{}", msg),
        GatewayError::Conflict(msg) => s3_error!(OperationAborted, "{}", msg),
        GatewayError::Quota(e) => quota_error(e),
        GatewayError::Internal(msg) => s3_error!(InternalError, "Internal error: {}", msg),
    }
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> Timestamp {
    Timestamp::from(SystemTime::from(at))
}

async fn collect_body(body: Option<StreamingBlob>) -> S3Result<Bytes> {
    let Some(body) = body else {
        return Ok(Bytes::new());
    };
    let data: Vec<u8> = body
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .map_err(|e| s3_error!(InternalError, "Failed to read body: {:?}", e))?;
    Ok(Bytes::from(data))
}

fn copy_source(source: &CopySource) -> S3Result<(&str, &str, Option<&str>)> {
    match source {
        CopySource::Bucket {
            bucket,
            key,
            version_id,
        } => Ok((&**bucket, &**key, version_id.as_deref())),
        _ => Err(s3_error!(
            NotImplemented,
            "Only bucket copy sources are supported"
        )),
    }
}

fn object_body(version: ObjectVersion) -> StreamingBlob {
    let data = version.data;
    StreamingBlob::wrap(stream::once(async move {
        Result::<Bytes, std::io::Error>::Ok(data)
    }))
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[async_trait::async_trait]
impl s3s::S3 for GatewayBackend {
    async fn create_bucket(
        &self,
        req: S3Request<CreateBucketInput>,
    ) -> S3Result<S3Response<CreateBucketOutput>> {
        self.create_bucket(&req.input.bucket).map_err(map_error)?;
        Ok(S3Response::new(CreateBucketOutput::default()))
    }

    async fn delete_bucket(
        &self,
        req: S3Request<DeleteBucketInput>,
    ) -> S3Result<S3Response<DeleteBucketOutput>> {
        self.delete_bucket(&req.input.bucket).map_err(map_error)?;
        Ok(S3Response::new(DeleteBucketOutput {}))
    }

    async fn head_bucket(
        &self,
        req: S3Request<HeadBucketInput>,
    ) -> S3Result<S3Response<HeadBucketOutput>> {
        if !self.bucket_exists(&req.input.bucket) {
            return Err(s3_error!(NoSuchBucket));
        }
        Ok(S3Response::new(HeadBucketOutput::default()))
    }

    async fn list_buckets(
        &self,
        _: S3Request<ListBucketsInput>,
    ) -> S3Result<S3Response<ListBucketsOutput>> {
        let buckets: Vec<Bucket> = self
            .list_buckets()
            .into_iter()
            .map(|b| Bucket {
                name: Some(b.name),
                creation_date: Some(timestamp(b.created_at)),
                ..Default::default()
            })
            .collect();

        Ok(S3Response::new(ListBucketsOutput {
            buckets: non_empty(buckets),
            ..Default::default()
        }))
    }

    async fn get_bucket_location(
        &self,
        _: S3Request<GetBucketLocationInput>,
    ) -> S3Result<S3Response<GetBucketLocationOutput>> {
        Ok(S3Response::new(GetBucketLocationOutput::default()))
    }

    async fn get_bucket_versioning(
        &self,
        req: S3Request<GetBucketVersioningInput>,
    ) -> S3Result<S3Response<GetBucketVersioningOutput>> {
        let status = match self.versioning(&req.input.bucket).map_err(map_error)? {
            VersioningState::Unversioned => None,
            VersioningState::Enabled => Some(BucketVersioningStatus::from_static(
                BucketVersioningStatus::ENABLED,
            )),
            VersioningState::Suspended => Some(BucketVersioningStatus::from_static(
                BucketVersioningStatus::SUSPENDED,
            )),
        };
        Ok(S3Response::new(GetBucketVersioningOutput {
            status,
            ..Default::default()
        }))
    }

    async fn put_bucket_versioning(
        &self,
        req: S3Request<PutBucketVersioningInput>,
    ) -> S3Result<S3Response<PutBucketVersioningOutput>> {
        let input = req.input;
        let state = match input.versioning_configuration.status.as_ref().map(|s| s.as_str()) {
            Some(BucketVersioningStatus::ENABLED) => VersioningState::Enabled,
            Some(BucketVersioningStatus::SUSPENDED) => VersioningState::Suspended,
            other => {
                return Err(s3_error!(
                    MalformedXML,
                    "Unsupported versioning status: {:?}",
                    other
                ))
            }
        };
        self.set_versioning(&input.bucket, state).map_err(map_error)?;
        Ok(S3Response::new(PutBucketVersioningOutput::default()))
    }

    async fn put_object(
        &self,
        req: S3Request<PutObjectInput>,
    ) -> S3Result<S3Response<PutObjectOutput>> {
        let access_key = req.credentials.as_ref().map(|c| c.access_key.as_str());
        let trusted = self.accepts_restore_completion(access_key);
        let input = req.input;
        let data = collect_body(input.body).await?;

        let marked = input
            .metadata
            .as_ref()
            .is_some_and(|meta| meta.contains_key(RESTORE_COMPLETION_META));
        if marked && !trusted {
            tracing::warn!(
                bucket = %input.bucket,
                key = %input.key,
                "Restore marker from an untrusted client, treating as a regular write"
            );
        }
        let restore_completion = marked && trusted;

        let result = if restore_completion {
            self.complete_restore(&input.bucket, &input.key, data).await
        } else {
            self.put_object(&input.bucket, &input.key, data).await
        }
        .map_err(map_error)?;

        Ok(S3Response::new(PutObjectOutput {
            e_tag: Some(ETag::Strong(result.etag)),
            version_id: result.version_id,
            ..Default::default()
        }))
    }

    async fn get_object(
        &self,
        req: S3Request<GetObjectInput>,
    ) -> S3Result<S3Response<GetObjectOutput>> {
        let input = req.input;
        let version = self
            .get_object(&input.bucket, &input.key, input.version_id.as_deref())
            .map_err(map_error)?;

        let output = GetObjectOutput {
            content_length: Some(version.size() as i64),
            e_tag: Some(ETag::Strong(version.etag.clone())),
            last_modified: Some(timestamp(version.last_modified)),
            content_type: Some(mime::APPLICATION_OCTET_STREAM.to_string()),
            version_id: input.version_id,
            body: Some(object_body(version)),
            ..Default::default()
        };
        Ok(S3Response::new(output))
    }

    async fn head_object(
        &self,
        req: S3Request<HeadObjectInput>,
    ) -> S3Result<S3Response<HeadObjectOutput>> {
        let input = req.input;
        let version = self
            .head_object(&input.bucket, &input.key, input.version_id.as_deref())
            .map_err(map_error)?;

        Ok(S3Response::new(HeadObjectOutput {
            content_length: Some(version.size() as i64),
            e_tag: Some(ETag::Strong(version.etag)),
            content_type: Some(mime::APPLICATION_OCTET_STREAM.to_string()),
            last_modified: Some(timestamp(version.last_modified)),
            version_id: input.version_id,
            ..Default::default()
        }))
    }

    async fn list_objects(
        &self,
        req: S3Request<ListObjectsInput>,
    ) -> S3Result<S3Response<ListObjectsOutput>> {
        let v2_resp = s3s::S3::list_objects_v2(self, req.map_input(Into::into)).await?;

        Ok(v2_resp.map_output(|v2| ListObjectsOutput {
            contents: v2.contents,
            common_prefixes: v2.common_prefixes,
            delimiter: v2.delimiter,
            encoding_type: v2.encoding_type,
            name: v2.name,
            prefix: v2.prefix,
            max_keys: v2.max_keys,
            is_truncated: v2.is_truncated,
            ..Default::default()
        }))
    }

    async fn list_objects_v2(
        &self,
        req: S3Request<ListObjectsV2Input>,
    ) -> S3Result<S3Response<ListObjectsV2Output>> {
        let input = req.input;
        let objects = self
            .list_objects(&input.bucket, input.prefix.as_deref())
            .map_err(map_error)?;

        let max_keys = input.max_keys.unwrap_or(1000).max(0);
        let is_truncated = objects.len() > max_keys as usize;
        let contents: Vec<Object> = objects
            .into_iter()
            .take(max_keys as usize)
            .map(|o| Object {
                key: Some(o.key),
                size: Some(o.size as i64),
                e_tag: Some(ETag::Strong(o.etag)),
                last_modified: Some(timestamp(o.last_modified)),
                ..Default::default()
            })
            .collect();
        let key_count = contents.len() as i32;

        Ok(S3Response::new(ListObjectsV2Output {
            contents: non_empty(contents),
            name: Some(input.bucket),
            prefix: input.prefix,
            max_keys: Some(max_keys),
            is_truncated: Some(is_truncated),
            key_count: Some(key_count),
            ..Default::default()
        }))
    }

    async fn copy_object(
        &self,
        req: S3Request<CopyObjectInput>,
    ) -> S3Result<S3Response<CopyObjectOutput>> {
        let input = req.input;
        let (source_bucket, source_key, source_version) = copy_source(&input.copy_source)?;

        let result = self
            .copy_object(source_bucket, source_key, source_version, &input.bucket, &input.key)
            .await
            .map_err(map_error)?;

        Ok(S3Response::new(CopyObjectOutput {
            copy_object_result: Some(CopyObjectResult {
                e_tag: Some(ETag::Strong(result.etag)),
                last_modified: Some(Timestamp::from(SystemTime::now())),
                ..Default::default()
            }),
            version_id: result.version_id,
            ..Default::default()
        }))
    }

    async fn delete_object(
        &self,
        req: S3Request<DeleteObjectInput>,
    ) -> S3Result<S3Response<DeleteObjectOutput>> {
        let input = req.input;
        let deleted = self
            .delete_object(&input.bucket, &input.key, input.version_id.as_deref())
            .await
            .map_err(map_error)?;

        Ok(S3Response::new(DeleteObjectOutput {
            delete_marker: deleted.delete_marker.then_some(true),
            version_id: deleted.version_id,
            ..Default::default()
        }))
    }

    async fn delete_objects(
        &self,
        req: S3Request<DeleteObjectsInput>,
    ) -> S3Result<S3Response<DeleteObjectsOutput>> {
        let input = req.input;
        let objects: Vec<(String, Option<String>)> = input
            .delete
            .objects
            .iter()
            .map(|obj| (obj.key.clone(), obj.version_id.clone()))
            .collect();

        if objects.is_empty() {
            return Err(s3_error!(
                MalformedXML,
                "No objects specified for deletion"
            ));
        }

        let results = self
            .delete_objects(&input.bucket, &objects)
            .await
            .map_err(map_error)?;

        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        for (key, result) in results {
            match result {
                Ok(d) => deleted.push(DeletedObject {
                    key: Some(key),
                    version_id: d.version_id,
                    delete_marker: d.delete_marker.then_some(true),
                    ..Default::default()
                }),
                Err(e) => {
                    let err = map_error(e);
                    errors.push(Error {
                        key: Some(key),
                        code: Some(err.code().as_str().to_string()),
                        message: err.message().map(str::to_string),
                        ..Default::default()
                    });
                }
            }
        }

        Ok(S3Response::new(DeleteObjectsOutput {
            deleted: non_empty(deleted),
            errors: non_empty(errors),
            ..Default::default()
        }))
    }

    async fn restore_object(
        &self,
        req: S3Request<RestoreObjectInput>,
    ) -> S3Result<S3Response<RestoreObjectOutput>> {
        let input = req.input;
        self.restore_object(&input.bucket, &input.key, input.version_id.as_deref())
            .await
            .map_err(map_error)?;

        let mut resp = S3Response::new(RestoreObjectOutput::default());
        resp.status = Some(StatusCode::ACCEPTED);
        Ok(resp)
    }

    async fn put_object_legal_hold(
        &self,
        req: S3Request<PutObjectLegalHoldInput>,
    ) -> S3Result<S3Response<PutObjectLegalHoldOutput>> {
        let input = req.input;
        let on = input
            .legal_hold
            .as_ref()
            .and_then(|hold| hold.status.as_ref())
            .is_some_and(|status| status.as_str() == ObjectLockLegalHoldStatus::ON);

        self.set_legal_hold(&input.bucket, &input.key, input.version_id.as_deref(), on)
            .map_err(map_error)?;
        Ok(S3Response::new(PutObjectLegalHoldOutput::default()))
    }

    // Multipart upload operations

    async fn create_multipart_upload(
        &self,
        req: S3Request<CreateMultipartUploadInput>,
    ) -> S3Result<S3Response<CreateMultipartUploadOutput>> {
        let input = req.input;
        let upload_id = self
            .create_multipart_upload(&input.bucket, &input.key)
            .map_err(map_error)?;

        Ok(S3Response::new(CreateMultipartUploadOutput {
            bucket: Some(input.bucket),
            key: Some(input.key),
            upload_id: Some(upload_id),
            ..Default::default()
        }))
    }

    async fn upload_part(
        &self,
        req: S3Request<UploadPartInput>,
    ) -> S3Result<S3Response<UploadPartOutput>> {
        let input = req.input;
        let data = collect_body(input.body).await?;

        let etag = self
            .upload_part(&input.bucket, &input.key, &input.upload_id, input.part_number, data)
            .await
            .map_err(map_error)?;

        Ok(S3Response::new(UploadPartOutput {
            e_tag: Some(ETag::Strong(etag)),
            ..Default::default()
        }))
    }

    async fn upload_part_copy(
        &self,
        req: S3Request<UploadPartCopyInput>,
    ) -> S3Result<S3Response<UploadPartCopyOutput>> {
        let input = req.input;
        let (source_bucket, source_key, source_version) = copy_source(&input.copy_source)?;

        let etag = self
            .upload_part_copy(
                &input.bucket,
                &input.key,
                &input.upload_id,
                input.part_number,
                source_bucket,
                source_key,
                source_version,
            )
            .await
            .map_err(map_error)?;

        Ok(S3Response::new(UploadPartCopyOutput {
            copy_part_result: Some(CopyPartResult {
                e_tag: Some(ETag::Strong(etag)),
                last_modified: Some(Timestamp::from(SystemTime::now())),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    async fn list_parts(
        &self,
        req: S3Request<ListPartsInput>,
    ) -> S3Result<S3Response<ListPartsOutput>> {
        let input = req.input;
        let parts = self
            .list_parts(&input.bucket, &input.key, &input.upload_id)
            .map_err(map_error)?;

        let parts: Vec<Part> = parts
            .into_iter()
            .map(|p| Part {
                part_number: Some(p.part_number),
                size: Some(p.size() as i64),
                e_tag: Some(ETag::Strong(p.etag)),
                last_modified: Some(timestamp(p.last_modified)),
                ..Default::default()
            })
            .collect();

        Ok(S3Response::new(ListPartsOutput {
            bucket: Some(input.bucket),
            key: Some(input.key),
            upload_id: Some(input.upload_id),
            parts: non_empty(parts),
            ..Default::default()
        }))
    }

    async fn complete_multipart_upload(
        &self,
        req: S3Request<CompleteMultipartUploadInput>,
    ) -> S3Result<S3Response<CompleteMultipartUploadOutput>> {
        let input = req.input;
        let parts: Vec<i32> = input
            .multipart_upload
            .and_then(|upload| upload.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.part_number)
            .collect();

        let result = self
            .complete_multipart_upload(&input.bucket, &input.key, &input.upload_id, &parts)
            .await
            .map_err(map_error)?;

        Ok(S3Response::new(CompleteMultipartUploadOutput {
            bucket: Some(input.bucket),
            key: Some(input.key),
            e_tag: Some(ETag::Strong(result.etag)),
            version_id: result.version_id,
            ..Default::default()
        }))
    }

    async fn abort_multipart_upload(
        &self,
        req: S3Request<AbortMultipartUploadInput>,
    ) -> S3Result<S3Response<AbortMultipartUploadOutput>> {
        let input = req.input;
        self.abort_multipart_upload(&input.bucket, &input.key, &input.upload_id)
            .await
            .map_err(map_error)?;
        Ok(S3Response::new(AbortMultipartUploadOutput::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_is_custom_429() {
        let err = quota_error(QuotaError::QuotaExceeded {
            bucket: "b".to_string(),
            quota: 1000,
            projected: 1024,
        });
        assert_eq!(err.code().as_str(), "QuotaExceeded");
        assert_eq!(err.status_code(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_control_plane_messages_survive() {
        let err = quota_error(QuotaError::InvalidQuotaConfig(
            QuotaError::NON_POSITIVE_QUOTA.to_string(),
        ));
        assert_eq!(err.code(), &S3ErrorCode::InvalidArgument);
        assert_eq!(err.message(), Some(QuotaError::NON_POSITIVE_QUOTA));
    }

    #[test]
    fn test_conflict_maps_to_operation_aborted() {
        let err = map_error(GatewayError::Conflict("k changed".to_string()));
        assert_eq!(err.code(), &S3ErrorCode::OperationAborted);
        assert_eq!(err.code().status_code(), Some(StatusCode::CONFLICT));
    }

    #[test]
    fn test_lock_denial_maps_to_access_denied() {
        let err = map_error(GatewayError::AccessDenied("locked".to_string()));
        assert_eq!(err.code(), &S3ErrorCode::AccessDenied);
    }
}
