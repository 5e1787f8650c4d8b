//! Multipart upload staging
//!
//! Parts are held here until completion. Every staged byte is already
//! counted against the bucket quota, so the mutations that release or
//! replace staged bytes take the size the caller based its delta on and
//! refuse with [`GatewayError::Conflict`] when it no longer matches.
//! Assembly does not consume the upload; a failed completion leaves it
//! intact for a retry or an abort.

use crate::error::{GatewayError, GatewayResult};
use crate::utils::etag_for;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// A staged part
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub part_number: i32,
    pub data: Bytes,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl UploadedPart {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// An in-progress multipart upload
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
    pub parts: BTreeMap<i32, UploadedPart>,
}

impl MultipartUpload {
    fn new(bucket: String, key: String) -> Self {
        Self {
            upload_id: Uuid::new_v4().simple().to_string(),
            bucket,
            key,
            initiated: Utc::now(),
            parts: BTreeMap::new(),
        }
    }

    pub fn staged_bytes(&self) -> u64 {
        self.parts.values().map(UploadedPart::size).sum()
    }

    /// Concatenate `requested` parts (all parts when empty) in order
    pub fn assemble(&self, requested: &[i32]) -> GatewayResult<Bytes> {
        let numbers: Vec<i32> = if requested.is_empty() {
            self.parts.keys().copied().collect()
        } else {
            requested.to_vec()
        };

        if numbers.is_empty() {
            return Err(GatewayError::InvalidPart(format!(
                "upload {} has no parts",
                self.upload_id
            )));
        }
        if numbers.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(GatewayError::InvalidPart(
                "parts must be listed in ascending order".to_string(),
            ));
        }

        let mut assembled = BytesMut::new();
        for number in &numbers {
            let part = self.parts.get(number).ok_or_else(|| {
                GatewayError::InvalidPart(format!(
                    "part {} of upload {} was never uploaded",
                    number, self.upload_id
                ))
            })?;
            assembled.extend_from_slice(&part.data);
        }

        tracing::debug!(
            upload_id = %self.upload_id,
            parts = numbers.len(),
            bytes = assembled.len(),
            "Assembled multipart upload"
        );
        Ok(assembled.freeze())
    }
}

/// All in-progress uploads
#[derive(Debug, Clone, Default)]
pub struct MultipartManager {
    uploads: Arc<Mutex<HashMap<String, MultipartUpload>>>,
}

impl MultipartManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_upload(&self, bucket: &str, key: &str) -> String {
        let upload = MultipartUpload::new(bucket.to_string(), key.to_string());
        let upload_id = upload.upload_id.clone();
        self.uploads.lock().insert(upload_id.clone(), upload);
        upload_id
    }

    pub fn get_upload(&self, upload_id: &str) -> GatewayResult<MultipartUpload> {
        self.uploads
            .lock()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| GatewayError::NoSuchUpload(upload_id.to_string()))
    }

    /// Size of the staged part `part_number`, if any
    pub fn part_size(&self, upload_id: &str, part_number: i32) -> GatewayResult<Option<u64>> {
        check_part_number(part_number)?;
        let uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| GatewayError::NoSuchUpload(upload_id.to_string()))?;
        Ok(upload.parts.get(&part_number).map(UploadedPart::size))
    }

    /// Stage a part over `replaces`, the size of the part it was expected
    /// to replace (`None` when no part was staged under that number)
    pub fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        replaces: Option<u64>,
    ) -> GatewayResult<String> {
        check_part_number(part_number)?;

        let etag = etag_for(&data);
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| GatewayError::NoSuchUpload(upload_id.to_string()))?;

        let current = upload.parts.get(&part_number).map(UploadedPart::size);
        if current != replaces {
            return Err(GatewayError::Conflict(format!(
                "part {} of upload {} changed",
                part_number, upload_id
            )));
        }

        tracing::debug!(upload_id, part_number, bytes = data.len(), "Staged part");
        upload.parts.insert(
            part_number,
            UploadedPart {
                part_number,
                data,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(etag)
    }

    pub fn list_parts(&self, upload_id: &str) -> GatewayResult<Vec<UploadedPart>> {
        Ok(self.get_upload(upload_id)?.parts.into_values().collect())
    }

    /// Remove the upload on completion or abort, provided it still holds
    /// `staged_bytes`
    pub fn take(&self, upload_id: &str, staged_bytes: u64) -> GatewayResult<MultipartUpload> {
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| GatewayError::NoSuchUpload(upload_id.to_string()))?;
        if upload.staged_bytes() != staged_bytes {
            return Err(GatewayError::Conflict(format!(
                "upload {} gained or lost parts",
                upload_id
            )));
        }
        uploads
            .remove(upload_id)
            .ok_or_else(|| GatewayError::NoSuchUpload(upload_id.to_string()))
    }

    /// Bytes staged by all in-progress uploads of a bucket
    pub fn bucket_staged_bytes(&self, bucket: &str) -> u64 {
        self.uploads
            .lock()
            .values()
            .filter(|upload| upload.bucket == bucket)
            .map(MultipartUpload::staged_bytes)
            .sum()
    }

    /// Drop every upload of a deleted bucket
    pub fn remove_bucket(&self, bucket: &str) -> usize {
        let mut uploads = self.uploads.lock();
        let before = uploads.len();
        uploads.retain(|_, upload| upload.bucket != bucket);
        before - uploads.len()
    }
}

fn check_part_number(part_number: i32) -> GatewayResult<()> {
    if !(1..=10_000).contains(&part_number) {
        return Err(GatewayError::InvalidPart(format!(
            "part number {} out of range",
            part_number
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_lifecycle() {
        let manager = MultipartManager::new();
        let upload_id = manager.create_upload("mybucket", "mykey");
        assert!(!upload_id.is_empty());

        manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"part1"), None)
            .unwrap();
        manager
            .upload_part(&upload_id, 2, Bytes::from_static(b"part2"), None)
            .unwrap();
        assert_eq!(manager.list_parts(&upload_id).unwrap().len(), 2);

        let upload = manager.get_upload(&upload_id).unwrap();
        assert_eq!(upload.staged_bytes(), 10);
        assert_eq!(upload.assemble(&[]).unwrap(), Bytes::from_static(b"part1part2"));

        // Assembly leaves the upload in place
        assert!(manager.get_upload(&upload_id).is_ok());
        assert!(matches!(
            manager.take(&upload_id, 5),
            Err(GatewayError::Conflict(_))
        ));
        manager.take(&upload_id, 10).unwrap();
        assert!(matches!(
            manager.get_upload(&upload_id),
            Err(GatewayError::NoSuchUpload(_))
        ));
    }

    #[test]
    fn test_requested_parts() {
        let manager = MultipartManager::new();
        let upload_id = manager.create_upload("bucket", "key");
        for (n, body) in [(1, "a"), (2, "bb"), (3, "ccc")] {
            manager
                .upload_part(&upload_id, n, Bytes::from(body.to_string()), None)
                .unwrap();
        }
        let upload = manager.get_upload(&upload_id).unwrap();

        assert_eq!(upload.assemble(&[1, 3]).unwrap(), Bytes::from_static(b"accc"));
        assert!(matches!(upload.assemble(&[3, 1]), Err(GatewayError::InvalidPart(_))));
        assert!(matches!(upload.assemble(&[1, 4]), Err(GatewayError::InvalidPart(_))));
    }

    #[test]
    fn test_part_replacement_and_bounds() {
        let manager = MultipartManager::new();
        let upload_id = manager.create_upload("bucket", "key");
        manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"old"), None)
            .unwrap();
        assert_eq!(manager.part_size(&upload_id, 1).unwrap(), Some(3));

        // The replaced size must match what is staged
        assert!(matches!(
            manager.upload_part(&upload_id, 1, Bytes::from_static(b"new!"), None),
            Err(GatewayError::Conflict(_))
        ));
        manager
            .upload_part(&upload_id, 1, Bytes::from_static(b"new!"), Some(3))
            .unwrap();
        assert_eq!(manager.get_upload(&upload_id).unwrap().staged_bytes(), 4);

        assert!(manager
            .upload_part(&upload_id, 0, Bytes::from_static(b"x"), None)
            .is_err());
        assert!(matches!(
            manager.upload_part("missing", 1, Bytes::new(), None),
            Err(GatewayError::NoSuchUpload(_))
        ));
    }

    #[test]
    fn test_empty_upload_cannot_assemble() {
        let manager = MultipartManager::new();
        let upload_id = manager.create_upload("bucket", "key");
        let upload = manager.get_upload(&upload_id).unwrap();
        assert!(upload.assemble(&[]).is_err());
    }

    #[test]
    fn test_remove_bucket() {
        let manager = MultipartManager::new();
        manager.create_upload("a", "k1");
        manager.create_upload("a", "k2");
        let kept = manager.create_upload("b", "k");
        manager
            .upload_part(&kept, 1, Bytes::from_static(b"abc"), None)
            .unwrap();
        assert_eq!(manager.bucket_staged_bytes("b"), 3);
        assert_eq!(manager.bucket_staged_bytes("a"), 0);
        assert_eq!(manager.remove_bucket("a"), 2);
        assert!(manager.get_upload(&kept).is_ok());
    }
}
