//! In-memory gateway backend
//!
//! [`BucketCatalog`] holds bucket and object records and doubles as the
//! quota store: a bucket's quota lives on its record and disappears with it.
//! [`GatewayBackend`] runs every storage-consuming operation through the
//! [`AdmissionEvaluator`]: compute the byte delta, get admitted, mutate,
//! then commit or roll back.
//!
//! The delta is computed from a catalog read taken before admission, which
//! awaits the metering service. The write re-reads the same [`Footprint`]
//! under the catalog lock and fails with [`GatewayError::Conflict`] when it
//! moved, so the reservation is rolled back and the operation retried with
//! a fresh delta.

use crate::config::QuotaSettings;
use crate::error::{GatewayError, GatewayResult, QuotaError, QuotaResult};
use crate::multipart::{MultipartManager, MultipartUpload, UploadedPart};
use crate::quota::{
    bytes_to_write, validate_quota_bytes, ActionKind, AdmissionEvaluator, BucketId,
    BucketQuotaConfig, InflightLedger, QuotaAdmin, QuotaConfigStore, RestoreMarker,
    UsageMetering, WriteSizes,
};
use crate::utils::{etag_for, multipart_etag, validate_bucket_name, validate_key};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Version id of objects written while versioning is off or suspended
pub const NULL_VERSION: &str = "null";

/// Attempts at an operation whose target keeps changing during admission
const CONFLICT_RETRIES: usize = 3;

/// Bucket versioning state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Versioning {
    #[default]
    Unversioned,
    Enabled,
    Suspended,
}

impl Versioning {
    pub fn is_enabled(self) -> bool {
        self == Versioning::Enabled
    }
}

/// Where an object's bytes currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    Online,
    /// Moved to cold storage; its bytes stay counted
    Archived,
    /// Restore admitted, waiting for the completion write
    Restoring,
    /// Restored copy present next to the archived one
    Restored,
}

/// One version of an object
#[derive(Debug, Clone)]
pub struct ObjectVersion {
    pub version_id: String,
    pub data: Bytes,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub delete_marker: bool,
    pub storage: StorageState,
    pub legal_hold: bool,
    pub retain_until: Option<DateTime<Utc>>,
}

impl ObjectVersion {
    fn new(version_id: String, data: Bytes, etag: String) -> Self {
        ObjectVersion {
            version_id,
            data,
            etag,
            last_modified: Utc::now(),
            delete_marker: false,
            storage: StorageState::Online,
            legal_hold: false,
            retain_until: None,
        }
    }

    fn marker(version_id: String) -> Self {
        ObjectVersion {
            delete_marker: true,
            ..ObjectVersion::new(version_id, Bytes::new(), String::new())
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Bytes this version occupies, counting a restored copy twice
    pub fn stored_bytes(&self) -> u64 {
        match self.storage {
            StorageState::Restoring | StorageState::Restored => self.size() * 2,
            StorageState::Online | StorageState::Archived => self.size(),
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        !self.delete_marker && (self.legal_hold || self.retain_until.is_some_and(|t| t > now))
    }
}

/// Outcome of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub etag: String,
    pub version_id: Option<String>,
}

/// Outcome of a single delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub key: String,
    pub version_id: Option<String>,
    pub delete_marker: bool,
}

/// Listing entry for the current version of a key
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Bucket listing entry
#[derive(Debug, Clone)]
pub struct BucketSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// What a byte delta was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Footprint {
    versioning: Versioning,
    /// Stored bytes of the version the operation removes or replaces
    target: Option<u64>,
}

#[derive(Debug)]
struct BucketRecord {
    created_at: DateTime<Utc>,
    versioning: Versioning,
    quota_bytes: Option<u64>,
    /// Versions per key, oldest first
    objects: BTreeMap<String, Vec<ObjectVersion>>,
}

impl BucketRecord {
    fn new() -> Self {
        BucketRecord {
            created_at: Utc::now(),
            versioning: Versioning::Unversioned,
            quota_bytes: None,
            objects: BTreeMap::new(),
        }
    }

    fn current(&self, key: &str) -> Option<&ObjectVersion> {
        self.objects.get(key).and_then(|versions| versions.last())
    }

    fn version(&self, key: &str, version_id: &str) -> Option<&ObjectVersion> {
        self.objects
            .get(key)
            .and_then(|versions| versions.iter().find(|v| v.version_id == version_id))
    }

    fn version_mut(&mut self, key: &str, version_id: Option<&str>) -> Option<&mut ObjectVersion> {
        let versions = self.objects.get_mut(key)?;
        match version_id {
            Some(id) => versions.iter_mut().find(|v| v.version_id == id),
            None => versions.last_mut().filter(|v| !v.delete_marker),
        }
    }

    fn live_bytes(&self, key: &str, version_id: &str) -> Option<u64> {
        self.version(key, version_id)
            .filter(|v| !v.delete_marker)
            .map(ObjectVersion::stored_bytes)
    }

    /// Footprint of a write without a version id. With versioning enabled
    /// nothing is replaced.
    fn write_footprint(&self, key: &str) -> Footprint {
        let target = if self.versioning.is_enabled() {
            None
        } else {
            self.live_bytes(key, NULL_VERSION)
        };
        Footprint {
            versioning: self.versioning,
            target,
        }
    }

    fn delete_footprint(&self, key: &str, version_id: Option<&str>) -> Footprint {
        match version_id {
            Some(id) => Footprint {
                versioning: self.versioning,
                target: self.live_bytes(key, id),
            },
            None => self.write_footprint(key),
        }
    }

    /// Refuse a write over a locked null version
    fn ensure_replaceable(&self, key: &str) -> GatewayResult<()> {
        if self.versioning.is_enabled() {
            return Ok(());
        }
        match self.version(key, NULL_VERSION) {
            Some(v) if v.is_locked(Utc::now()) => Err(GatewayError::AccessDenied(format!(
                "{} is protected by object lock",
                key
            ))),
            _ => Ok(()),
        }
    }

    /// Remove the null version, refusing when it is locked
    fn take_null_version(&mut self, key: &str) -> GatewayResult<Option<ObjectVersion>> {
        let Some(versions) = self.objects.get_mut(key) else {
            return Ok(None);
        };
        let Some(idx) = versions.iter().position(|v| v.version_id == NULL_VERSION) else {
            return Ok(None);
        };
        if versions[idx].is_locked(Utc::now()) {
            return Err(GatewayError::AccessDenied(format!(
                "{} is protected by object lock",
                key
            )));
        }
        Ok(Some(versions.remove(idx)))
    }

    fn store(&mut self, key: &str, data: Bytes, etag: String) -> GatewayResult<PutResult> {
        let version_id = if self.versioning.is_enabled() {
            Uuid::new_v4().simple().to_string()
        } else {
            self.take_null_version(key)?;
            NULL_VERSION.to_string()
        };
        self.push(key, ObjectVersion::new(version_id.clone(), data, etag.clone()));
        Ok(PutResult {
            etag,
            version_id: (self.versioning != Versioning::Unversioned).then_some(version_id),
        })
    }

    fn push(&mut self, key: &str, version: ObjectVersion) {
        self.objects.entry(key.to_string()).or_default().push(version);
    }

    fn prune(&mut self, key: &str) {
        if self.objects.get(key).is_some_and(Vec::is_empty) {
            self.objects.remove(key);
        }
    }

    fn usage(&self) -> u64 {
        self.objects
            .values()
            .flatten()
            .filter(|v| !v.delete_marker)
            .map(ObjectVersion::stored_bytes)
            .sum()
    }
}

/// Bucket and object metadata store
#[derive(Debug, Default)]
pub struct BucketCatalog {
    buckets: RwLock<HashMap<String, BucketRecord>>,
}

impl BucketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, bucket: &str, f: impl FnOnce(&BucketRecord) -> GatewayResult<R>) -> GatewayResult<R> {
        let buckets = self.buckets.read();
        let record = buckets
            .get(bucket)
            .ok_or_else(|| GatewayError::NoSuchBucket(bucket.to_string()))?;
        f(record)
    }

    fn write<R>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut BucketRecord) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        let mut buckets = self.buckets.write();
        let record = buckets
            .get_mut(bucket)
            .ok_or_else(|| GatewayError::NoSuchBucket(bucket.to_string()))?;
        f(record)
    }

    fn with_quota<R>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut Option<u64>) -> R,
    ) -> QuotaResult<R> {
        let mut buckets = self.buckets.write();
        let record = buckets
            .get_mut(bucket)
            .ok_or_else(|| QuotaError::NoSuchBucket(bucket.to_string()))?;
        Ok(f(&mut record.quota_bytes))
    }
}

impl QuotaConfigStore for BucketCatalog {
    fn set_quota(&self, bucket: &str, quota_bytes: u64) -> QuotaResult<()> {
        let quota_bytes = validate_quota_bytes(quota_bytes)?;
        self.with_quota(bucket, |quota| *quota = Some(quota_bytes))
    }

    fn get_quota(&self, bucket: &str) -> QuotaResult<Option<BucketQuotaConfig>> {
        let buckets = self.buckets.read();
        let record = buckets
            .get(bucket)
            .ok_or_else(|| QuotaError::NoSuchBucket(bucket.to_string()))?;
        Ok(record.quota_bytes.map(|quota_bytes| BucketQuotaConfig {
            bucket_name: bucket.to_string(),
            quota_bytes,
        }))
    }

    fn delete_quota(&self, bucket: &str) -> QuotaResult<()> {
        self.with_quota(bucket, |quota| *quota = None)
    }
}

/// Gateway operations with quota admission
pub struct GatewayBackend {
    catalog: Arc<BucketCatalog>,
    multipart: MultipartManager,
    quota: Arc<AdmissionEvaluator>,
    restore_principal: Option<String>,
}

impl GatewayBackend {
    pub fn new(catalog: Arc<BucketCatalog>, quota: Arc<AdmissionEvaluator>) -> Self {
        GatewayBackend {
            catalog,
            multipart: MultipartManager::new(),
            quota,
            restore_principal: None,
        }
    }

    /// Let requests signed with `access_key` complete restores
    pub fn with_restore_principal(mut self, access_key: impl Into<String>) -> Self {
        self.restore_principal = Some(access_key.into());
        self
    }

    /// Whether a request signed with `access_key` may complete a restore.
    /// Anonymous requests never can.
    pub fn accepts_restore_completion(&self, access_key: Option<&str>) -> bool {
        match (&self.restore_principal, access_key) {
            (Some(principal), Some(key)) => principal == key,
            _ => false,
        }
    }

    /// Backend whose evaluator reads quotas from its own catalog
    pub fn with_quota(
        metering: Arc<dyn UsageMetering>,
        ledger: Arc<dyn InflightLedger>,
        settings: &QuotaSettings,
    ) -> Self {
        let catalog = Arc::new(BucketCatalog::new());
        let quota = Arc::new(AdmissionEvaluator::new(
            catalog.clone(),
            metering,
            ledger,
            settings,
        ));
        info!(
            enabled = settings.enabled,
            failure_mode = ?settings.failure_mode,
            window_ms = settings.reconciliation_window_ms,
            "Quota admission configured"
        );
        Self::new(catalog, quota)
    }

    pub fn catalog(&self) -> &Arc<BucketCatalog> {
        &self.catalog
    }

    pub fn quota(&self) -> &Arc<AdmissionEvaluator> {
        &self.quota
    }

    pub fn quota_admin(&self) -> QuotaAdmin {
        QuotaAdmin::new(self.catalog.clone())
    }

    // Buckets

    pub fn create_bucket(&self, bucket: &str) -> GatewayResult<()> {
        validate_bucket_name(bucket)?;
        let mut buckets = self.catalog.buckets.write();
        if buckets.contains_key(bucket) {
            return Err(GatewayError::BucketAlreadyExists(bucket.to_string()));
        }
        buckets.insert(bucket.to_string(), BucketRecord::new());
        info!("Bucket created: {}", bucket);
        Ok(())
    }

    /// Delete an empty bucket along with its quota and staged uploads
    pub fn delete_bucket(&self, bucket: &str) -> GatewayResult<()> {
        let mut buckets = self.catalog.buckets.write();
        let record = buckets
            .get(bucket)
            .ok_or_else(|| GatewayError::NoSuchBucket(bucket.to_string()))?;
        if !record.objects.is_empty() {
            return Err(GatewayError::BucketNotEmpty(bucket.to_string()));
        }
        buckets.remove(bucket);
        drop(buckets);

        let aborted = self.multipart.remove_bucket(bucket);
        info!(bucket, aborted_uploads = aborted, "Bucket deleted");
        Ok(())
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.catalog.buckets.read().contains_key(bucket)
    }

    pub fn list_buckets(&self) -> Vec<BucketSummary> {
        let mut buckets: Vec<BucketSummary> = self
            .catalog
            .buckets
            .read()
            .iter()
            .map(|(name, record)| BucketSummary {
                name: name.clone(),
                created_at: record.created_at,
            })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        buckets
    }

    /// Identity used for metering
    pub fn bucket_id(&self, bucket: &str) -> GatewayResult<BucketId> {
        self.catalog
            .read(bucket, |record| Ok(BucketId::new(bucket, record.created_at)))
    }

    pub fn versioning(&self, bucket: &str) -> GatewayResult<Versioning> {
        self.catalog.read(bucket, |record| Ok(record.versioning))
    }

    pub fn set_versioning(&self, bucket: &str, versioning: Versioning) -> GatewayResult<()> {
        self.catalog.write(bucket, |record| {
            if versioning == Versioning::Unversioned && record.versioning != Versioning::Unversioned {
                return Err(GatewayError::InvalidObjectState(
                    "versioning cannot be turned off once enabled, only suspended".to_string(),
                ));
            }
            record.versioning = versioning;
            Ok(())
        })?;
        info!(bucket, ?versioning, "Bucket versioning updated");
        Ok(())
    }

    /// Bytes stored in the bucket: current and noncurrent versions, plus
    /// staged multipart parts
    pub fn bucket_usage(&self, bucket: &str) -> GatewayResult<u64> {
        let stored = self.catalog.read(bucket, |record| Ok(record.usage()))?;
        Ok(stored + self.multipart.bucket_staged_bytes(bucket))
    }

    // Objects

    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> GatewayResult<PutResult> {
        validate_key(key)?;
        retry_on_conflict(bucket, key, || self.put_once(bucket, key, data.clone())).await
    }

    async fn put_once(&self, bucket: &str, key: &str, data: Bytes) -> GatewayResult<PutResult> {
        let (id, expected) = self.catalog.read(bucket, |record| {
            Ok((BucketId::new(bucket, record.created_at), record.write_footprint(key)))
        })?;

        let delta = bytes_to_write(
            ActionKind::PutObject,
            expected.versioning.is_enabled(),
            None,
            WriteSizes::body(data.len() as u64).existing(expected.target),
        );
        debug!(bucket, key, bytes = data.len(), delta, "PutObject");

        self.quota
            .run(&id, delta, ActionKind::PutObject, None, move || async move {
                let etag = etag_for(&data);
                self.store(bucket, key, data, etag, expected)
            })
            .await
    }

    /// Write that finalizes an admitted restore.
    ///
    /// Only honored while the object is restoring; otherwise it is an
    /// ordinary put. The body must be exactly the archived object, since
    /// only that many bytes were reserved by [`GatewayBackend::restore_object`].
    pub async fn complete_restore(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> GatewayResult<PutResult> {
        validate_key(key)?;
        let (id, restoring) = self.catalog.read(bucket, |record| {
            let restoring = record
                .objects
                .get(key)
                .and_then(|versions| {
                    versions
                        .iter()
                        .rev()
                        .find(|v| v.storage == StorageState::Restoring)
                })
                .map(|v| (v.version_id.clone(), v.size()));
            Ok((BucketId::new(bucket, record.created_at), restoring))
        })?;

        let Some((version_id, archived_size)) = restoring else {
            warn!(bucket, key, "Restore completion for an object that is not restoring, treating as a regular write");
            return self.put_object(bucket, key, data).await;
        };

        if data.len() as u64 != archived_size {
            warn!(
                bucket,
                key,
                bytes = data.len(),
                archived_size,
                "Restore completion does not match the archived object"
            );
            return Err(GatewayError::InvalidObjectState(format!(
                "restore completion of {}/{} carries {} bytes, the archived object has {}",
                bucket,
                key,
                data.len(),
                archived_size
            )));
        }

        let delta = data.len() as i64;
        self.quota
            .run(
                &id,
                delta,
                ActionKind::PutObject,
                Some(RestoreMarker::internal()),
                move || async move {
                    self.catalog.write(bucket, |record| {
                        let versioned = record.versioning != Versioning::Unversioned;
                        let version = record
                            .version_mut(key, Some(&version_id))
                            .filter(|v| v.storage == StorageState::Restoring && v.size() == archived_size)
                            .ok_or_else(|| {
                                GatewayError::InvalidObjectState(format!("{} is not restoring", key))
                            })?;
                        version.etag = etag_for(&data);
                        version.data = data;
                        version.storage = StorageState::Restored;
                        Ok(PutResult {
                            etag: version.etag.clone(),
                            version_id: versioned.then(|| version_id.clone()),
                        })
                    })
                },
            )
            .await
    }

    /// Store a new version, provided the key still has the footprint the
    /// admitted delta was computed from
    fn store(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        etag: String,
        expected: Footprint,
    ) -> GatewayResult<PutResult> {
        self.catalog.write(bucket, |record| {
            check_unchanged(expected, record.write_footprint(key), bucket, key)?;
            record.store(key, data, etag)
        })
    }

    /// Current version, or the given one
    pub fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> GatewayResult<ObjectVersion> {
        self.catalog.read(bucket, |record| {
            let found = match version_id {
                Some(id) => record
                    .version(key, id)
                    .ok_or_else(|| GatewayError::NoSuchVersion(format!("{}?versionId={}", key, id)))?,
                None => record
                    .current(key)
                    .ok_or_else(|| GatewayError::NoSuchKey(format!("{}/{}", bucket, key)))?,
            };
            if found.delete_marker {
                return Err(GatewayError::NoSuchKey(format!("{}/{}", bucket, key)));
            }
            Ok(found.clone())
        })
    }

    /// Like [`GatewayBackend::head_object`], refusing archived content
    pub fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> GatewayResult<ObjectVersion> {
        let version = self.head_object(bucket, key, version_id)?;
        match version.storage {
            StorageState::Online | StorageState::Restored => Ok(version),
            StorageState::Archived | StorageState::Restoring => Err(GatewayError::InvalidObjectState(
                format!("{}/{} is archived", bucket, key),
            )),
        }
    }

    pub fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> GatewayResult<Vec<ObjectSummary>> {
        self.catalog.read(bucket, |record| {
            Ok(record
                .objects
                .iter()
                .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
                .filter_map(|(key, versions)| {
                    let current = versions.last().filter(|v| !v.delete_marker)?;
                    Some(ObjectSummary {
                        key: key.clone(),
                        size: current.size(),
                        etag: current.etag.clone(),
                        last_modified: current.last_modified,
                    })
                })
                .collect())
        })
    }

    pub async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        source_version: Option<&str>,
        dest_bucket: &str,
        dest_key: &str,
    ) -> GatewayResult<PutResult> {
        validate_key(dest_key)?;
        retry_on_conflict(dest_bucket, dest_key, || {
            self.copy_once(source_bucket, source_key, source_version, dest_bucket, dest_key)
        })
        .await
    }

    async fn copy_once(
        &self,
        source_bucket: &str,
        source_key: &str,
        source_version: Option<&str>,
        dest_bucket: &str,
        dest_key: &str,
    ) -> GatewayResult<PutResult> {
        let source = self.get_object(source_bucket, source_key, source_version)?;
        let (id, expected) = self.catalog.read(dest_bucket, |record| {
            Ok((
                BucketId::new(dest_bucket, record.created_at),
                record.write_footprint(dest_key),
            ))
        })?;

        let delta = bytes_to_write(
            ActionKind::CopyObject,
            expected.versioning.is_enabled(),
            None,
            WriteSizes::default()
                .existing(Some(source.size()))
                .replacing(expected.target),
        );
        debug!(
            "Copying object: {}/{} -> {}/{} (delta {})",
            source_bucket, source_key, dest_bucket, dest_key, delta
        );

        self.quota
            .run(&id, delta, ActionKind::CopyObject, None, move || async move {
                self.store(dest_bucket, dest_key, source.data, source.etag, expected)
            })
            .await
    }

    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> GatewayResult<DeletedObject> {
        self.delete_with(bucket, key, version_id, ActionKind::DeleteObject)
            .await
    }

    /// Delete each key independently; one failure does not stop the rest
    pub async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[(String, Option<String>)],
    ) -> GatewayResult<Vec<(String, GatewayResult<DeletedObject>)>> {
        if !self.bucket_exists(bucket) {
            return Err(GatewayError::NoSuchBucket(bucket.to_string()));
        }

        let mut results = Vec::with_capacity(objects.len());
        for (key, version_id) in objects {
            let result = self
                .delete_with(bucket, key, version_id.as_deref(), ActionKind::DeleteObjects)
                .await;
            results.push((key.clone(), result));
        }

        info!(
            "Bulk delete completed: {} keys, {} succeeded, {} failed",
            objects.len(),
            results.iter().filter(|(_, r)| r.is_ok()).count(),
            results.iter().filter(|(_, r)| r.is_err()).count()
        );
        Ok(results)
    }

    async fn delete_with(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        action: ActionKind,
    ) -> GatewayResult<DeletedObject> {
        validate_key(key)?;
        retry_on_conflict(bucket, key, || self.delete_once(bucket, key, version_id, action)).await
    }

    async fn delete_once(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        action: ActionKind,
    ) -> GatewayResult<DeletedObject> {
        let (id, expected) = self.catalog.read(bucket, |record| {
            Ok((
                BucketId::new(bucket, record.created_at),
                record.delete_footprint(key, version_id),
            ))
        })?;

        let delta = bytes_to_write(
            action,
            expected.versioning.is_enabled(),
            version_id,
            WriteSizes::default().existing(expected.target),
        );
        debug!(bucket, key, ?version_id, delta, "Delete");

        self.quota
            .run(&id, delta, action, None, move || async move {
                self.catalog.write(bucket, |record| {
                    check_unchanged(expected, record.delete_footprint(key, version_id), bucket, key)?;
                    remove_version(record, key, version_id)
                })
            })
            .await
    }

    // Archive and restore

    /// Move the current version to cold storage
    pub fn archive_object(&self, bucket: &str, key: &str) -> GatewayResult<()> {
        self.catalog.write(bucket, |record| {
            let version = record
                .version_mut(key, None)
                .ok_or_else(|| GatewayError::NoSuchKey(format!("{}/{}", bucket, key)))?;
            match version.storage {
                StorageState::Online | StorageState::Restored => {
                    version.storage = StorageState::Archived;
                    Ok(())
                }
                StorageState::Archived | StorageState::Restoring => Err(
                    GatewayError::InvalidObjectState(format!("{}/{} is already archived", bucket, key)),
                ),
            }
        })?;
        info!(bucket, key, "Object archived");
        Ok(())
    }

    /// Request a restore of an archived object; its size is reserved now.
    /// Asking again for an object that is already restored is a no-op.
    pub async fn restore_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> GatewayResult<()> {
        let version = self.head_object(bucket, key, version_id)?;
        match version.storage {
            StorageState::Archived => {}
            StorageState::Restored => {
                debug!(bucket, key, "Object already restored");
                return Ok(());
            }
            StorageState::Restoring => {
                return Err(GatewayError::InvalidObjectState(format!(
                    "restore of {}/{} already in progress",
                    bucket, key
                )))
            }
            StorageState::Online => {
                return Err(GatewayError::InvalidObjectState(format!(
                    "{}/{} is not archived",
                    bucket, key
                )))
            }
        }

        let (id, versioning) = self.catalog.read(bucket, |record| {
            Ok((BucketId::new(bucket, record.created_at), record.versioning))
        })?;
        let delta = bytes_to_write(
            ActionKind::RestoreObject,
            versioning.is_enabled(),
            version_id,
            WriteSizes::default().existing(Some(version.size())),
        );
        let target = version.version_id;

        self.quota
            .run(&id, delta, ActionKind::RestoreObject, None, move || async move {
                self.catalog.write(bucket, |record| {
                    let version = record
                        .version_mut(key, Some(&target))
                        .filter(|v| v.storage == StorageState::Archived)
                        .ok_or_else(|| {
                            GatewayError::InvalidObjectState(format!("{}/{} is not archived", bucket, key))
                        })?;
                    version.storage = StorageState::Restoring;
                    Ok(())
                })
            })
            .await?;
        info!(bucket, key, "Restore requested");
        Ok(())
    }

    // Object lock

    pub fn set_legal_hold(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        on: bool,
    ) -> GatewayResult<()> {
        self.catalog.write(bucket, |record| {
            let version = record
                .version_mut(key, version_id)
                .ok_or_else(|| GatewayError::NoSuchKey(format!("{}/{}", bucket, key)))?;
            version.legal_hold = on;
            Ok(())
        })
    }

    pub fn set_retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        retain_until: Option<DateTime<Utc>>,
    ) -> GatewayResult<()> {
        self.catalog.write(bucket, |record| {
            let version = record
                .version_mut(key, version_id)
                .ok_or_else(|| GatewayError::NoSuchKey(format!("{}/{}", bucket, key)))?;
            // Retention can be extended but not shortened while active
            if let (Some(current), Some(requested)) = (version.retain_until, retain_until) {
                if requested < current && current > Utc::now() {
                    return Err(GatewayError::AccessDenied(format!(
                        "retention of {} cannot be shortened",
                        key
                    )));
                }
            }
            version.retain_until = retain_until;
            Ok(())
        })
    }

    // Multipart

    pub fn create_multipart_upload(&self, bucket: &str, key: &str) -> GatewayResult<String> {
        validate_key(key)?;
        if !self.bucket_exists(bucket) {
            return Err(GatewayError::NoSuchBucket(bucket.to_string()));
        }
        let upload_id = self.multipart.create_upload(bucket, key);
        debug!(bucket, key, upload_id = %upload_id, "Multipart upload created");
        Ok(upload_id)
    }

    fn upload_for(&self, bucket: &str, key: &str, upload_id: &str) -> GatewayResult<MultipartUpload> {
        let upload = self.multipart.get_upload(upload_id)?;
        if upload.bucket != bucket || upload.key != key {
            return Err(GatewayError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(upload)
    }

    /// Stage a part; its bytes are admitted now, net of any part it replaces
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> GatewayResult<String> {
        self.upload_for(bucket, key, upload_id)?;
        retry_on_conflict(bucket, key, || {
            self.stage_part(bucket, upload_id, part_number, data.clone(), ActionKind::UploadPart)
        })
        .await
    }

    /// Stage a part copied from an existing object
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_bucket: &str,
        source_key: &str,
        source_version: Option<&str>,
    ) -> GatewayResult<String> {
        self.upload_for(bucket, key, upload_id)?;
        let source = self.get_object(source_bucket, source_key, source_version)?;
        retry_on_conflict(bucket, key, || {
            self.stage_part(
                bucket,
                upload_id,
                part_number,
                source.data.clone(),
                ActionKind::UploadPartCopy,
            )
        })
        .await
    }

    async fn stage_part(
        &self,
        bucket: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        action: ActionKind,
    ) -> GatewayResult<String> {
        let id = self.bucket_id(bucket)?;
        let replaces = self.multipart.part_size(upload_id, part_number)?;
        let delta = bytes_to_write(
            action,
            false,
            None,
            WriteSizes::body(data.len() as u64).existing(replaces),
        );
        debug!(bucket, upload_id, part_number, bytes = data.len(), delta, "Staging part");

        self.quota
            .run(&id, delta, action, None, move || async move {
                self.multipart.upload_part(upload_id, part_number, data, replaces)
            })
            .await
    }

    pub fn list_parts(&self, bucket: &str, key: &str, upload_id: &str) -> GatewayResult<Vec<UploadedPart>> {
        self.upload_for(bucket, key, upload_id)?;
        self.multipart.list_parts(upload_id)
    }

    /// Assemble the upload into an object.
    ///
    /// Staged parts were admitted as they arrived, so only the change
    /// beyond them is admitted here: parts left out of the object are
    /// released, and so is the object it replaces. A failed completion
    /// leaves the upload in place so it can still be aborted.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[i32],
    ) -> GatewayResult<PutResult> {
        retry_on_conflict(bucket, key, || self.complete_once(bucket, key, upload_id, parts)).await
    }

    async fn complete_once(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[i32],
    ) -> GatewayResult<PutResult> {
        let upload = self.upload_for(bucket, key, upload_id)?;
        let data = upload.assemble(parts)?;
        let staged = upload.staged_bytes();
        let etag = if parts.is_empty() {
            multipart_etag(upload.parts.values().map(|p| p.etag.as_str()))
        } else {
            multipart_etag(
                parts
                    .iter()
                    .filter_map(|n| upload.parts.get(n))
                    .map(|p| p.etag.as_str()),
            )
        };

        let (id, expected) = self.catalog.read(bucket, |record| {
            Ok((BucketId::new(bucket, record.created_at), record.write_footprint(key)))
        })?;
        let written = bytes_to_write(
            ActionKind::CompleteMultipartUpload,
            expected.versioning.is_enabled(),
            None,
            WriteSizes::body(data.len() as u64).existing(expected.target),
        );
        let delta = written.saturating_sub(i64::try_from(staged).unwrap_or(i64::MAX));
        debug!(bucket, key, upload_id, bytes = data.len(), staged, delta, "CompleteMultipartUpload");

        self.quota
            .run(
                &id,
                delta,
                ActionKind::CompleteMultipartUpload,
                None,
                move || async move {
                    self.catalog.write(bucket, |record| {
                        check_unchanged(expected, record.write_footprint(key), bucket, key)?;
                        record.ensure_replaceable(key)?;
                        self.multipart.take(upload_id, staged)?;
                        record.store(key, data, etag)
                    })
                },
            )
            .await
    }

    /// Discard an upload, releasing its staged bytes
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<()> {
        retry_on_conflict(bucket, key, || self.abort_once(bucket, key, upload_id)).await?;
        debug!(bucket, key, upload_id, "Multipart upload aborted");
        Ok(())
    }

    async fn abort_once(&self, bucket: &str, key: &str, upload_id: &str) -> GatewayResult<()> {
        let staged = self.upload_for(bucket, key, upload_id)?.staged_bytes();
        let id = self.bucket_id(bucket)?;
        let delta = -i64::try_from(staged).unwrap_or(i64::MAX);
        self.quota
            .run(&id, delta, ActionKind::AbortMultipartUpload, None, move || async move {
                self.multipart.take(upload_id, staged).map(|_| ())
            })
            .await
    }
}

fn check_unchanged(expected: Footprint, actual: Footprint, bucket: &str, key: &str) -> GatewayResult<()> {
    if expected == actual {
        return Ok(());
    }
    Err(GatewayError::Conflict(format!(
        "{}/{} changed while the operation was being admitted",
        bucket, key
    )))
}

/// Run `attempt` again while it fails with [`GatewayError::Conflict`]
async fn retry_on_conflict<T, F, Fut>(bucket: &str, key: &str, mut attempt: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    for n in 1..=CONFLICT_RETRIES {
        match attempt().await {
            Err(GatewayError::Conflict(reason)) => {
                debug!(bucket, key, attempt = n, reason = %reason, "Retrying after a concurrent change");
            }
            other => return other,
        }
    }
    warn!(bucket, key, attempts = CONFLICT_RETRIES, "Giving up after repeated concurrent changes");
    Err(GatewayError::Conflict(format!(
        "{}/{} kept changing, try again",
        bucket, key
    )))
}

fn remove_version(
    record: &mut BucketRecord,
    key: &str,
    version_id: Option<&str>,
) -> GatewayResult<DeletedObject> {
    let now = Utc::now();

    if let Some(id) = version_id {
        let Some(versions) = record.objects.get_mut(key) else {
            return Ok(DeletedObject {
                key: key.to_string(),
                version_id: Some(id.to_string()),
                delete_marker: false,
            });
        };
        let mut delete_marker = false;
        if let Some(idx) = versions.iter().position(|v| v.version_id == id) {
            if versions[idx].is_locked(now) {
                return Err(GatewayError::AccessDenied(format!(
                    "{} version {} is protected by object lock",
                    key, id
                )));
            }
            delete_marker = versions.remove(idx).delete_marker;
        }
        record.prune(key);
        return Ok(DeletedObject {
            key: key.to_string(),
            version_id: Some(id.to_string()),
            delete_marker,
        });
    }

    match record.versioning {
        Versioning::Enabled => {
            let marker_id = Uuid::new_v4().simple().to_string();
            if record.objects.contains_key(key) {
                record.push(key, ObjectVersion::marker(marker_id.clone()));
            }
            Ok(DeletedObject {
                key: key.to_string(),
                version_id: Some(marker_id),
                delete_marker: true,
            })
        }
        Versioning::Suspended => {
            record.take_null_version(key)?;
            record.push(key, ObjectVersion::marker(NULL_VERSION.to_string()));
            Ok(DeletedObject {
                key: key.to_string(),
                version_id: Some(NULL_VERSION.to_string()),
                delete_marker: true,
            })
        }
        Versioning::Unversioned => {
            record.take_null_version(key)?;
            record.prune(key);
            Ok(DeletedObject {
                key: key.to_string(),
                version_id: None,
                delete_marker: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{LocalLedger, ManualMetering};

    fn backend() -> (GatewayBackend, Arc<ManualMetering>, Arc<LocalLedger>) {
        let settings = QuotaSettings::default();
        let metering = Arc::new(ManualMetering::new());
        let ledger = Arc::new(LocalLedger::new(settings.reconciliation_window()));
        let backend = GatewayBackend::with_quota(metering.clone(), ledger.clone(), &settings);
        (backend, metering, ledger)
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (backend, _, _) = backend();
        backend.create_bucket("alpha").unwrap();
        assert!(matches!(
            backend.create_bucket("alpha"),
            Err(GatewayError::BucketAlreadyExists(_))
        ));
        assert!(backend.create_bucket("Bad_Name").is_err());

        backend
            .put_object("alpha", "k", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert!(matches!(
            backend.delete_bucket("alpha"),
            Err(GatewayError::BucketNotEmpty(_))
        ));

        backend.delete_object("alpha", "k", None).await.unwrap();
        backend.delete_bucket("alpha").unwrap();
        assert!(backend.list_buckets().is_empty());
    }

    #[tokio::test]
    async fn test_quota_lives_on_bucket_record() {
        let (backend, _, _) = backend();
        let catalog = backend.catalog();

        assert!(matches!(
            catalog.set_quota("missing", 10),
            Err(QuotaError::NoSuchBucket(_))
        ));

        backend.create_bucket("quota-bucket").unwrap();
        catalog.set_quota("quota-bucket", 1000).unwrap();
        assert_eq!(
            catalog.get_quota("quota-bucket").unwrap().unwrap().quota_bytes,
            1000
        );

        // Re-creating the bucket starts without a quota
        backend.delete_bucket("quota-bucket").unwrap();
        backend.create_bucket("quota-bucket").unwrap();
        assert_eq!(catalog.get_quota("quota-bucket").unwrap(), None);
    }

    #[tokio::test]
    async fn test_versioned_usage() {
        let (backend, _, _) = backend();
        backend.create_bucket("versions").unwrap();
        backend.set_versioning("versions", Versioning::Enabled).unwrap();

        let first = backend
            .put_object("versions", "k", Bytes::from(vec![0u8; 400]))
            .await
            .unwrap();
        backend
            .put_object("versions", "k", Bytes::from(vec![0u8; 300]))
            .await
            .unwrap();
        assert_eq!(backend.bucket_usage("versions").unwrap(), 700);

        let deleted = backend.delete_object("versions", "k", None).await.unwrap();
        assert!(deleted.delete_marker);
        assert!(matches!(
            backend.get_object("versions", "k", None),
            Err(GatewayError::NoSuchKey(_))
        ));
        assert_eq!(backend.bucket_usage("versions").unwrap(), 700);

        let old = first.version_id.unwrap();
        assert_eq!(backend.get_object("versions", "k", Some(&old)).unwrap().size(), 400);
        backend
            .delete_object("versions", "k", Some(&old))
            .await
            .unwrap();
        assert_eq!(backend.bucket_usage("versions").unwrap(), 300);
        assert!(backend.set_versioning("versions", Versioning::Unversioned).is_err());
    }

    #[tokio::test]
    async fn test_archived_objects_cannot_be_read() {
        let (backend, _, _) = backend();
        backend.create_bucket("cold").unwrap();
        backend
            .put_object("cold", "k", Bytes::from_static(b"frozen"))
            .await
            .unwrap();
        backend.archive_object("cold", "k").unwrap();

        assert!(matches!(
            backend.get_object("cold", "k", None),
            Err(GatewayError::InvalidObjectState(_))
        ));
        assert!(backend.head_object("cold", "k", None).is_ok());
        assert_eq!(backend.bucket_usage("cold").unwrap(), 6);

        backend.restore_object("cold", "k", None).await.unwrap();
        assert!(backend.restore_object("cold", "k", None).await.is_err());

        // The completion must carry the archived bytes, no more and no less
        assert!(matches!(
            backend
                .complete_restore("cold", "k", Bytes::from_static(b"frozen and then some"))
                .await,
            Err(GatewayError::InvalidObjectState(_))
        ));
        backend
            .complete_restore("cold", "k", Bytes::from_static(b"frozen"))
            .await
            .unwrap();
        let restored = backend.get_object("cold", "k", None).unwrap();
        assert_eq!(restored.storage, StorageState::Restored);
        assert_eq!(backend.bucket_usage("cold").unwrap(), 12);

        // Restoring again is accepted and changes nothing
        backend.restore_object("cold", "k", None).await.unwrap();
        assert_eq!(
            backend.get_object("cold", "k", None).unwrap().storage,
            StorageState::Restored
        );
    }

    #[test]
    fn test_restore_principal() {
        let (backend, _, _) = backend();
        assert!(!backend.accepts_restore_completion(Some("anyone")));
        assert!(!backend.accepts_restore_completion(None));

        let backend = backend.with_restore_principal("cold-storage");
        assert!(backend.accepts_restore_completion(Some("cold-storage")));
        assert!(!backend.accepts_restore_completion(Some("tenant")));
        assert!(!backend.accepts_restore_completion(None));
    }

    #[tokio::test]
    async fn test_copy_and_list() {
        let (backend, _, _) = backend();
        backend.create_bucket("src-bucket").unwrap();
        backend.create_bucket("dst-bucket").unwrap();
        backend
            .put_object("src-bucket", "a/one", Bytes::from_static(b"12345"))
            .await
            .unwrap();
        backend
            .copy_object("src-bucket", "a/one", None, "dst-bucket", "b/two")
            .await
            .unwrap();

        let listed = backend.list_objects("dst-bucket", Some("b/")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 5);
        assert!(backend.list_objects("dst-bucket", Some("a/")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_must_match_bucket_and_key() {
        let (backend, _, _) = backend();
        backend.create_bucket("mpu").unwrap();
        let upload_id = backend.create_multipart_upload("mpu", "k").unwrap();
        assert!(matches!(
            backend
                .upload_part("mpu", "other", &upload_id, 1, Bytes::from_static(b"x"))
                .await,
            Err(GatewayError::NoSuchUpload(_))
        ));

        backend
            .upload_part("mpu", "k", &upload_id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        backend
            .upload_part("mpu", "k", &upload_id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        assert_eq!(backend.bucket_usage("mpu").unwrap(), 4);
        let result = backend
            .complete_multipart_upload("mpu", "k", &upload_id, &[1, 2])
            .await
            .unwrap();
        assert!(result.etag.ends_with("-2"));
        assert_eq!(&backend.get_object("mpu", "k", None).unwrap().data[..], b"abcd");
        assert!(backend.list_parts("mpu", "k", &upload_id).is_err());
    }
}
