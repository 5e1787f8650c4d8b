//! Quota control-plane requests: `{bucket}?quota=true`

use crate::error::{QuotaError, QuotaResult};
use crate::quota::config_store::{parse_quota_payload, QuotaConfigStore};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// HTTP verb of a control-plane request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaVerb {
    Put,
    Post,
    Get,
    Delete,
}

impl QuotaVerb {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "PUT" => Some(QuotaVerb::Put),
            "POST" => Some(QuotaVerb::Post),
            "GET" => Some(QuotaVerb::Get),
            "DELETE" => Some(QuotaVerb::Delete),
            _ => None,
        }
    }
}

/// Successful control-plane outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaReply {
    Updated,
    Quota(u64),
    Deleted,
}

impl QuotaReply {
    /// Response body, empty except for reads
    pub fn body(&self) -> Vec<u8> {
        match self {
            QuotaReply::Quota(bytes) => json!({ "quota": bytes }).to_string().into_bytes(),
            QuotaReply::Updated | QuotaReply::Deleted => Vec::new(),
        }
    }
}

/// True for query strings carrying `quota=true`
pub fn is_quota_request(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .any(|pair| pair.eq_ignore_ascii_case("quota=true"))
    })
}

/// Handles quota administration against a [`QuotaConfigStore`]
#[derive(Clone)]
pub struct QuotaAdmin {
    store: Arc<dyn QuotaConfigStore>,
}

impl QuotaAdmin {
    pub fn new(store: Arc<dyn QuotaConfigStore>) -> Self {
        QuotaAdmin { store }
    }

    pub fn handle(&self, verb: QuotaVerb, bucket: &str, body: &[u8]) -> QuotaResult<QuotaReply> {
        match verb {
            QuotaVerb::Put | QuotaVerb::Post => {
                let quota_bytes = parse_quota_payload(body)?;
                self.store.set_quota(bucket, quota_bytes)?;
                info!(bucket, quota_bytes, "Bucket quota updated");
                Ok(QuotaReply::Updated)
            }
            QuotaVerb::Get => self
                .store
                .get_quota(bucket)?
                .map(|config| QuotaReply::Quota(config.quota_bytes))
                .ok_or_else(|| QuotaError::NoSuchQuota(bucket.to_string())),
            QuotaVerb::Delete => {
                self.store.delete_quota(bucket)?;
                info!(bucket, "Bucket quota deleted");
                Ok(QuotaReply::Deleted)
            }
        }
    }
}
