//! Custom s3s route serving the quota control-plane
//!
//! `PUT|POST|GET|DELETE /{bucket}?quota=true` is answered here before s3s
//! attempts to parse the request as an S3 operation.

use crate::quota::{is_quota_request, QuotaAdmin, QuotaReply, QuotaVerb};
use crate::s3_impl::quota_error;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::{Extensions, HeaderMap, Method, Uri};
use hyper::StatusCode;
use s3s::route::S3Route;
use s3s::{s3_error, Body, S3Request, S3Response, S3Result};
use tracing::debug;

/// Bucket named by a path-style request with no key
fn bucket_from_path(path: &str) -> Option<&str> {
    let bucket = path.trim_matches('/');
    if bucket.is_empty() || bucket.contains('/') {
        None
    } else {
        Some(bucket)
    }
}

/// Routes `?quota=true` requests to a [`QuotaAdmin`]
pub struct QuotaRoute {
    admin: QuotaAdmin,
    require_auth: bool,
}

impl QuotaRoute {
    /// With `require_auth`, unsigned requests are refused
    pub fn new(admin: QuotaAdmin, require_auth: bool) -> Self {
        QuotaRoute {
            admin,
            require_auth,
        }
    }

    /// Whether a request targets the quota control-plane
    pub fn matches(method: &Method, uri: &Uri) -> bool {
        QuotaVerb::from_method(method.as_str()).is_some()
            && is_quota_request(uri.query())
            && bucket_from_path(uri.path()).is_some()
    }
}

#[async_trait::async_trait]
impl S3Route for QuotaRoute {
    fn is_match(&self, method: &Method, uri: &Uri, _: &HeaderMap, _: &mut Extensions) -> bool {
        Self::matches(method, uri)
    }

    async fn check_access(&self, req: &mut S3Request<Body>) -> S3Result<()> {
        if self.require_auth && req.credentials.is_none() {
            return Err(s3_error!(AccessDenied, "Signature is required"));
        }
        Ok(())
    }

    async fn call(&self, req: S3Request<Body>) -> S3Result<S3Response<Body>> {
        let verb = QuotaVerb::from_method(req.method.as_str())
            .ok_or_else(|| s3_error!(MethodNotAllowed))?;
        let bucket = bucket_from_path(req.uri.path())
            .ok_or_else(|| s3_error!(InvalidRequest, "Quota requests must name a bucket"))?
            .to_string();

        let body = req
            .input
            .collect()
            .await
            .map_err(|e| s3_error!(IncompleteBody, "Failed to read body: {}", e))?
            .to_bytes();

        debug!(bucket = %bucket, verb = ?verb, bytes = body.len(), "Quota control-plane request");
        let reply = self.admin.handle(verb, &bucket, &body).map_err(quota_error)?;

        let mut resp = match &reply {
            QuotaReply::Quota(_) => {
                let mut resp = S3Response::new(Body::from(Bytes::from(reply.body())));
                resp.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                resp
            }
            QuotaReply::Updated | QuotaReply::Deleted => S3Response::new(Body::empty()),
        };
        resp.status = Some(match reply {
            QuotaReply::Deleted => StatusCode::NO_CONTENT,
            QuotaReply::Updated | QuotaReply::Quota(_) => StatusCode::OK,
        });
        Ok(resp)
    }
}
