//! Naming rules and content hashing

use crate::error::{GatewayError, GatewayResult};
use sha2::{Digest, Sha256};

/// Validate a bucket name
///
/// Rules:
/// - 3-63 characters
/// - Lowercase letters, numbers, dots, hyphens
/// - Must start and end with letter or number
/// - No consecutive dots
pub fn validate_bucket_name(name: &str) -> GatewayResult<()> {
    if !(3..=63).contains(&name.len()) {
        return Err(GatewayError::InvalidBucketName(format!(
            "Bucket name must be 3-63 characters, got {}",
            name.len()
        )));
    }

    if !name
        .bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'.' || c == b'-')
    {
        return Err(GatewayError::InvalidBucketName(
            "Bucket name must contain only lowercase letters, numbers, dots, and hyphens"
                .to_string(),
        ));
    }

    let edges_ok = name
        .bytes()
        .next()
        .zip(name.bytes().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !edges_ok {
        return Err(GatewayError::InvalidBucketName(
            "Bucket name must start and end with letter or number".to_string(),
        ));
    }

    if name.contains("..") {
        return Err(GatewayError::InvalidBucketName(
            "Bucket name cannot contain consecutive dots".to_string(),
        ));
    }

    Ok(())
}

/// Keys are any UTF-8 string of 1 to 1024 bytes
pub fn validate_key(key: &str) -> GatewayResult<()> {
    if key.is_empty() {
        return Err(GatewayError::InvalidKey("Key cannot be empty".to_string()));
    }
    if key.len() > 1024 {
        return Err(GatewayError::InvalidKey(format!(
            "Key too long: {} bytes (max 1024)",
            key.len()
        )));
    }
    Ok(())
}

/// Hex SHA-256 of the content, used as the object's ETag
pub fn etag_for(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// ETag of a completed multipart object: digest of the part ETags plus part count
pub fn multipart_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    let mut count = 0usize;
    for etag in part_etags {
        hasher.update(etag.as_bytes());
        count += 1;
    }
    format!("{}-{}", hex::encode(hasher.finalize()), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("mybucket").is_ok());
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("my.bucket").is_ok());
        assert!(validate_bucket_name("bucket123").is_ok());

        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
        assert!(validate_bucket_name("MyBucket").is_err());
        assert!(validate_bucket_name("-bucket").is_err());
        assert!(validate_bucket_name("bucket-").is_err());
        assert!(validate_bucket_name("my..bucket").is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("file.txt").is_ok());
        assert!(validate_key("dir/file.txt").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"a".repeat(1025)).is_err());
    }

    #[test]
    fn test_etags() {
        let etag = etag_for(b"Hello, World!");
        assert_eq!(etag.len(), 64);
        assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(etag, etag_for(b"Hello, World!"));
        assert_ne!(etag, etag_for(b"Different data"));

        let combined = multipart_etag(["a", "b", "c"]);
        assert!(combined.ends_with("-3"));
    }
}
