//! Byte delta of a mutating operation
//!
//! Callers compute the delta before evaluation. The rules:
//!
//! - restore: the archived object's size
//! - write of `n > 0` bytes over an existing object on an unversioned bucket: `n - old`
//! - copy: the source size, or `source - destination` when it replaces a
//!   destination on an unversioned bucket
//! - removal (no body) of an existing object: `-size` on an unversioned bucket or
//!   when a specific version is targeted, `0` otherwise (a delete marker)
//! - anything else: the body length

use crate::quota::evaluator::ActionKind;

/// Sizes known to the caller when computing a delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSizes {
    /// Bytes in the request body (0 for copies, deletes and restores)
    pub content_length: u64,
    /// The existing object: overwritten, deleted, restored, or the copy source
    pub object_size: Option<u64>,
    /// The copy destination being replaced
    pub destination_size: Option<u64>,
}

impl WriteSizes {
    pub fn body(content_length: u64) -> Self {
        WriteSizes {
            content_length,
            ..Default::default()
        }
    }

    pub fn existing(mut self, object_size: Option<u64>) -> Self {
        self.object_size = object_size;
        self
    }

    pub fn replacing(mut self, destination_size: Option<u64>) -> Self {
        self.destination_size = destination_size;
        self
    }
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Net change in stored bytes caused by `action`
pub fn bytes_to_write(
    action: ActionKind,
    versioning_enabled: bool,
    version_id: Option<&str>,
    sizes: WriteSizes,
) -> i64 {
    let content = signed(sizes.content_length);
    // A zero-byte object contributes nothing either way
    let existing = sizes.object_size.filter(|&size| size > 0).map(signed);

    if action == ActionKind::RestoreObject {
        return existing.unwrap_or(0);
    }

    match existing {
        Some(object) if content == 0 => {
            if action == ActionKind::CopyObject {
                match sizes.destination_size {
                    Some(destination) if !versioning_enabled => object - signed(destination),
                    _ => object,
                }
            } else if !versioning_enabled || version_id.is_some() {
                -object
            } else {
                0
            }
        }
        Some(object) if !versioning_enabled => content - object,
        _ => content,
    }
}
