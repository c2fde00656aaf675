//! Blob store seam: where book files and covers end up.

pub mod local;
pub mod memory;
pub mod supabase;

use async_trait::async_trait;

use crate::error::{ReconcileError, Result};

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use supabase::SupabaseBlobStore;

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Removing a missing object is not an error.
    async fn remove(&self, bucket: &str, key: &str) -> Result<()>;

    /// Deterministic public URL for `bucket` + `key`.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Reduce a file name to a storage-safe key segment, keeping its extension.
pub fn sanitize_file_name(name: &str) -> String {
    let name = name.trim();
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (stem, Some(ext.to_ascii_lowercase()))
        }
        _ => (name, None),
    };

    let mut safe = String::with_capacity(stem.len());
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            safe.push(ch);
        } else if !safe.ends_with('_') {
            safe.push('_');
        }
    }
    let safe = safe.trim_matches(|c| c == '_' || c == '-');
    let stem = if safe.is_empty() { "file" } else { safe };

    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

/// Reject keys that could leave the bucket.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(ReconcileError::Blob(format!("invalid object key: {key:?}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_ascii_names() {
        assert_eq!(sanitize_file_name("Zhukov_Ostrov.fb2"), "Zhukov_Ostrov.fb2");
        assert_eq!(sanitize_file_name("my book (2).fb2.zip"), "my_book_2_fb2.zip");
    }

    #[test]
    fn sanitize_collapses_non_ascii_names() {
        assert_eq!(sanitize_file_name("Жуков - Остров.FB2"), "file.fb2");
        assert_eq!(sanitize_file_name("Остров"), "file");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[test]
    fn keys_must_stay_inside_bucket() {
        assert!(validate_key("books/1/a.fb2").is_ok());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }
}
