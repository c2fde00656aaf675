use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize;

/// A cataloged work. Identity is the normalized (title, author) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: Uuid,
    pub title: String,
    pub author: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub cover_urls: Vec<String>,

    #[serde(default)]
    pub genres: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// All file columns travel together: a record has either none or all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileAttachment>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogRecord {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            author: author.into(),
            series: None,
            publication_year: None,
            rating: None,
            description: None,
            cover_urls: Vec::new(),
            genres: Vec::new(),
            tags: Vec::new(),
            file: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity_key(&self) -> (String, String) {
        normalize::identity_key(&self.title, &self.author)
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

/// The downloadable asset attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub file_url: String,
    pub file_size: u64,
    pub file_format: FileFormat,
    /// Identifier of the channel file this asset was downloaded from.
    pub source_file_id: String,
    /// Object key inside the blob store bucket.
    pub storage_path: String,
}

/// Formats accepted for attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Fb2,
    Zip,
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fb2 => write!(f, "fb2"),
            Self::Zip => write!(f, "zip"),
        }
    }
}

impl std::str::FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fb2" => Ok(Self::Fb2),
            "zip" => Ok(Self::Zip),
            _ => Err(format!("Unsupported file format: {s}")),
        }
    }
}

impl FileFormat {
    /// Format of a file judged by its last extension; `book.fb2.zip` is a zip.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Fb2 => "application/x-fictionbook+xml",
            Self::Zip => "application/zip",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_format_from_file_name() {
        assert_eq!(FileFormat::from_file_name("book.fb2"), Some(FileFormat::Fb2));
        assert_eq!(FileFormat::from_file_name("book.FB2.ZIP"), Some(FileFormat::Zip));
        assert_eq!(FileFormat::from_file_name("book.epub"), None);
        assert_eq!(FileFormat::from_file_name("no_extension"), None);
    }

    #[test]
    fn test_new_record_has_no_file() {
        let record = CatalogRecord::new("Остров", "Жуков");
        assert!(!record.has_file());
        assert_eq!(record.identity_key(), ("остров".to_string(), "жуков".to_string()));
    }
}
