use std::str::FromStr;
use std::sync::MutexGuard;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{CatalogRecord, FileAttachment, FileFormat};
use crate::normalize;
use crate::storage::{from_sql_ts, from_sql_uuid, to_sql_ts};

use super::Repository;

pub trait RecordRepository: Repository<Entity = CatalogRecord, Id = Uuid> {
    /// All records sharing the normalized identity, newest first.
    fn find_by_identity(&self, title: &str, author: &str) -> Result<Vec<CatalogRecord>>;
    /// Records whose title or author contains any of the terms, most terms hit first.
    fn search_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<CatalogRecord>>;
    /// Attach a file only if the record has none yet. Returns whether it was attached.
    fn attach_file(&self, id: &Uuid, file: &FileAttachment) -> Result<bool>;
    /// Write the record's descriptive metadata into columns that are still empty.
    /// Identity and file columns are left alone. Returns whether the row exists.
    fn fill_metadata(&self, record: &CatalogRecord) -> Result<bool>;
    fn delete_many(&self, ids: &[Uuid]) -> Result<usize>;
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<CatalogRecord>>;
    fn count(&self) -> Result<usize>;
    fn count_with_files(&self) -> Result<usize>;
}

pub struct SqliteRecordRepository<'a> {
    conn: MutexGuard<'a, Connection>,
}

const RECORD_COLUMNS: &str = "id, title, author, series, publication_year, rating, description,
     cover_urls, genres, tags, file_url, file_size, file_format, source_file_id,
     storage_path, created_at, updated_at";

impl<'a> SqliteRecordRepository<'a> {
    pub fn new(conn: MutexGuard<'a, Connection>) -> Self {
        Self { conn }
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<CatalogRecord> {
        let cover_urls: String = row.get(7)?;
        let genres: String = row.get(8)?;
        let tags: String = row.get(9)?;

        let file_url: Option<String> = row.get(10)?;
        let file_size: Option<i64> = row.get(11)?;
        let file_format: Option<String> = row.get(12)?;
        let source_file_id: Option<String> = row.get(13)?;
        let storage_path: Option<String> = row.get(14)?;

        let file = match (file_url, file_size, file_format, source_file_id, storage_path) {
            (Some(file_url), Some(size), Some(format), Some(source_file_id), Some(storage_path)) => {
                let file_format = FileFormat::from_str(&format).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(12, Type::Text, e.into())
                })?;
                Some(FileAttachment {
                    file_url,
                    file_size: size.max(0) as u64,
                    file_format,
                    source_file_id,
                    storage_path,
                })
            }
            _ => None,
        };

        Ok(CatalogRecord {
            id: from_sql_uuid(0, &row.get::<_, String>(0)?)?,
            title: row.get(1)?,
            author: row.get(2)?,
            series: row.get(3)?,
            publication_year: row.get(4)?,
            rating: row.get(5)?,
            description: row.get(6)?,
            cover_urls: serde_json::from_str(&cover_urls).unwrap_or_default(),
            genres: serde_json::from_str(&genres).unwrap_or_default(),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            file,
            created_at: from_sql_ts(15, &row.get::<_, String>(15)?)?,
            updated_at: from_sql_ts(16, &row.get::<_, String>(16)?)?,
        })
    }
}

impl<'a> Repository for SqliteRecordRepository<'a> {
    type Entity = CatalogRecord;
    type Id = Uuid;

    fn find_by_id(&self, id: &Self::Id) -> Result<Option<Self::Entity>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM catalog_records WHERE id = ?1");
        let record = self
            .conn
            .query_row(&sql, params![id.to_string()], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    fn save(&self, record: &Self::Entity) -> Result<()> {
        let (title_key, author_key) = record.identity_key();
        let file = record.file.as_ref();

        self.conn.execute(
            "INSERT INTO catalog_records
                (id, title, author, title_key, author_key, series, publication_year, rating,
                 description, cover_urls, genres, tags, file_url, file_size, file_format,
                 source_file_id, storage_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                title_key = excluded.title_key,
                author_key = excluded.author_key,
                series = excluded.series,
                publication_year = excluded.publication_year,
                rating = excluded.rating,
                description = excluded.description,
                cover_urls = excluded.cover_urls,
                genres = excluded.genres,
                tags = excluded.tags,
                file_url = excluded.file_url,
                file_size = excluded.file_size,
                file_format = excluded.file_format,
                source_file_id = excluded.source_file_id,
                storage_path = excluded.storage_path,
                updated_at = excluded.updated_at",
            params![
                record.id.to_string(),
                record.title,
                record.author,
                title_key,
                author_key,
                record.series,
                record.publication_year,
                record.rating,
                record.description,
                serde_json::to_string(&record.cover_urls)?,
                serde_json::to_string(&record.genres)?,
                serde_json::to_string(&record.tags)?,
                file.map(|f| f.file_url.as_str()),
                file.map(|f| f.file_size as i64),
                file.map(|f| f.file_format.to_string()),
                file.map(|f| f.source_file_id.as_str()),
                file.map(|f| f.storage_path.as_str()),
                to_sql_ts(&record.created_at),
                to_sql_ts(&record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &Self::Id) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM catalog_records WHERE id = ?1", params![id.to_string()])?;
        Ok(deleted > 0)
    }
}

impl<'a> RecordRepository for SqliteRecordRepository<'a> {
    fn find_by_identity(&self, title: &str, author: &str) -> Result<Vec<CatalogRecord>> {
        let (title_key, author_key) = normalize::identity_key(title, author);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM catalog_records
             WHERE title_key = ?1 AND author_key = ?2
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![title_key, author_key], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn search_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<CatalogRecord>> {
        let mut folded: Vec<String> = Vec::new();
        for term in terms {
            let term = normalize::fold(term);
            if !term.is_empty() && !folded.contains(&term) {
                folded.push(term);
            }
        }
        if folded.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        // Every term is searched; records hitting more terms come first.
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM (
                SELECT *, (
                    SELECT COUNT(*) FROM json_each(?1) AS term
                     WHERE instr(title_key, term.value) > 0 OR instr(author_key, term.value) > 0
                ) AS hits
                FROM catalog_records
             )
             WHERE hits > 0
             ORDER BY hits DESC, created_at DESC, id DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![serde_json::to_string(&folded)?, limit as i64],
                Self::row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn attach_file(&self, id: &Uuid, file: &FileAttachment) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE catalog_records
                SET file_url = ?2, file_size = ?3, file_format = ?4,
                    source_file_id = ?5, storage_path = ?6, updated_at = ?7
              WHERE id = ?1 AND file_url IS NULL",
            params![
                id.to_string(),
                file.file_url,
                file.file_size as i64,
                file.file_format.to_string(),
                file.source_file_id,
                file.storage_path,
                to_sql_ts(&Utc::now()),
            ],
        )?;
        Ok(updated > 0)
    }

    fn fill_metadata(&self, record: &CatalogRecord) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE catalog_records
                SET series = COALESCE(series, ?2),
                    publication_year = COALESCE(publication_year, ?3),
                    rating = COALESCE(rating, ?4),
                    description = CASE WHEN description IS NULL OR description = ''
                                       THEN ?5 ELSE description END,
                    cover_urls = CASE WHEN cover_urls = '[]' THEN ?6 ELSE cover_urls END,
                    genres = CASE WHEN genres = '[]' THEN ?7 ELSE genres END,
                    tags = CASE WHEN tags = '[]' THEN ?8 ELSE tags END,
                    updated_at = ?9
              WHERE id = ?1",
            params![
                record.id.to_string(),
                record.series,
                record.publication_year,
                record.rating,
                record.description,
                serde_json::to_string(&record.cover_urls)?,
                serde_json::to_string(&record.genres)?,
                serde_json::to_string(&record.tags)?,
                to_sql_ts(&record.updated_at),
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_many(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let deleted = self.conn.execute(
            "DELETE FROM catalog_records WHERE id IN (SELECT value FROM json_each(?1))",
            params![serde_json::to_string(&ids)?],
        )?;
        Ok(deleted)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<CatalogRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM catalog_records
             ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM catalog_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn count_with_files(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM catalog_records WHERE file_url IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
