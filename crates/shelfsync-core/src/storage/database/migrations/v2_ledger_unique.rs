use rusqlite::Connection;

use super::Migration;
use crate::error::Result;

pub struct V2LedgerUnique;

impl Migration for V2LedgerUnique {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "Make processed_messages unique per source file and per book"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        // Earlier ledgers could hold the same file or book twice; keep the
        // first entry of each before the unique indexes go on.
        conn.execute_batch(
            "
            DELETE FROM processed_messages
             WHERE rowid NOT IN (
                SELECT MIN(rowid) FROM processed_messages GROUP BY source_file_id
             );
            DELETE FROM processed_messages
             WHERE rowid NOT IN (
                SELECT MIN(rowid) FROM processed_messages GROUP BY book_id
             );
            CREATE UNIQUE INDEX IF NOT EXISTS uq_ledger_source_file ON processed_messages(source_file_id);
            CREATE UNIQUE INDEX IF NOT EXISTS uq_ledger_book        ON processed_messages(book_id);
            ",
        )?;
        Ok(())
    }
}
