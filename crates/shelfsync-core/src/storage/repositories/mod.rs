mod ledger_repository;
mod record_repository;
mod task_repository;

pub use ledger_repository::{LedgerRepository, SqliteLedgerRepository};
pub use record_repository::{RecordRepository, SqliteRecordRepository};
pub use task_repository::{SqliteTaskRepository, TaskRepository};

use crate::error::Result;

pub trait Repository {
    type Entity;
    type Id;

    fn find_by_id(&self, id: &Self::Id) -> Result<Option<Self::Entity>>;
    fn save(&self, entity: &Self::Entity) -> Result<()>;
    fn delete(&self, id: &Self::Id) -> Result<bool>;
}
