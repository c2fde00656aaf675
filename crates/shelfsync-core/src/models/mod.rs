pub mod ledger;
pub mod record;
pub mod task;

pub use ledger::*;
pub use record::*;
pub use task::*;
