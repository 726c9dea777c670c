//! Stores durables: messages archivés, journaux de modifications et
//! mises à jour parcellaires.

pub mod change_log;
pub mod messages;
pub mod update;

pub use change_log::{ChangeLog, Elem, PgChangeLog, WriteLog};
pub use messages::MessageStore;
pub use update::SeqRecordUpdate;
