//! Domain model module declarations.

pub mod ledger_event;
pub mod session_account;
pub mod usage;
pub mod work_item;

pub use ledger_event::{LedgerEvent, LedgerEventKind};
pub use session_account::{AccountStatus, SessionAccount};
pub use usage::Usage;
pub use work_item::{WorkItem, WorkResult, WorkStatus};
