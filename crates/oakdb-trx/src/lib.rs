//! Transactions, undo logging, MVCC, and purge.
//!
//! Transaction ids come from an atomic counter persisted with a safety
//! margin. Every clustered-index mutation first writes an undo record in
//! the same mini-transaction; roll pointers chain versions together for
//! consistent reads and rollback. Committed update-undo logs form the
//! per-rollback-segment history lists that the purge worker drains once
//! no read view can see them.

pub mod mvcc;
pub mod purge;
pub mod read_view;
pub mod trx;
pub mod undo;

pub use mvcc::{prev_version, visible_version, OldVersion};
pub use purge::PurgeApplier;
pub use read_view::ReadView;
pub use trx::{Trx, TrxState, TrxSys, UndoHandle, ViewHandle, TRX_SYS_PAGE};
pub use undo::{UndoKind, UndoRec, UndoRecType, UndoState};
