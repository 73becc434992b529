//! The commit engine and fence/transaction manager atop the content
//! tree (spec §4.6 "Commit Engine", §4.7 "Fence/Txn Manager").

mod commit;
mod manager;
mod op;

pub use commit::{Commit, ProcessResult};
pub use manager::{Fence, Manager};
pub use op::{normalize_key, Op, OpFlags};
