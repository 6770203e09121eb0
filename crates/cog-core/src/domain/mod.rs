//! Domain model (ids, task documents, lifecycle state, results, partitions).
//!
//! ストアや実行環境に依存しない純粋な型と関数のみを置きます。

pub mod document;
pub mod errors;
pub mod ids;
pub mod partition;
pub mod results;
pub mod state;

pub use self::document::{TaskDocument, TransitionError, epoch_seconds};
pub use self::errors::{ErrorKind, StoreError};
pub use self::ids::{Revision, TaskId};
pub use self::partition::{PartitionMap, resolve as resolve_partition};
pub use self::results::{AttachLink, Attachment, TaskOutcome, TaskResults};
pub use self::state::{LifecycleState, UnknownState};
