//! Git-level engine of the maintenance bot: the version-control operator,
//! submodule and branch update tasks, their reports, and the hidden metadata
//! that ties pull requests to tasks.

pub mod error;
pub mod git;
pub mod identity;
pub mod metadata;
pub mod report;
pub mod update;

pub use error::{GitError, UpdateError};
pub use git::{CommitSnapshot, GitOperator, RebaseOutcome};
pub use identity::BotIdentity;
pub use metadata::{MetadataError, TaskMetadata};
pub use report::{UpdateKind, UpdateReport};
pub use update::{UpdateJob, UpdateResult, UpdateTarget, UpdateTask};
