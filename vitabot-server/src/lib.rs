pub mod config;
pub mod fake;
pub mod github;
pub mod logging;
pub mod orchestrator;
pub mod reconcile;
pub mod remote;
pub mod resolver;
pub mod scheduler;

pub use config::{Config, ProjectConfig, ProjectConfigSource, StaticConfigSource};
pub use github::{GitHubClient, InstallationClient};
pub use orchestrator::{Orchestrator, RepositoryRun, TaskOutcome};
pub use reconcile::{Proposal, PullRequestRecord, ReconcileError, Reconciler};
pub use remote::{InstallationSource, RemoteRepositoryApi, RepositoryRef};
pub use resolver::{ForkResolver, ResolveError, WorkingCopy};
pub use scheduler::{InstallationRepositories, RateLimiter, Scheduler, SchedulerConfig};

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "vita-bot";
