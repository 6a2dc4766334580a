use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vitabot_core::metadata::{read_data, without_data};
use vitabot_core::{BotIdentity, GitOperator, UpdateJob, UpdateResult, UpdateTarget, UpdateTask};

/// vita-bot: keep submodules and branches in sync with their upstream
#[derive(Parser, Debug)]
#[command(name = "vitabot")]
#[command(about = "Run vita-bot update tasks locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Move a submodule to the tip of its tracked branch and commit it
    UpdateSubmodule(UpdateSubmoduleArgs),
    /// Rebase (or fast-forward) a branch onto an upstream branch
    UpdateBranch(UpdateBranchArgs),
    /// Print the hidden metadata block of a pull-request body
    DecodeMetadata(DecodeMetadataArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Working copy directory; cloned into if it does not exist
    #[arg(long)]
    work_dir: PathBuf,

    /// URL of the repository the working copy is cloned from
    #[arg(long)]
    repo_url: String,

    /// Author and committer name
    #[arg(long, default_value = "vita-bot")]
    name: String,

    /// Author and committer email
    #[arg(long, default_value = "vita-bot@localhost")]
    email: String,

    /// Kill git commands running longer than this many seconds
    #[arg(long)]
    git_timeout_secs: Option<u64>,

    /// Allow submodules with local file URLs
    #[arg(long)]
    allow_file_protocol: bool,

    /// Push the result to this remote (URL or remote name)
    #[arg(long, requires = "push_branch")]
    push_to: Option<String>,

    /// Branch to push the result to
    #[arg(long, requires = "push_to")]
    push_branch: Option<String>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct UpdateSubmoduleArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Branch of the superproject to update
    #[arg(long, default_value = "master")]
    repo_branch: String,

    /// Path of the submodule in the superproject
    #[arg(long)]
    path: String,

    /// Branch of the submodule's origin to follow
    #[arg(long, default_value = "master")]
    tracked_branch: String,
}

#[derive(Args, Debug)]
struct UpdateBranchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Branch to update
    #[arg(long)]
    local_branch: String,

    /// Repository to take updates from
    #[arg(long)]
    upstream_url: String,

    /// Branch of the upstream repository to follow
    #[arg(long, default_value = "master")]
    upstream_branch: String,

    /// Refuse to rebase; only fast-forward
    #[arg(long)]
    fast_forward_only: bool,

    /// Tag to create after a successful update ({date} and {short} are expanded)
    #[arg(long)]
    tag_pattern: Option<String>,
}

#[derive(Args, Debug)]
struct DecodeMetadataArgs {
    /// File holding the body; reads stdin when omitted
    file: Option<PathBuf>,

    /// Also print the body without the metadata block
    #[arg(long)]
    show_body: bool,
}

fn operator(common: &CommonArgs) -> GitOperator {
    let operator = GitOperator::new(
        &common.work_dir,
        BotIdentity::new(&common.name, &common.email, &common.name),
    )
    .with_timeout(common.git_timeout_secs.map(Duration::from_secs));
    if common.allow_file_protocol {
        operator.with_config("protocol.file.allow", "always")
    } else {
        operator
    }
}

fn run_update(common: &CommonArgs, repo_branch: &str, target: UpdateTarget) -> Result<()> {
    let mut job = UpdateJob::new(operator(common), &common.repo_url, repo_branch, &target);
    let result = job
        .perform_update()
        .with_context(|| format!("Failed to update {}", target.metadata().describe()))?;

    if common.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if let (Some(remote), Some(branch)) = (&common.push_to, &common.push_branch) {
        if !result.success {
            bail!("Nothing to push: the update did not produce a change");
        }
        job.push_branch(remote, branch)
            .with_context(|| format!("Failed to push to {}", branch))?;
        info!("Pushed {} to {}", job.path().display(), branch);
    }
    Ok(())
}

fn print_summary(result: &UpdateResult) {
    let report = &result.report;
    if result.success {
        println!(
            "{}: {} -> {}",
            report.title(),
            result.before_head.short_hash(),
            result.after_head.short_hash()
        );
        if let Some(tag) = &result.tag {
            println!("Tagged {}", tag);
        }
        println!();
        println!("{}", report.commit_message());
    } else if result.conflicted() {
        println!("{}", report.conflict_comment());
    } else if let Some(rebase) = result.rebase.as_ref().filter(|r| !r.success) {
        println!("{} not updated: {}", report.target.describe(), rebase.message);
    } else {
        println!("{} is up to date", report.target.describe());
    }
}

fn run_decode(args: DecodeMetadataArgs) -> Result<()> {
    let body = match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut body = String::new();
            io::stdin()
                .read_to_string(&mut body)
                .context("Failed to read stdin")?;
            body
        }
    };

    match read_data::<serde_json::Value>(&body)? {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("No metadata block found"),
    }
    if args.show_body {
        println!();
        print!("{}", without_data(&body));
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::UpdateSubmodule(args) => run_update(
            &args.common,
            &args.repo_branch,
            UpdateTarget::Submodule {
                path: args.path.clone(),
                tracked_branch: args.tracked_branch.clone(),
            },
        ),
        Commands::UpdateBranch(args) => run_update(
            &args.common,
            &args.local_branch,
            UpdateTarget::Branch {
                upstream_url: args.upstream_url.clone(),
                upstream_branch: args.upstream_branch.clone(),
                local_branch: args.local_branch.clone(),
                fast_forward_only: args.fast_forward_only,
                tag_pattern: args.tag_pattern.clone(),
            },
        ),
        Commands::DecodeMetadata(args) => run_decode(args),
    }
}
