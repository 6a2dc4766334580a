use std::path::Path;

use vitabot_core::BotIdentity;
use vitabot_server::fake::FakeGitHub;
use vitabot_server::resolver::{ForkResolver, ResolveError};

const ROOT: &str = "/var/lib/vita-bot";

fn bot() -> BotIdentity {
    BotIdentity::new("Vita Bot", "bot@example.org", "vita-bot")
}

async fn hosting() -> FakeGitHub {
    let github = FakeGitHub::new();
    github
        .add_repository("smarr", "SOMns", "https://github.com/smarr/SOMns.git")
        .await;
    github
}

#[tokio::test]
async fn test_creates_fork_when_none_exists() {
    let github = hosting().await;
    let target = github.api("smarr");
    let own = github.api("vita-bot");
    let bot = bot();

    let wc = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("smarr", "SOMns")
        .await
        .unwrap();

    assert!(!wc.existing_fork);
    assert_eq!(wc.remote_owner, "vita-bot");
    assert_eq!(wc.remote_repo, "SOMns");
    assert_eq!(wc.clone_url, "https://github.com/vita-bot/SOMns.git");
    assert_eq!(wc.push_url, wc.clone_url);
    assert_eq!(wc.path, Path::new(ROOT).join("smarr").join("SOMns"));

    let fork = github.repository("vita-bot", "SOMns").await.unwrap();
    assert!(fork.is_fork_of("smarr", "SOMns"));
}

#[tokio::test]
async fn test_reuses_existing_fork() {
    let github = hosting().await;
    github
        .add_fork("vita-bot", "SOMns", "smarr", "SOMns", "https://example.org/fork.git")
        .await
        .unwrap();
    let target = github.api("smarr");
    let own = github.api("vita-bot");
    let bot = bot();

    let wc = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("smarr", "SOMns")
        .await
        .unwrap();

    assert!(wc.existing_fork);
    assert_eq!(wc.remote_repo, "SOMns");
    assert_eq!(wc.clone_url, "https://example.org/fork.git");
}

#[tokio::test]
async fn test_name_clash_creates_renamed_fork() {
    let github = hosting().await;
    github
        .add_repository("vita-bot", "SOMns", "https://github.com/vita-bot/SOMns.git")
        .await;
    let target = github.api("smarr");
    let own = github.api("vita-bot");
    let bot = bot();

    let wc = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("smarr", "SOMns")
        .await
        .unwrap();

    assert!(!wc.existing_fork);
    assert_eq!(wc.remote_repo, "SOMns-1");
    assert_eq!(wc.clone_url, "https://github.com/vita-bot/SOMns-1.git");
    // The working copy is named after the target, not the fork.
    assert_eq!(wc.path, Path::new(ROOT).join("smarr").join("SOMns"));
}

#[tokio::test]
async fn test_name_clash_reuses_renamed_fork() {
    let github = hosting().await;
    github
        .add_repository("other", "SOMns", "https://github.com/other/SOMns.git")
        .await;
    github
        .add_repository("vita-bot", "SOMns", "https://github.com/vita-bot/SOMns.git")
        .await;
    github
        .add_fork("vita-bot", "SOMns-0", "other", "SOMns", "https://example.org/wrong.git")
        .await
        .unwrap();
    github
        .add_fork("vita-bot", "SOMns-1", "smarr", "SOMns", "https://example.org/right.git")
        .await
        .unwrap();
    let target = github.api("smarr");
    let own = github.api("vita-bot");
    let bot = bot();

    let wc = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("smarr", "SOMns")
        .await
        .unwrap();

    assert!(wc.existing_fork);
    assert_eq!(wc.remote_repo, "SOMns-1");
    assert_eq!(wc.clone_url, "https://example.org/right.git");
    assert!(github.repository("vita-bot", "SOMns-2").await.is_none());
}

#[tokio::test]
async fn test_target_that_is_a_fork_uses_its_source() {
    let github = hosting().await;
    github
        .add_fork("alice", "SOMns", "smarr", "SOMns", "https://github.com/alice/SOMns.git")
        .await
        .unwrap();
    github
        .add_fork("vita-bot", "SOMns", "smarr", "SOMns", "https://example.org/fork.git")
        .await
        .unwrap();
    let target = github.api("alice");
    let own = github.api("vita-bot");
    let bot = bot();

    let wc = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("alice", "SOMns")
        .await
        .unwrap();

    assert!(wc.existing_fork);
    assert_eq!(wc.clone_url, "https://example.org/fork.git");
    assert_eq!(wc.path, Path::new(ROOT).join("alice").join("SOMns"));
}

#[tokio::test]
async fn test_missing_target_is_not_found() {
    let github = hosting().await;
    let target = github.api("smarr");
    let own = github.api("vita-bot");
    let bot = bot();

    let err = ForkResolver::new(&target, &own, &bot, Path::new(ROOT))
        .resolve("smarr", "nope")
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::RepositoryNotFound { .. }));
    assert_eq!(err.to_string(), "Requested repository not found: smarr/nope");
}
