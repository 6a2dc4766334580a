use serde::{Deserialize, Serialize};

/// Who the bot is: the git author/committer identity and the account that
/// owns its forks. Loaded once at startup and passed to whoever needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    /// Author and committer name for git.
    pub display_name: String,
    /// Author and committer email for git.
    pub email: String,
    /// Account (user or organization) under which forks are created and
    /// pull requests are opened.
    pub account: String,
}

impl BotIdentity {
    pub fn new(
        display_name: impl Into<String>,
        email: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.into(),
            account: account.into(),
        }
    }
}
