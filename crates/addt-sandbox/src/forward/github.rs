//! GitHub token forwarding.

use addt_core::config::{GithubConfig, TokenSource};
use addt_core::SecretString;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, warn};

/// Token from `gh auth token`.
async fn gh_auth_token() -> Option<SecretString> {
    let output = match Command::new("gh").args(["auth", "token"]).output().await {
        Ok(output) => output,
        Err(e) => {
            warn!("GitHub token not forwarded: gh not available: {}", e);
            return None;
        }
    };
    if !output.status.success() {
        warn!("GitHub token not forwarded: `gh auth token` failed");
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then(|| SecretString::new(token))
}

/// Resolve the token to forward, if any.
pub async fn resolve_token(
    github: &GithubConfig,
    env_token: Option<&SecretString>,
) -> Option<SecretString> {
    if !github.forward_token {
        return None;
    }
    match github.token_source {
        TokenSource::Env => env_token.filter(|t| !t.is_empty()).cloned(),
        TokenSource::GhAuth => gh_auth_token().await,
    }
}

/// Plain environment describing token scoping.
pub fn scope_env(github: &GithubConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if github.scope_token && !github.scope_repos.is_empty() {
        debug!("Scoping GitHub token to {} repositories", github.scope_repos.len());
        env.insert(
            "ADDT_GITHUB_SCOPE_REPOS".to_string(),
            github.scope_repos.join(","),
        );
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use addt_core::EffectiveConfig;

    #[tokio::test]
    async fn test_env_token() {
        let mut github = EffectiveConfig::default().github;
        let token = SecretString::new("ghp_x");

        let resolved = resolve_token(&github, Some(&token)).await.unwrap();
        assert_eq!(resolved.expose_secret(), "ghp_x");
        assert!(resolve_token(&github, None).await.is_none());

        github.forward_token = false;
        assert!(resolve_token(&github, Some(&token)).await.is_none());
    }

    #[test]
    fn test_scope_env() {
        let mut github = EffectiveConfig::default().github;
        github.scope_repos = vec!["acme/api".to_string(), "acme/web".to_string()];
        assert!(scope_env(&github).is_empty());

        github.scope_token = true;
        assert_eq!(scope_env(&github)["ADDT_GITHUB_SCOPE_REPOS"], "acme/api,acme/web");
    }
}
