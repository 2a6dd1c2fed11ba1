//! Git-backed mirror repositories.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{AppError, Result};
use crate::models::{MirrorConfig, MirrorTarget};
use crate::utils::url;

/// A destination repository that can be checked out and pushed to.
#[async_trait]
pub trait MirrorRemote: Send + Sync {
    /// Materialize the destination's current tree into `dir`.
    async fn checkout(&self, target: &MirrorTarget, dir: &Path) -> Result<()>;

    /// Commit every change under `dir` and push it to the destination.
    async fn publish(&self, target: &MirrorTarget, dir: &Path, message: &str) -> Result<()>;
}

/// Drives the `git` binary with a shallow clone per run.
#[derive(Debug, Clone)]
pub struct GitRemote {
    branch: String,
    author_name: String,
    author_email: String,
}

impl GitRemote {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            branch: config.branch.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    async fn git(&self, target: &MirrorTarget, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = cmd.output().await?;
        let label = subcommand(args);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::git(label, scrub(target, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The git subcommand in `args`, skipping `-c key=value` pairs and other global flags.
fn subcommand<'a>(args: &[&'a str]) -> &'a str {
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        if arg == "-c" {
            iter.next();
        } else if !arg.starts_with('-') {
            return arg;
        }
    }
    "git"
}

/// Remove the destination token from git output before it reaches logs.
fn scrub(target: &MirrorTarget, text: &str) -> String {
    match target.token.as_deref() {
        Some(token) if !token.is_empty() => text.replace(token, "***"),
        _ => text.to_string(),
    }
}

#[async_trait]
impl MirrorRemote for GitRemote {
    async fn checkout(&self, target: &MirrorTarget, dir: &Path) -> Result<()> {
        let remote = url::with_token(&target.url, target.token.as_deref())?;
        let dir_str = dir.to_string_lossy();

        let shallow = self
            .git(
                target,
                None,
                &["clone", "--depth", "1", "--branch", &self.branch, &remote, &dir_str],
            )
            .await;

        if let Err(e) = shallow {
            // Brand-new destinations have no branch yet.
            log::warn!(
                "Clone of {} branch {} failed ({}); retrying without branch",
                url::redact(&target.url),
                self.branch,
                e
            );
            if dir.exists() {
                tokio::fs::remove_dir_all(dir).await?;
            }
            self.git(target, None, &["clone", "--depth", "1", &remote, &dir_str])
                .await?;
            self.git(target, Some(dir), &["checkout", "-B", &self.branch])
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, target: &MirrorTarget, dir: &Path, message: &str) -> Result<()> {
        let user_name = format!("user.name={}", self.author_name);
        let user_email = format!("user.email={}", self.author_email);
        let refspec = format!("HEAD:{}", self.branch);

        self.git(target, Some(dir), &["add", "-A"]).await?;
        self.git(
            target,
            Some(dir),
            &["-c", &user_name, "-c", &user_email, "commit", "-q", "-m", message],
        )
        .await?;
        self.git(target, Some(dir), &["push", "origin", &refspec])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MirrorMode;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[test]
    fn scrub_hides_token() {
        let target = MirrorTarget::new("m", "https://x/y.git", MirrorMode::Full, Some("tok123".into()));
        assert_eq!(
            scrub(&target, "fatal: https://x-access-token:tok123@x/y.git denied"),
            "fatal: https://x-access-token:***@x/y.git denied"
        );
    }

    #[test]
    fn error_label_is_the_subcommand() {
        assert_eq!(
            subcommand(&["-c", "user.name=a", "-c", "user.email=b", "commit", "-q", "-m", "x"]),
            "commit"
        );
        assert_eq!(subcommand(&["push", "origin", "HEAD:main"]), "push");
        assert_eq!(subcommand(&[]), "git");
    }

    #[tokio::test]
    async fn publish_then_checkout_against_local_bare_repo() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let bare = tmp.path().join("remote.git");
        let status = std::process::Command::new("git")
            .args(["init", "--bare", "-q"])
            .arg(&bare)
            .status()
            .unwrap();
        assert!(status.success());

        let remote = GitRemote::new(&MirrorConfig::default());
        let target = MirrorTarget::new(
            "local",
            bare.to_string_lossy(),
            MirrorMode::Full,
            None,
        );

        let work = tmp.path().join("work");
        remote.checkout(&target, &work).await.unwrap();
        std::fs::write(work.join("index.json"), "{}").unwrap();
        remote.publish(&target, &work, "Sync anime data").await.unwrap();

        let again = tmp.path().join("again");
        remote.checkout(&target, &again).await.unwrap();
        assert!(again.join("index.json").exists());
    }
}
