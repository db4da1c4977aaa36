//! Turning a session's scratch workspace into a standalone repository.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use sw_domain::config::PromotionConfig;
use sw_domain::error::{Error, Result};

/// Creates the repository a promoted session continues in.
#[async_trait]
pub trait RepoMaterializer: Send + Sync {
    /// Materialize `source` as a new repository called `name` and return
    /// its path.
    async fn materialize(&self, source: &Path, name: &str) -> Result<PathBuf>;
}

/// Copies the workspace under `repos_root/<slug>` and optionally runs
/// `git init` there.
pub struct LocalRepoMaterializer {
    repos_root: PathBuf,
    git_init: bool,
}

impl LocalRepoMaterializer {
    pub fn new(config: &PromotionConfig) -> Self {
        Self {
            repos_root: config.repos_root.clone(),
            git_init: config.git_init,
        }
    }
}

#[async_trait]
impl RepoMaterializer for LocalRepoMaterializer {
    async fn materialize(&self, source: &Path, name: &str) -> Result<PathBuf> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(Error::EmptyInput(format!(
                "repository name {name:?} has no usable characters"
            )));
        }
        let dest = self.repos_root.join(&slug);
        if tokio::fs::try_exists(&dest).await? {
            return Err(Error::Conflict(format!(
                "repository {} already exists",
                dest.display()
            )));
        }

        tokio::fs::create_dir_all(&self.repos_root).await?;
        if tokio::fs::try_exists(source).await? {
            copy_dir_recursive(source, &dest).await?;
        } else {
            tokio::fs::create_dir_all(&dest).await?;
        }

        if self.git_init {
            git_init(&dest).await?;
        }

        tracing::info!(repo = %dest.display(), "repository materialized");
        Ok(dest)
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

// ── Private ──────────────────────────────────────────────────────────

async fn git_init(dir: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("init")
        .arg("--quiet")
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Other(format!("running git init: {e}")))?;
    if !output.status.success() {
        return Err(Error::Other(format!(
            "git init failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut rd = tokio::fs::read_dir(src).await?;
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            let from = entry.path();
            let to = dst.join(entry.file_name());
            if ft.is_dir() {
                copy_dir_recursive(&from, &to).await?;
            } else if ft.is_file() {
                tokio::fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(slugify("My Parser Idea!"), "my-parser-idea");
        assert_eq!(slugify("  --weird__name--  "), "weird-name");
        assert_eq!(slugify("???"), "");
    }

    #[tokio::test]
    async fn copies_workspace_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("README.md"), "hello").unwrap();
        std::fs::write(src.join("nested/lib.rs"), "fn main() {}").unwrap();

        let m = LocalRepoMaterializer {
            repos_root: tmp.path().join("repos"),
            git_init: false,
        };
        let dest = m.materialize(&src, "Parser Idea").await.unwrap();
        assert_eq!(dest, tmp.path().join("repos/parser-idea"));
        assert_eq!(std::fs::read_to_string(dest.join("README.md")).unwrap(), "hello");
        assert!(dest.join("nested/lib.rs").is_file());

        let again = m.materialize(&src, "parser idea").await.unwrap_err();
        assert!(matches!(again, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_source_gives_empty_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let m = LocalRepoMaterializer {
            repos_root: tmp.path().join("repos"),
            git_init: false,
        };
        let dest = m
            .materialize(&tmp.path().join("nope"), "empty")
            .await
            .unwrap();
        assert!(dest.is_dir());
    }
}
