//! Per-session scratch directories.
//!
//! Every session gets `<root>/<id>/workspace` (the agent's working
//! directory) and `<root>/<id>/artifacts` (extra directory handed to the
//! agent for outputs).

use std::path::{Path, PathBuf};

use sw_domain::error::Result;

#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Create (or re-create) the directories for `session_id`.
    /// Returns `(working_dir, artifacts_dir)`.
    pub fn provision(&self, session_id: &str) -> Result<(PathBuf, PathBuf)> {
        let base = self.session_dir(session_id);
        let working = base.join("workspace");
        let artifacts = base.join("artifacts");
        std::fs::create_dir_all(&working)?;
        std::fs::create_dir_all(&artifacts)?;
        Ok((working, artifacts))
    }

    /// Remove everything under the session's directory. Missing is fine.
    pub fn remove(&self, session_id: &str) -> Result<()> {
        let base = self.session_dir(session_id);
        match std::fs::remove_dir_all(&base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let (work, art) = scratch.provision("abc").unwrap();
        assert!(work.is_dir());
        assert!(art.is_dir());
        assert!(work.starts_with(dir.path().join("abc")));

        std::fs::write(work.join("notes.md"), "x").unwrap();
        scratch.remove("abc").unwrap();
        assert!(!dir.path().join("abc").exists());
        // Second removal is a no-op.
        scratch.remove("abc").unwrap();
    }
}
