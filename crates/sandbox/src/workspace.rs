use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::SessionId;
use crate::error::Result;

pub const WORKSPACE_DIR_NAME: &str = "code_interpreter_workspace";

/// Working directory shared by every kernel a `CodeInterpreter` spawns.
/// Created once and never removed while the process runs.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn in_current_dir() -> Result<Self> {
        Self::create(env::current_dir()?.join(WORKSPACE_DIR_NAME))
    }

    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "workspace ready");
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn connection_file(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(format!("kernel_{session_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(WORKSPACE_DIR_NAME);
        let first = Workspace::create(&root).unwrap();
        fs::write(root.join("keep.txt"), "x").unwrap();
        let second = Workspace::create(&root).unwrap();
        assert_eq!(first.path(), second.path());
        assert!(root.join("keep.txt").exists());
    }

    #[test]
    fn test_connection_file_is_named_after_session() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let id = SessionId::derive("abc", 7);
        let path = workspace.connection_file(&id);
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some(format!("kernel_abc_{}_7.json", std::process::id()).as_str())
        );
    }
}
