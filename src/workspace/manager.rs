use std::path::{Component, Path, PathBuf};

use crate::config::WorkspaceConfig;
use crate::error::{AppError, Result};
use crate::platform::types::RepoInfo;
use crate::workflow::RunId;
use crate::workspace::git;

/// Manages one working copy per run under a base directory.
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

/// A checked-out working copy.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    /// Branch the run's branch was cut from; diffs are taken against it.
    pub base_branch: String,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
        }
    }

    /// Clean up an existing workspace directory and ensure its parent exists.
    async fn prepare_workspace_dir(path: &Path) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to clean workspace: {e}")))?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to create workspace dir: {e}")))?;
        }
        Ok(())
    }

    /// Open the run's working copy, cloning it first if it does not exist.
    ///
    /// A surviving working copy is reused as is so that a resumed run keeps
    /// its local commits.
    pub async fn setup_for_run(&self, repo: &RepoInfo, token: &str, run_id: &RunId) -> Result<Workspace> {
        let path = self.workspace_path(&repo.full_name, run_id);

        if git::is_repository(&path) {
            tracing::info!(run_id = %run_id, path = %path.display(), "Reusing workspace");
        } else {
            Self::prepare_workspace_dir(&path).await?;
            git::clone(&repo.clone_url, &path, token).await?;
            tracing::info!(run_id = %run_id, path = %path.display(), "Cloned workspace");
        }

        Ok(Workspace {
            path,
            base_branch: repo.default_branch.clone(),
        })
    }

    pub async fn cleanup(&self, workspace: &Workspace) -> Result<()> {
        if workspace.path.exists() {
            tokio::fs::remove_dir_all(&workspace.path)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to cleanup workspace: {e}")))?;
        }
        Ok(())
    }

    fn workspace_path(&self, repo_full_name: &str, run_id: &RunId) -> PathBuf {
        let safe_name = repo_full_name.replace('/', "__");
        self.base_dir.join(format!("{safe_name}__{run_id}"))
    }

    /// Verify a path is within the workspace (path traversal protection).
    ///
    /// The path is confined lexically before anything touches the disk, then
    /// resolved through symlinks and checked again.
    pub fn verify_path(workspace_root: &Path, requested_path: &Path) -> Result<PathBuf> {
        let full_path = workspace_root.join(confine(requested_path)?);

        // Canonicalize to resolve .. and symlinks.
        // A file that does not exist yet is resolved through its parent.
        let canonical = if full_path.exists() {
            full_path.canonicalize()
        } else {
            let parent = full_path
                .parent()
                .ok_or_else(|| AppError::Workspace("Invalid file path".to_string()))?;

            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Workspace(format!("Failed to create directory: {e}")))?;
            }

            let canonical_parent = parent
                .canonicalize()
                .map_err(|e| AppError::Workspace(format!("Failed to resolve path: {e}")))?;

            let file_name = full_path
                .file_name()
                .ok_or_else(|| AppError::Workspace("Invalid file name".to_string()))?;

            Ok(canonical_parent.join(file_name))
        }
        .map_err(|e| AppError::Workspace(format!("Failed to resolve path: {e}")))?;

        let canonical_root = workspace_root
            .canonicalize()
            .map_err(|e| AppError::Workspace(format!("Failed to resolve workspace root: {e}")))?;

        if !canonical.starts_with(&canonical_root) {
            return Err(AppError::Workspace(format!(
                "Path traversal detected: {} is outside workspace",
                requested_path.display()
            )));
        }

        Ok(canonical)
    }
}

/// Resolve `.` and `..` without touching the disk, rejecting anything that
/// leaves the root.
fn confine(requested: &Path) -> Result<PathBuf> {
    let traversal = || {
        AppError::Workspace(format!(
            "Path traversal detected: {} is outside workspace",
            requested.display()
        ))
    };
    let mut confined = PathBuf::new();
    for component in requested.components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !confined.pop() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    if confined.as_os_str().is_empty() {
        return Err(AppError::Workspace("Empty file path".to_string()));
    }
    Ok(confined)
}

impl Workspace {
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let full = WorkspaceManager::verify_path(&self.path, Path::new(path))?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| AppError::Workspace(format!("Failed to read {path}: {e}")))
    }

    /// Write `content` to `path`, or delete it when `content` is `None`.
    pub async fn write_file(&self, path: &str, content: Option<&str>) -> Result<()> {
        let full = WorkspaceManager::verify_path(&self.path, Path::new(path))?;
        match content {
            Some(content) => tokio::fs::write(&full, content)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to write {path}: {e}"))),
            None if full.exists() => tokio::fs::remove_file(&full)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to delete {path}: {e}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &Path) -> Workspace {
        Workspace {
            path: dir.to_path_buf(),
            base_branch: "main".to_string(),
        }
    }

    #[test]
    fn test_verify_path_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let result = WorkspaceManager::verify_path(tmp.path(), Path::new("../outside.txt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejected_path_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        std::fs::create_dir(&root).unwrap();

        let result = WorkspaceManager::verify_path(&root, Path::new("../escape/dir/file.rs"));
        assert!(result.is_err());
        assert!(!tmp.path().join("escape").exists());

        assert!(WorkspaceManager::verify_path(&root, Path::new("/etc/passwd")).is_err());
        assert!(WorkspaceManager::verify_path(&root, Path::new("./")).is_err());
    }

    #[test]
    fn test_inner_parent_dirs_stay_confined() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved =
            WorkspaceManager::verify_path(tmp.path(), Path::new("src/../docs/./notes.md")).unwrap();
        assert!(resolved.ends_with("docs/notes.md"));
        assert!(!tmp.path().join("src").exists());
    }

    #[test]
    fn test_verify_path_creates_parents_for_new_files() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved =
            WorkspaceManager::verify_path(tmp.path(), Path::new("src/deep/mod.rs")).unwrap();
        assert!(resolved.ends_with("src/deep/mod.rs"));
        assert!(tmp.path().join("src/deep").is_dir());
    }

    #[test]
    fn test_workspace_path_is_per_run() {
        let manager = WorkspaceManager::new(&WorkspaceConfig {
            base_dir: PathBuf::from("/var/hypha"),
        });
        let run_id = RunId::parse("0badcafe").unwrap();
        assert_eq!(
            manager.workspace_path("acme/widgets", &run_id),
            PathBuf::from("/var/hypha/acme__widgets__0badcafe")
        );
    }

    #[tokio::test]
    async fn test_write_read_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());

        ws.write_file("specs/plan.md", Some("# Plan\n")).await.unwrap();
        assert_eq!(ws.read_file("specs/plan.md").await.unwrap(), "# Plan\n");

        ws.write_file("specs/plan.md", None).await.unwrap();
        assert!(!tmp.path().join("specs/plan.md").exists());
        // Deleting twice is fine.
        ws.write_file("specs/plan.md", None).await.unwrap();
        assert!(ws.read_file("specs/plan.md").await.is_err());
    }

    #[tokio::test]
    async fn test_setup_reuses_existing_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(&WorkspaceConfig {
            base_dir: tmp.path().to_path_buf(),
        });
        let run_id = RunId::parse("12345678").unwrap();
        let path = manager.workspace_path("acme/widgets", &run_id);
        std::fs::create_dir_all(&path).unwrap();
        crate::workspace::git::tests::init_repo(&path);

        // The clone URL is never used because the checkout already exists.
        let repo = RepoInfo {
            full_name: "acme/widgets".to_string(),
            clone_url: "not-a-url".to_string(),
            default_branch: "main".to_string(),
        };
        let ws = manager.setup_for_run(&repo, "token", &run_id).await.unwrap();
        assert_eq!(ws.path, path);
        assert!(path.join("README.md").exists());
    }
}
