//! Version-control gateway over a git working tree.
//!
//! The gateway knows nothing about sessions or events. It stages the files it
//! is given, writes a commit when the staged tree differs from HEAD and
//! returns the short id.
//!
//! The repository is opened per operation; callers serialize access (see the
//! commit engine), so there is no long-lived handle to share across threads.

use git2::{IndexAddOption, Oid, Repository, Signature};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::config::CommitConfig;
use crate::error::CommitError;

/// Abbreviated commit hash.
pub type CommitId = String;

const SHORT_ID_LEN: usize = 7;
pub const GITIGNORE: &str = ".gitignore";

const DEFAULT_GITIGNORE: &str = r#"# Chronicle runtime state (not content)
.chronicle/

# OS files
.DS_Store
Thumbs.db

# Editor backups
*~
*.swp
*.swo

# Temporary files
*.tmp
*.temp
"#;

pub trait VcsGateway: Send + Sync {
    fn workspace(&self) -> &Path;

    /// Initializes the repository and default `.gitignore` if missing.
    /// Returns true when a repository was created.
    fn ensure_repository(&self) -> Result<bool, CommitError>;

    /// Stages exactly `files` and commits. `Ok(None)` when nothing changed.
    fn commit_files(&self, files: &[PathBuf], message: &str) -> Result<Option<CommitId>, CommitError>;

    /// Stages every modified, new or deleted file and commits.
    fn commit_all(&self, message: &str) -> Result<Option<CommitId>, CommitError>;
}

pub struct GitGateway {
    workspace: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitGateway {
    pub fn new(workspace: impl Into<PathBuf>, config: &CommitConfig) -> Self {
        Self {
            workspace: workspace.into(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    fn open(&self) -> Result<Repository, CommitError> {
        if !self.workspace.join(".git").exists() {
            return Err(CommitError::RepoNotFound(self.workspace.clone()));
        }
        Ok(Repository::open(&self.workspace)?)
    }

    fn relative(&self, file: &Path) -> Result<PathBuf, CommitError> {
        let relative = if file.is_absolute() {
            file.strip_prefix(&self.workspace)
                .map_err(|_| CommitError::OutsideWorkspace(file.to_path_buf()))?
                .to_path_buf()
        } else {
            file.to_path_buf()
        };
        if relative.components().any(|part| matches!(part, Component::ParentDir)) {
            return Err(CommitError::OutsideWorkspace(file.to_path_buf()));
        }
        Ok(relative)
    }

    fn write_commit(
        &self,
        repo: &Repository,
        index: &mut git2::Index,
        message: &str,
    ) -> Result<Option<CommitId>, CommitError> {
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            debug!(message = %message, "Nothing staged; skipping commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now(&self.author_name, &self.author_email)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

        let short_id = short_id(oid);
        info!(commit = %short_id, message = %message, "Created commit");
        Ok(Some(short_id))
    }
}

impl VcsGateway for GitGateway {
    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn ensure_repository(&self) -> Result<bool, CommitError> {
        let created = if self.workspace.join(".git").exists() {
            false
        } else {
            Repository::init(&self.workspace)?;
            info!(workspace = %self.workspace.display(), "Initialized git repository");
            true
        };

        let gitignore = self.workspace.join(GITIGNORE);
        if !gitignore.exists() {
            fs_err::write(&gitignore, DEFAULT_GITIGNORE).map_err(|source| CommitError::Io {
                context: format!("writing {}", gitignore.display()),
                source,
            })?;
            debug!(path = %gitignore.display(), "Wrote default .gitignore");
        }
        Ok(created)
    }

    fn commit_files(&self, files: &[PathBuf], message: &str) -> Result<Option<CommitId>, CommitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;

        for file in files {
            let relative = self.relative(file)?;
            if self.workspace.join(&relative).exists() {
                index.add_path(&relative)?;
                debug!(path = %relative.display(), "Staged");
            } else if index.get_path(&relative, 0).is_some() {
                index.remove_path(&relative)?;
                debug!(path = %relative.display(), "Staged deletion");
            } else {
                debug!(path = %relative.display(), "Missing file skipped");
            }
        }

        self.write_commit(&repo, &mut index, message)
    }

    fn commit_all(&self, message: &str) -> Result<Option<CommitId>, CommitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        self.write_commit(&repo, &mut index, message)
    }
}

fn short_id(oid: Oid) -> CommitId {
    let full = oid.to_string();
    full[..SHORT_ID_LEN.min(full.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::StatusOptions;

    /// Modified, new or deleted files git still reports after a commit.
    fn pending_files(gateway: &GitGateway) -> Vec<PathBuf> {
        let repo = Repository::open(gateway.workspace()).expect("open");
        let mut options = StatusOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut options)).expect("status");
        statuses
            .iter()
            .filter(|entry| !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(|path| gateway.workspace().join(path)))
            .collect()
    }

    fn gateway() -> (tempfile::TempDir, GitGateway) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let gateway = GitGateway::new(temp_dir.path(), &CommitConfig::default());
        gateway.ensure_repository().expect("init");
        gateway
            .commit_files(&[PathBuf::from(GITIGNORE)], "init: workspace")
            .expect("init commit");
        (temp_dir, gateway)
    }

    fn head_message(workspace: &Path) -> String {
        let repo = Repository::open(workspace).expect("open");
        let head = repo.head().expect("head").peel_to_commit().expect("commit");
        head.message().unwrap_or_default().to_string()
    }

    #[test]
    fn ensure_repository_writes_gitignore_once() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let gateway = GitGateway::new(temp_dir.path(), &CommitConfig::default());
        assert!(gateway.ensure_repository().expect("init"));
        assert!(temp_dir.path().join(".gitignore").exists());
        assert!(!gateway.ensure_repository().expect("reopen"));
    }

    #[test]
    fn commits_listed_files_with_short_id() {
        let (temp_dir, gateway) = gateway();
        let note = temp_dir.path().join("test-note.md");
        fs_err::write(&note, "# Test Note\n\nSome content").expect("write");

        let id = gateway
            .commit_files(&[note.clone()], "session: Test Note (5m)")
            .expect("commit")
            .expect("changes");
        assert_eq!(id.len(), 7);
        assert_eq!(head_message(temp_dir.path()), "session: Test Note (5m)");

        let again = gateway
            .commit_files(&[note], "session: Test Note (5m)")
            .expect("commit");
        assert_eq!(again, None);
    }

    #[test]
    fn missing_files_are_skipped() {
        let (temp_dir, gateway) = gateway();
        let note = temp_dir.path().join("a.md");
        fs_err::write(&note, "# A").expect("write");
        let missing = temp_dir.path().join(".meta/a.json");

        let id = gateway
            .commit_files(&[note, missing], "session: A (0m)")
            .expect("commit");
        assert!(id.is_some());
    }

    #[test]
    fn only_listed_files_are_staged() {
        let (temp_dir, gateway) = gateway();
        let note = temp_dir.path().join("a.md");
        let other = temp_dir.path().join("b.md");
        fs_err::write(&note, "# A").expect("write");
        fs_err::write(&other, "# B").expect("write");

        gateway
            .commit_files(&[note], "session: A (1m)")
            .expect("commit");
        let pending = pending_files(&gateway);
        assert_eq!(pending, vec![other]);
    }

    #[test]
    fn deleted_tracked_file_is_staged_as_removal() {
        let (temp_dir, gateway) = gateway();
        let note = temp_dir.path().join("a.md");
        fs_err::write(&note, "# A").expect("write");
        gateway.commit_files(&[note.clone()], "session: A (1m)").expect("commit");

        fs_err::remove_file(&note).expect("delete");
        let id = gateway.commit_files(&[note], "annotate: A (+1)").expect("commit");
        assert!(id.is_some());
        assert!(pending_files(&gateway).is_empty());
    }

    #[test]
    fn commit_all_picks_up_everything() {
        let (temp_dir, gateway) = gateway();
        fs_err::create_dir_all(temp_dir.path().join("notes")).expect("mkdir");
        fs_err::write(temp_dir.path().join("notes/a.md"), "# A").expect("write");
        fs_err::write(temp_dir.path().join("b.md"), "# B").expect("write");

        let id = gateway.commit_all("snapshot: before trip").expect("commit");
        assert!(id.is_some());
        assert!(pending_files(&gateway).is_empty());
        assert_eq!(gateway.commit_all("snapshot: again").expect("noop"), None);
    }

    #[test]
    fn rejects_files_outside_workspace() {
        let (_temp_dir, gateway) = gateway();
        let err = gateway
            .commit_files(&[PathBuf::from("/definitely/elsewhere.md")], "session: x (1m)")
            .expect_err("outside");
        assert!(matches!(err, CommitError::OutsideWorkspace(_)));
    }

    #[test]
    fn commit_without_repository_fails() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let gateway = GitGateway::new(temp_dir.path(), &CommitConfig::default());
        let err = gateway.commit_all("snapshot: x").expect_err("no repo");
        assert!(matches!(err, CommitError::RepoNotFound(_)));
    }
}
