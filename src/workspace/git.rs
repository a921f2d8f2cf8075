use std::path::Path;

use git2::{
    build::RepoBuilder, BranchType, Cred, DiffFormat, FetchOptions, PushOptions,
    RemoteCallbacks, Repository, Signature,
};

use crate::error::{AppError, Result};

/// Validate a branch name to prevent argument injection.
/// Rejects names starting with `-` as defence in depth.
fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with('-') {
        return Err(AppError::Git(format!(
            "Invalid branch name (starts with '-'): {name}"
        )));
    }
    Ok(())
}

/// Build `FetchOptions` that authenticate via credential callback.
/// The token is captured by the closure and never written to disk.
fn make_fetch_options(token: &str) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

fn make_push_options(token: &str) -> PushOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

fn signature() -> Result<Signature<'static>> {
    Ok(Signature::now("Hypha Bot", "hypha[bot]@users.noreply.github.com")?)
}

pub fn is_repository(dir: &Path) -> bool {
    Repository::open(dir).is_ok()
}

/// Clone a repository into the target directory.
///
/// The remote URL stored in `.git/config` will be the **plain** URL
/// (no credentials). Authentication is handled via credential callback only.
pub async fn clone(url: &str, target: &Path, token: &str) -> Result<()> {
    if !url.starts_with("https://") {
        return Err(AppError::Git(format!(
            "Expected HTTPS clone URL, got: {url}"
        )));
    }

    let url = url.to_string();
    let target = target.to_path_buf();
    let token = token.to_string();

    tokio::task::spawn_blocking(move || {
        let fetch_opts = make_fetch_options(&token);
        RepoBuilder::new()
            .fetch_options(fetch_opts)
            .clone(&url, &target)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Clone task panicked: {e}")))?
}

/// Create `branch_name` from HEAD and check it out. An existing local branch
/// is checked out as is, so a replayed create after a crash is harmless.
pub async fn create_branch(dir: &Path, branch_name: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        if repo.find_branch(&branch_name, BranchType::Local).is_err() {
            let commit = repo.head()?.peel_to_commit()?;
            repo.branch(&branch_name, &commit, false)?;
        } else {
            tracing::debug!(branch = %branch_name, "Branch exists, checking it out");
        }
        let refname = format!("refs/heads/{branch_name}");
        let obj = repo.revparse_single(&refname)?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&refname)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Create-branch task panicked: {e}")))?
}

/// Short name of the checked-out branch.
pub async fn current_branch(dir: &Path) -> Result<String> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let head = repo.head()?;
        head.shorthand()
            .map(str::to_string)
            .ok_or_else(|| AppError::Git("HEAD is not a named branch".to_string()))
    })
    .await
    .map_err(|e| AppError::Git(format!("Current-branch task panicked: {e}")))?
}

/// Stage `paths` (missing files are staged as deletions) and commit them.
///
/// Returns the new commit id, or `None` when the staged tree equals HEAD's.
pub async fn commit_paths(dir: &Path, paths: &[String], message: &str) -> Result<Option<String>> {
    let dir = dir.to_path_buf();
    let paths = paths.to_vec();
    let message = message.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut index = repo.index()?;
        for path in &paths {
            let rel = Path::new(path);
            if dir.join(rel).exists() {
                index.add_path(rel)?;
            } else {
                index.remove_path(rel)?;
            }
        }
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_oid {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_oid)?;
        let sig = signature()?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;
        Ok(Some(oid.to_string()))
    })
    .await
    .map_err(|e| AppError::Git(format!("Commit task panicked: {e}")))?
}

/// Push the current branch to origin.
pub async fn push(dir: &Path, branch_name: &str, token: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();
    let token = token.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch_name}:refs/heads/{branch_name}");
        let mut push_opts = make_push_options(&token);
        remote.push(&[&refspec], Some(&mut push_opts))?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Push task panicked: {e}")))?
}

/// Unified diff of HEAD against the local `base` branch.
pub async fn diff_against(dir: &Path, base: &str) -> Result<String> {
    validate_branch_name(base)?;

    let dir = dir.to_path_buf();
    let base = base.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let base_tree = repo
            .revparse_single(&format!("refs/heads/{base}"))?
            .peel_to_tree()?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin());
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(out)
    })
    .await
    .map_err(|e| AppError::Git(format!("Diff task panicked: {e}")))?
}
