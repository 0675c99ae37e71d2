use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::IsolationError;
use crate::runner::{CommandRunner, ProcessCommandRunner};

/// Identity an isolated workspace is derived from. At most one live
/// workspace exists per `(name, work_id)` pair; the path and branch are
/// deterministic so re-creation is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceOwner {
    pub name: String,
    pub work_id: String,
}

impl WorkspaceOwner {
    pub fn new(name: impl Into<String>, work_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            work_id: work_id.into(),
        }
    }

    /// Filesystem- and refname-safe identity: lowercase alphanumerics and
    /// single dashes.
    pub fn slug(&self) -> String {
        let raw = format!("{}-{}", self.name, self.work_id);
        let mut slug = String::with_capacity(raw.len());
        let mut previous_was_dash = false;
        for ch in raw.chars() {
            let mapped = if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            };
            if mapped == '-' {
                if previous_was_dash || slug.is_empty() {
                    continue;
                }
                previous_was_dash = true;
            } else {
                previous_was_dash = false;
            }
            slug.push(mapped);
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatorConfig {
    /// Shared, trunk-resident working copy that isolated work merges into.
    pub trunk_path: PathBuf,
    /// Directory isolated working copies are created under.
    pub isolation_root: PathBuf,
    /// Branch naming convention for isolation-managed workspaces.
    pub branch_prefix: String,
    /// Preferred trunk branch for merge-back.
    pub primary_branch: String,
    /// Default branch fallback when the preferred one does not exist.
    pub fallback_branch: String,
    pub git_binary: PathBuf,
}

impl IsolatorConfig {
    pub fn new(trunk_path: impl Into<PathBuf>, isolation_root: impl Into<PathBuf>) -> Self {
        Self {
            trunk_path: trunk_path.into(),
            isolation_root: isolation_root.into(),
            branch_prefix: "fleet/".to_owned(),
            primary_branch: "main".to_owned(),
            fallback_branch: "master".to_owned(),
            git_binary: PathBuf::from("git"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedWorkspace {
    pub path: PathBuf,
    pub branch: String,
    pub owner: WorkspaceOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSummary {
    pub path: PathBuf,
    pub branch: String,
}

/// Why a workspace validation collapsed to valid or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    Valid,
    /// No directory, no registration: nothing to repair, create fresh.
    NeverExisted,
    /// Still registered but the directory was deleted externally; repair by
    /// pruning the stale registration and re-attaching the branch.
    DirectoryDeleted,
    /// Directory present but git no longer tracks it, likely pruned; repair
    /// by re-adding.
    NotRegistered,
    /// The backing branch is gone; the workspace is unusable as-is.
    BranchDeleted,
}

/// Three independent existence facts plus their collapsed verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceValidation {
    pub directory_exists: bool,
    pub git_registered: bool,
    pub branch_exists: bool,
    pub is_valid: bool,
    pub reason: ValidationReason,
}

impl WorkspaceValidation {
    fn collapse(directory_exists: bool, git_registered: bool, branch_exists: bool) -> Self {
        let reason = match (directory_exists, git_registered, branch_exists) {
            (true, true, true) => ValidationReason::Valid,
            (false, false, _) => ValidationReason::NeverExisted,
            (_, _, false) => ValidationReason::BranchDeleted,
            (false, true, true) => ValidationReason::DirectoryDeleted,
            (true, false, true) => ValidationReason::NotRegistered,
        };
        Self {
            directory_exists,
            git_registered,
            branch_exists,
            is_valid: reason == ValidationReason::Valid,
            reason,
        }
    }
}

/// Result of a merge or rebase attempt. Conflicts are recoverable and are
/// reported here rather than as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub had_conflicts: bool,
    pub output: String,
}

impl MergeOutcome {
    fn succeeded(output: String) -> Self {
        Self {
            success: true,
            had_conflicts: false,
            output,
        }
    }

    fn conflicted(output: String) -> Self {
        Self {
            success: false,
            had_conflicts: true,
            output,
        }
    }
}

pub struct WorkspaceIsolator<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
    config: IsolatorConfig,
    // The trunk working copy is a single exclusively-owned resource: a
    // concurrent checkout/merge on it corrupts the tree.
    trunk_lock: Arc<Mutex<()>>,
}

impl WorkspaceIsolator<ProcessCommandRunner> {
    pub fn new(config: IsolatorConfig) -> Self {
        Self::with_runner(ProcessCommandRunner, config)
    }
}

impl<R: CommandRunner> WorkspaceIsolator<R> {
    pub fn with_runner(runner: R, config: IsolatorConfig) -> Self {
        Self {
            runner,
            config,
            trunk_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &IsolatorConfig {
        &self.config
    }

    pub fn workspace_path(&self, owner: &WorkspaceOwner) -> PathBuf {
        self.config.isolation_root.join(owner.slug())
    }

    pub fn branch_name(&self, owner: &WorkspaceOwner) -> String {
        format!("{}{}", self.config.branch_prefix, owner.slug())
    }

    /// Serializes access to the trunk working copy. Held internally by
    /// `merge`; exposed so verification runs in the trunk can serialize
    /// against merges.
    pub async fn lock_trunk(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.trunk_lock).lock_owned().await
    }

    /// Creates a new branch and working copy from the current trunk tip.
    pub async fn create(
        &self,
        owner: &WorkspaceOwner,
    ) -> Result<IsolatedWorkspace, IsolationError> {
        let path = self.workspace_path(owner);
        let branch = self.branch_name(owner);
        tokio::fs::create_dir_all(&self.config.isolation_root).await?;

        let args = self.trunk_args(&[
            OsString::from("worktree"),
            OsString::from("add"),
            OsString::from("-b"),
            OsString::from(&branch),
            path.as_os_str().to_owned(),
        ]);
        let output = self.run_raw(&args).await?;
        if !output.status.success() {
            return Err(IsolationError::Isolation(command_detail(&args, &output)));
        }

        Ok(IsolatedWorkspace {
            path,
            branch,
            owner: owner.clone(),
        })
    }

    /// Checks three independent facts: directory presence, worktree
    /// registration, and branch existence.
    pub async fn validate(
        &self,
        owner: &WorkspaceOwner,
    ) -> Result<WorkspaceValidation, IsolationError> {
        let path = self.workspace_path(owner);
        let branch = self.branch_name(owner);

        let directory_exists = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.is_dir(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => false,
            Err(error) => return Err(IsolationError::Io(error)),
        };
        let git_registered = self.is_registered(&path).await?;
        let branch_exists = self.branch_exists(&branch).await?;

        Ok(WorkspaceValidation::collapse(
            directory_exists,
            git_registered,
            branch_exists,
        ))
    }

    /// Repairs an invalid workspace: prunes stale registrations, clears an
    /// orphaned directory, then re-attaches the surviving branch or creates
    /// a brand-new one. Fails with `AlreadyValid` when there is nothing to
    /// repair.
    pub async fn recreate(
        &self,
        owner: &WorkspaceOwner,
    ) -> Result<IsolatedWorkspace, IsolationError> {
        let validation = self.validate(owner).await?;
        if validation.is_valid {
            return Err(IsolationError::AlreadyValid);
        }

        let path = self.workspace_path(owner);
        let branch = self.branch_name(owner);

        self.run(&self.trunk_args(&[OsString::from("worktree"), OsString::from("prune")]))
            .await?;

        if validation.directory_exists && !validation.git_registered {
            // git refuses to add a worktree over a non-empty directory
            tokio::fs::remove_dir_all(&path).await?;
        }

        let args = if validation.branch_exists {
            self.trunk_args(&[
                OsString::from("worktree"),
                OsString::from("add"),
                path.as_os_str().to_owned(),
                OsString::from(&branch),
            ])
        } else {
            self.trunk_args(&[
                OsString::from("worktree"),
                OsString::from("add"),
                OsString::from("-b"),
                OsString::from(&branch),
                path.as_os_str().to_owned(),
            ])
        };
        let output = self.run_raw(&args).await?;
        if !output.status.success() {
            return Err(IsolationError::Isolation(command_detail(&args, &output)));
        }

        tracing::debug!(
            workspace = %path.display(),
            branch = %branch,
            reason = ?validation.reason,
            "repaired isolated workspace"
        );

        Ok(IsolatedWorkspace {
            path,
            branch,
            owner: owner.clone(),
        })
    }

    /// Switches the trunk copy to its primary branch and merges the owner's
    /// branch with `--no-ff`. Conflicts leave the trunk mid-merge so the
    /// caller can resolve or discard via [`Self::abort_merge`].
    pub async fn merge(&self, owner: &WorkspaceOwner) -> Result<MergeOutcome, IsolationError> {
        let branch = self.branch_name(owner);
        let _guard = self.trunk_lock.lock().await;

        let primary = self.resolve_primary_branch().await?;
        self.run(&self.trunk_args(&[OsString::from("checkout"), OsString::from(&primary)]))
            .await?;

        let args = self.trunk_args(&[
            OsString::from("merge"),
            OsString::from("--no-ff"),
            OsString::from(&branch),
        ]);
        let output = self.run_raw(&args).await?;
        let combined = combined_output(&output);
        if output.status.success() {
            return Ok(MergeOutcome::succeeded(combined));
        }
        if has_conflict_markers(&combined) {
            tracing::warn!(branch = %branch, "merge into trunk hit conflicts");
            return Ok(MergeOutcome::conflicted(combined));
        }
        Err(IsolationError::OperationFailed(command_detail(
            &args, &output,
        )))
    }

    /// Discards an in-progress merge in the trunk copy. Tolerates "no merge
    /// to abort".
    pub async fn abort_merge(&self) -> Result<(), IsolationError> {
        let _guard = self.trunk_lock.lock().await;
        let args = self.trunk_args(&[OsString::from("merge"), OsString::from("--abort")]);
        let _ = self.run_raw(&args).await?;
        Ok(())
    }

    /// Replays the owner's branch on top of the trunk primary inside the
    /// isolated copy, auto-aborting on failure so the copy is left clean.
    pub async fn rebase(&self, owner: &WorkspaceOwner) -> Result<MergeOutcome, IsolationError> {
        let path = self.workspace_path(owner);
        let primary = self.resolve_primary_branch().await?;

        let args = vec![
            OsString::from("-C"),
            path.as_os_str().to_owned(),
            OsString::from("rebase"),
            OsString::from(&primary),
        ];
        let output = self.run_raw(&args).await?;
        let combined = combined_output(&output);
        if output.status.success() {
            return Ok(MergeOutcome::succeeded(combined));
        }

        let abort_args = vec![
            OsString::from("-C"),
            path.as_os_str().to_owned(),
            OsString::from("rebase"),
            OsString::from("--abort"),
        ];
        let _ = self.run_raw(&abort_args).await;

        if has_conflict_markers(&combined) {
            tracing::warn!(workspace = %path.display(), "rebase hit conflicts, aborted");
            return Ok(MergeOutcome::conflicted(combined));
        }
        Err(IsolationError::OperationFailed(command_detail(
            &args, &output,
        )))
    }

    /// Deletes the workspace and optionally its branch, tolerating "already
    /// gone" as success.
    pub async fn remove(
        &self,
        owner: &WorkspaceOwner,
        delete_branch: bool,
    ) -> Result<(), IsolationError> {
        let path = self.workspace_path(owner);
        let branch = self.branch_name(owner);

        let args = self.trunk_args(&[
            OsString::from("worktree"),
            OsString::from("remove"),
            OsString::from("--force"),
            path.as_os_str().to_owned(),
        ]);
        let output = self.run_raw(&args).await?;
        if !output.status.success() && !is_already_gone(&combined_output(&output)) {
            return Err(IsolationError::OperationFailed(command_detail(
                &args, &output,
            )));
        }

        if tokio::fs::metadata(&path).await.is_ok() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        let _ = self
            .run_raw(&self.trunk_args(&[OsString::from("worktree"), OsString::from("prune")]))
            .await?;

        if delete_branch {
            let args = self.trunk_args(&[
                OsString::from("branch"),
                OsString::from("-D"),
                OsString::from(&branch),
            ]);
            let output = self.run_raw(&args).await?;
            if !output.status.success() && !is_already_gone(&combined_output(&output)) {
                return Err(IsolationError::OperationFailed(command_detail(
                    &args, &output,
                )));
            }
        }

        Ok(())
    }

    /// Enumerates isolation-managed workspaces by branch-naming convention,
    /// resolving symlinked paths for reliable ownership comparison.
    pub async fn list(&self) -> Result<Vec<WorkspaceSummary>, IsolationError> {
        let entries = self.registered_worktrees().await?;
        let prefix = format!("refs/heads/{}", self.config.branch_prefix);

        let mut summaries = Vec::new();
        for entry in entries {
            let Some(branch_ref) = entry.branch_ref else {
                continue;
            };
            let Some(branch) = branch_ref.strip_prefix("refs/heads/") else {
                continue;
            };
            if !branch_ref.starts_with(&prefix) {
                continue;
            }
            let path = match tokio::fs::canonicalize(&entry.path).await {
                Ok(resolved) => resolved,
                Err(_) => entry.path.clone(),
            };
            summaries.push(WorkspaceSummary {
                path,
                branch: branch.to_owned(),
            });
        }
        Ok(summaries)
    }

    /// Copies trunk-relative files into a freshly provisioned workspace.
    /// Missing sources are skipped, not errors.
    pub async fn copy_shared_context(
        &self,
        workspace: &Path,
        files: &[PathBuf],
    ) -> Result<(), IsolationError> {
        for relative in files {
            let source = self.config.trunk_path.join(relative);
            if tokio::fs::metadata(&source).await.is_err() {
                tracing::debug!(file = %relative.display(), "shared context file missing, skipped");
                continue;
            }
            let target = workspace.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&source, &target).await?;
        }
        Ok(())
    }

    async fn resolve_primary_branch(&self) -> Result<String, IsolationError> {
        if self.branch_exists(&self.config.primary_branch).await? {
            return Ok(self.config.primary_branch.clone());
        }
        if self.branch_exists(&self.config.fallback_branch).await? {
            return Ok(self.config.fallback_branch.clone());
        }
        Err(IsolationError::OperationFailed(format!(
            "trunk has neither '{}' nor '{}' branch",
            self.config.primary_branch, self.config.fallback_branch
        )))
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, IsolationError> {
        let args = self.trunk_args(&[
            OsString::from("rev-parse"),
            OsString::from("--verify"),
            OsString::from("--quiet"),
            OsString::from(format!("refs/heads/{branch}")),
        ]);
        let output = self.run_raw(&args).await?;
        Ok(output.status.success())
    }

    async fn is_registered(&self, path: &Path) -> Result<bool, IsolationError> {
        let resolved = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let entries = self.registered_worktrees().await?;
        for entry in entries {
            let listed = tokio::fs::canonicalize(&entry.path)
                .await
                .unwrap_or(entry.path);
            if listed == resolved {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn registered_worktrees(&self) -> Result<Vec<WorktreeEntry>, IsolationError> {
        let output = self
            .run(&self.trunk_args(&[
                OsString::from("worktree"),
                OsString::from("list"),
                OsString::from("--porcelain"),
            ]))
            .await?;
        Ok(parse_worktree_porcelain(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    fn trunk_args(&self, tail: &[OsString]) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-C"),
            self.config.trunk_path.as_os_str().to_owned(),
        ];
        args.extend(tail.iter().cloned());
        args
    }

    async fn run_raw(&self, args: &[OsString]) -> Result<Output, IsolationError> {
        let program = self
            .config
            .git_binary
            .to_str()
            .ok_or_else(|| IsolationError::OperationFailed("invalid git binary path".to_owned()))?;
        self.runner.run(program, args).await.map_err(|error| {
            IsolationError::OperationFailed(format!(
                "failed to execute `{}`: {error}",
                self.config.git_binary.display()
            ))
        })
    }

    async fn run(&self, args: &[OsString]) -> Result<Output, IsolationError> {
        let output = self.run_raw(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(IsolationError::OperationFailed(command_detail(
            args, &output,
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorktreeEntry {
    path: PathBuf,
    branch_ref: Option<String>,
}

fn parse_worktree_porcelain(stdout: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch_ref: None,
            });
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                entry.branch_ref = Some(branch_ref.to_owned());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

fn has_conflict_markers(combined: &str) -> bool {
    let lowered = combined.to_ascii_lowercase();
    lowered.contains("conflict") || lowered.contains("needs merge")
}

fn is_already_gone(combined: &str) -> bool {
    let lowered = combined.to_ascii_lowercase();
    lowered.contains("is not a working tree")
        || lowered.contains("no such file or directory")
        || lowered.contains("not found")
        || lowered.contains("does not exist")
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout.trim());
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim());
    }
    combined
}

fn command_detail(args: &[OsString], output: &Output) -> String {
    let rendered_args = args
        .iter()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let detail = combined_output(output);
    let detail = if detail.is_empty() {
        format!("exit status {}", output.status)
    } else {
        detail
    };
    format!("git command failed (`git {rendered_args}`): {detail}")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::ffi::OsString;
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::process::Output;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{
        parse_worktree_porcelain, IsolatorConfig, MergeOutcome, ValidationReason, WorkspaceIsolator,
        WorkspaceOwner,
    };
    use crate::error::IsolationError;
    use crate::runner::CommandRunner;

    struct StubRunner {
        calls: Mutex<Vec<(String, Vec<OsString>)>>,
        results: Mutex<VecDeque<io::Result<Output>>>,
    }

    impl StubRunner {
        fn with_results(results: Vec<io::Result<Output>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(VecDeque::from(results)),
            }
        }

        fn calls(&self) -> Vec<(String, Vec<OsString>)> {
            self.calls.lock().expect("lock calls").clone()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(&self, program: &str, args: &[OsString]) -> io::Result<Output> {
            self.calls
                .lock()
                .expect("lock calls")
                .push((program.to_owned(), args.to_vec()));
            self.results
                .lock()
                .expect("lock results")
                .pop_front()
                .unwrap_or_else(|| {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "missing stubbed command output",
                    ))
                })
        }
    }

    fn output_with_status(code: i32, stdout: &[u8], stderr: &[u8]) -> Output {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Output {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            Output {
                status: std::process::ExitStatus::from_raw(code as u32),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            }
        }
    }

    fn ok_output() -> io::Result<Output> {
        Ok(output_with_status(0, &[], &[]))
    }

    fn failed_output(stderr: &str) -> io::Result<Output> {
        Ok(output_with_status(1, &[], stderr.as_bytes()))
    }

    fn porcelain_listing(trunk: &str, extra: &[(&str, &str)]) -> String {
        let mut listing = format!("worktree {trunk}\nHEAD 0000\nbranch refs/heads/main\n");
        for (path, branch) in extra {
            listing.push_str(&format!(
                "\nworktree {path}\nHEAD 0000\nbranch refs/heads/{branch}\n"
            ));
        }
        listing
    }

    struct Fixture {
        isolator: WorkspaceIsolator<StubRunner>,
        trunk: PathBuf,
        root: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn fixture(results: Vec<io::Result<Output>>) -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let trunk = tmp.path().join("trunk");
        let root = tmp.path().join("workspaces");
        fs::create_dir_all(&trunk).expect("trunk dir");
        fs::create_dir_all(&root).expect("isolation root");
        let isolator = WorkspaceIsolator::with_runner(
            StubRunner::with_results(results),
            IsolatorConfig::new(&trunk, &root),
        );
        Fixture {
            isolator,
            trunk,
            root,
            _tmp: tmp,
        }
    }

    fn owner() -> WorkspaceOwner {
        WorkspaceOwner::new("worker-1", "job-7")
    }

    #[test]
    fn owner_slug_is_deterministic_and_sanitized() {
        assert_eq!(owner().slug(), "worker-1-job-7");
        assert_eq!(
            WorkspaceOwner::new("Worker One", "job/7").slug(),
            "worker-one-job-7"
        );
        assert_eq!(WorkspaceOwner::new("--w--", "j--1--").slug(), "w-j-1");
    }

    #[test]
    fn branch_name_carries_isolation_prefix() {
        let fixture = fixture(Vec::new());
        assert_eq!(
            fixture.isolator.branch_name(&owner()),
            "fleet/worker-1-job-7"
        );
        assert_eq!(
            fixture.isolator.workspace_path(&owner()),
            fixture.root.join("worker-1-job-7")
        );
    }

    #[tokio::test]
    async fn create_issues_worktree_add_with_new_branch() {
        let fixture = fixture(vec![ok_output()]);
        let workspace = fixture.isolator.create(&owner()).await.expect("create");

        assert_eq!(workspace.branch, "fleet/worker-1-job-7");
        let calls = fixture.isolator.runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "git");
        assert_eq!(
            calls[0].1,
            vec![
                OsString::from("-C"),
                fixture.trunk.as_os_str().to_owned(),
                OsString::from("worktree"),
                OsString::from("add"),
                OsString::from("-b"),
                OsString::from("fleet/worker-1-job-7"),
                fixture.root.join("worker-1-job-7").as_os_str().to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn create_maps_git_rejection_to_isolation_error() {
        let fixture = fixture(vec![failed_output(
            "fatal: a branch named 'fleet/worker-1-job-7' already exists",
        )]);
        let error = fixture
            .isolator
            .create(&owner())
            .await
            .expect_err("create must fail");
        assert!(matches!(error, IsolationError::Isolation(_)));
        assert!(error.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn validate_reports_fully_valid_workspace() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        fs::create_dir_all(&path).expect("workspace dir");

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[(&path.to_string_lossy(), "fleet/worker-1-job-7")],
        );
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])),
            ok_output(),
        ]);

        let validation = fixture.isolator.validate(&owner()).await.expect("validate");
        assert!(validation.is_valid);
        assert_eq!(validation.reason, ValidationReason::Valid);
    }

    #[tokio::test]
    async fn validate_flags_externally_deleted_directory_for_reregistration() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        // directory intentionally absent, registration and branch remain

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[(&path.to_string_lossy(), "fleet/worker-1-job-7")],
        );
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])),
            ok_output(),
        ]);

        let validation = fixture.isolator.validate(&owner()).await.expect("validate");
        assert!(!validation.directory_exists);
        assert!(validation.git_registered);
        assert!(validation.branch_exists);
        assert!(!validation.is_valid);
        assert_eq!(validation.reason, ValidationReason::DirectoryDeleted);
    }

    #[tokio::test]
    async fn validate_flags_unregistered_directory_as_pruned() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        fs::create_dir_all(&path).expect("workspace dir");

        let listing = porcelain_listing(&fixture.trunk.to_string_lossy(), &[]);
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])),
            ok_output(),
        ]);

        let validation = fixture.isolator.validate(&owner()).await.expect("validate");
        assert_eq!(validation.reason, ValidationReason::NotRegistered);
        assert!(!validation.is_valid);
    }

    #[tokio::test]
    async fn validate_flags_missing_branch_as_unusable() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        fs::create_dir_all(&path).expect("workspace dir");

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[(&path.to_string_lossy(), "fleet/worker-1-job-7")],
        );
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])),
            failed_output(""),
        ]);

        let validation = fixture.isolator.validate(&owner()).await.expect("validate");
        assert_eq!(validation.reason, ValidationReason::BranchDeleted);
    }

    #[tokio::test]
    async fn validate_reports_never_existed_when_no_trace_remains() {
        let fixture = fixture(vec![
            Ok(output_with_status(
                0,
                porcelain_listing("/tmp/elsewhere", &[]).as_bytes(),
                &[],
            )),
            failed_output(""),
        ]);

        let validation = fixture.isolator.validate(&owner()).await.expect("validate");
        assert_eq!(validation.reason, ValidationReason::NeverExisted);
    }

    #[tokio::test]
    async fn recreate_rejects_already_valid_workspace_without_mutation() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        fs::create_dir_all(&path).expect("workspace dir");

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[(&path.to_string_lossy(), "fleet/worker-1-job-7")],
        );
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])),
            ok_output(),
        ]);

        let error = fixture
            .isolator
            .recreate(&owner())
            .await
            .expect_err("recreate must fail");
        assert!(matches!(error, IsolationError::AlreadyValid));
        // validation only: worktree list + rev-parse, no mutating commands
        assert_eq!(fixture.isolator.runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn recreate_reattaches_surviving_branch_after_directory_loss() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[(&path.to_string_lossy(), "fleet/worker-1-job-7")],
        );
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])), // worktree list
            ok_output(),                                        // rev-parse branch
            ok_output(),                                        // worktree prune
            ok_output(),                                        // worktree add (existing branch)
        ]);

        let workspace = fixture.isolator.recreate(&owner()).await.expect("recreate");
        assert_eq!(workspace.branch, "fleet/worker-1-job-7");

        let calls = fixture.isolator.runner.calls();
        let add_args = &calls[3].1;
        assert!(add_args.contains(&OsString::from("add")));
        // re-attach must not create a new branch
        assert!(!add_args.contains(&OsString::from("-b")));
        assert_eq!(add_args.last(), Some(&OsString::from("fleet/worker-1-job-7")));
    }

    #[tokio::test]
    async fn recreate_builds_fresh_branch_when_branch_is_gone() {
        let fixture = fixture(Vec::new());
        let path = fixture.isolator.workspace_path(&owner());
        fs::create_dir_all(&path).expect("orphaned dir");

        let listing = porcelain_listing(&fixture.trunk.to_string_lossy(), &[]);
        *fixture.isolator.runner.results.lock().expect("results") = VecDeque::from(vec![
            Ok(output_with_status(0, listing.as_bytes(), &[])), // worktree list
            failed_output(""),                                  // rev-parse branch: missing
            ok_output(),                                        // worktree prune
            ok_output(),                                        // worktree add -b
        ]);

        fixture.isolator.recreate(&owner()).await.expect("recreate");
        // orphaned unregistered directory is cleared before re-adding
        assert!(!path.exists());
        let calls = fixture.isolator.runner.calls();
        assert!(calls[3].1.contains(&OsString::from("-b")));
    }

    #[tokio::test]
    async fn merge_success_checks_out_primary_and_merges_no_ff() {
        let fixture = fixture(vec![
            ok_output(), // rev-parse main
            ok_output(), // checkout main
            Ok(output_with_status(0, b"Merge made by the 'ort' strategy.", &[])),
        ]);

        let outcome = fixture.isolator.merge(&owner()).await.expect("merge");
        assert!(outcome.success);
        assert!(!outcome.had_conflicts);

        let calls = fixture.isolator.runner.calls();
        assert_eq!(calls[1].1[2], OsString::from("checkout"));
        assert_eq!(calls[1].1[3], OsString::from("main"));
        assert_eq!(
            &calls[2].1[2..],
            &[
                OsString::from("merge"),
                OsString::from("--no-ff"),
                OsString::from("fleet/worker-1-job-7"),
            ]
        );
    }

    #[tokio::test]
    async fn merge_falls_back_to_alternate_default_branch() {
        let fixture = fixture(vec![
            failed_output(""), // rev-parse main: missing
            ok_output(),       // rev-parse master
            ok_output(),       // checkout master
            ok_output(),       // merge
        ]);

        fixture.isolator.merge(&owner()).await.expect("merge");
        let calls = fixture.isolator.runner.calls();
        assert_eq!(calls[2].1[3], OsString::from("master"));
    }

    #[tokio::test]
    async fn merge_conflict_text_yields_conflicted_outcome_not_error() {
        let fixture = fixture(vec![
            ok_output(),
            ok_output(),
            Ok(output_with_status(
                1,
                b"CONFLICT (content): Merge conflict in src/lib.rs\nAutomatic merge failed",
                &[],
            )),
        ]);

        let outcome = fixture.isolator.merge(&owner()).await.expect("merge");
        assert!(!outcome.success);
        assert!(outcome.had_conflicts);
        assert!(outcome.output.contains("CONFLICT"));
    }

    #[tokio::test]
    async fn merge_unexpected_failure_is_operation_failed() {
        let fixture = fixture(vec![
            ok_output(),
            ok_output(),
            failed_output("fatal: refusing to merge unrelated histories"),
        ]);

        let error = fixture
            .isolator
            .merge(&owner())
            .await
            .expect_err("merge must fail");
        assert!(matches!(error, IsolationError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn rebase_conflict_auto_aborts_and_reports_conflict() {
        let fixture = fixture(vec![
            ok_output(), // rev-parse main
            failed_output("CONFLICT (content): Merge conflict in src/main.rs"),
            ok_output(), // rebase --abort
        ]);

        let outcome = fixture.isolator.rebase(&owner()).await.expect("rebase");
        assert!(outcome.had_conflicts);

        let calls = fixture.isolator.runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            &calls[2].1[2..],
            &[OsString::from("rebase"), OsString::from("--abort")]
        );
        // rebase runs inside the isolated copy, not the trunk
        assert_eq!(
            calls[1].1[1],
            fixture.root.join("worker-1-job-7").as_os_str().to_owned()
        );
    }

    #[tokio::test]
    async fn remove_tolerates_workspace_already_gone() {
        let fixture = fixture(vec![
            failed_output("fatal: '/tmp/x' is not a working tree"),
            ok_output(), // prune
            failed_output("error: branch 'fleet/worker-1-job-7' not found."),
        ]);

        fixture
            .isolator
            .remove(&owner(), true)
            .await
            .expect("remove tolerates already gone");
    }

    #[tokio::test]
    async fn list_filters_by_branch_naming_convention() {
        let fixture = fixture(Vec::new());
        let managed = fixture.root.join("worker-1-job-7");
        fs::create_dir_all(&managed).expect("managed dir");

        let listing = porcelain_listing(
            &fixture.trunk.to_string_lossy(),
            &[
                (&managed.to_string_lossy(), "fleet/worker-1-job-7"),
                ("/tmp/unrelated", "feature/unrelated"),
            ],
        );
        *fixture.isolator.runner.results.lock().expect("results") =
            VecDeque::from(vec![Ok(output_with_status(0, listing.as_bytes(), &[]))]);

        let summaries = fixture.isolator.list().await.expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].branch, "fleet/worker-1-job-7");
        assert_eq!(
            summaries[0].path,
            managed.canonicalize().expect("canonical path")
        );
    }

    #[tokio::test]
    async fn copy_shared_context_copies_existing_files_and_skips_missing() {
        let fixture = fixture(Vec::new());
        let workspace = fixture.root.join("worker-1-job-7");
        fs::create_dir_all(&workspace).expect("workspace dir");
        fs::write(fixture.trunk.join("AGENTS.md"), b"shared context").expect("context file");

        fixture
            .isolator
            .copy_shared_context(
                &workspace,
                &[PathBuf::from("AGENTS.md"), PathBuf::from("missing.md")],
            )
            .await
            .expect("copy context");

        assert_eq!(
            fs::read(workspace.join("AGENTS.md")).expect("copied file"),
            b"shared context"
        );
        assert!(!workspace.join("missing.md").exists());
    }

    #[test]
    fn porcelain_parser_handles_multiple_entries() {
        let listing = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.fleet/w1\nHEAD def\nbranch refs/heads/fleet/w1-job-1\n\nworktree /repo/detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_porcelain(listing);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(
            entries[1].branch_ref.as_deref(),
            Some("refs/heads/fleet/w1-job-1")
        );
        assert_eq!(entries[2].branch_ref, None);
    }

    #[tokio::test]
    async fn merge_outcome_equality_covers_output_text() {
        let conflicted = MergeOutcome::conflicted("CONFLICT".to_owned());
        assert_eq!(conflicted, MergeOutcome::conflicted("CONFLICT".to_owned()));
    }
}
