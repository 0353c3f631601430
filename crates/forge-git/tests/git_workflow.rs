//! Workflow tests driving a real `git` binary inside temporary repositories.

use std::path::{Path, PathBuf};

use forge_git::{calculate_changes, clone, generate_branch_name, CloneOptions};

async fn run_git(dir: &Path, args: &[&str]) {
    let status = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .await
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

async fn init_repo(dir: &Path) {
    run_git(dir, &["init", "--initial-branch=main"]).await;
    run_git(dir, &["config", "user.name", "Fixture"]).await;
    run_git(dir, &["config", "user.email", "fixture@example.com"]).await;
    std::fs::write(dir.join("README.md"), "fixture repo\n").expect("write README");
    std::fs::write(dir.join("src.txt"), "line one\nline two\n").expect("write src");
    run_git(dir, &["add", "-A"]).await;
    run_git(dir, &["commit", "-m", "initial commit"]).await;
}

#[tokio::test]
async fn integration_calculate_changes_counts_workspace_edits() {
    let dir = tempfile::tempdir().expect("tempdir");
    init_repo(dir.path()).await;

    std::fs::write(dir.path().join("new_file.txt"), "created\n").expect("create file");
    std::fs::write(dir.path().join("src.txt"), "line one\nchanged\nadded line\n")
        .expect("modify file");
    std::fs::remove_file(dir.path().join("README.md")).expect("delete file");

    let summary = calculate_changes(dir.path()).await.expect("changes");
    assert_eq!(summary.files_created, 1);
    assert_eq!(summary.files_modified, 1);
    assert_eq!(summary.files_deleted, 1);
    assert!(summary.has_changes());
    assert!(
        summary.diff_stats.starts_with('+'),
        "diff stats should be '+I -D', got {}",
        summary.diff_stats
    );
}

#[tokio::test]
async fn integration_clean_worktree_yields_all_zeroes() {
    let dir = tempfile::tempdir().expect("tempdir");
    init_repo(dir.path()).await;

    let summary = calculate_changes(dir.path()).await.expect("changes");
    assert_eq!(summary.files_created, 0);
    assert_eq!(summary.files_modified, 0);
    assert_eq!(summary.files_deleted, 0);
    assert_eq!(summary.diff_stats, "+0 -0");
}

#[tokio::test]
async fn integration_clone_from_local_path() {
    let origin = tempfile::tempdir().expect("origin tempdir");
    init_repo(origin.path()).await;

    let dest_root = tempfile::tempdir().expect("dest tempdir");
    let dest: PathBuf = dest_root.path().join("workspace");

    clone(&CloneOptions {
        repo_url: format!("file://{}", origin.path().display()),
        dest_dir: dest.clone(),
        token: String::new(),
        branch: String::new(),
        shallow: true,
    })
    .await
    .expect("clone");

    assert!(dest.join("README.md").exists());
    assert!(dest.join(".git").exists());
}

#[tokio::test]
async fn regression_clone_of_missing_repo_mentions_clone() {
    let dest_root = tempfile::tempdir().expect("dest tempdir");
    let error = clone(&CloneOptions {
        repo_url: "file:///nonexistent/repo.git".to_string(),
        dest_dir: dest_root.path().join("workspace"),
        token: String::new(),
        branch: String::new(),
        shallow: true,
    })
    .await
    .expect_err("missing repo must fail");
    assert!(error.to_string().contains("clone"));
}

#[tokio::test]
async fn functional_branch_names_skip_existing_branches() {
    let dir = tempfile::tempdir().expect("tempdir");
    init_repo(dir.path()).await;
    run_git(dir.path(), &["branch", "codeforge/add-feature"]).await;

    let fresh = generate_branch_name(dir.path(), "codeforge/", "other-feature").await;
    assert_eq!(fresh, "codeforge/other-feature");

    let suffixed = generate_branch_name(dir.path(), "codeforge/", "add-feature").await;
    assert_eq!(suffixed, "codeforge/add-feature-1");
}
