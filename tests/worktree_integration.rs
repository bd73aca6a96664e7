mod common;

use std::time::Duration;

use auto_claude::spec_number::{parse_spec_number, reserve_spec_dir};
use auto_claude::worktree::{MergeOutcome, WorktreeManager};
use common::{TestRepo, git};

fn manager(repo: &TestRepo) -> WorktreeManager {
    WorktreeManager::new(&repo.repo).with_base_branch(Some("main".to_string()))
}

#[test]
fn test_create_worktree_from_remote_base() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);

    let info = mgr.create_worktree("fix-typo").unwrap();
    assert_eq!(info.branch, "auto-claude/fix-typo");
    assert!(info.path.ends_with(".auto-claude/worktrees/tasks/fix-typo"));
    assert!(info.path.join("README.md").exists());

    // The branch namespace is intact: only the namespaced branch exists.
    let branches = git(&repo.repo, &["branch", "--list"]);
    assert!(branches.contains("auto-claude/fix-typo"));
    assert!(!branches.lines().any(|l| l.trim().trim_start_matches("* ") == "auto-claude"));
}

#[test]
fn test_get_or_create_is_idempotent() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);

    let first = mgr.create_worktree("add-auth").unwrap();
    let second = mgr.get_or_create_worktree("add-auth").unwrap();
    assert_eq!(first.path, second.path);
    assert_eq!(first.branch, second.branch);
}

#[test]
fn test_flat_namespace_branch_refused_with_hint() {
    let repo = TestRepo::new();
    git(&repo.repo, &["branch", "auto-claude"]);

    let mgr = manager(&repo);
    let err = mgr.create_worktree("anything").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("blocks"));
    assert!(message.contains("git branch -m"));
}

#[test]
fn test_list_worktrees_only_namespace() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    mgr.create_worktree("task-one").unwrap();
    mgr.create_worktree("task-two").unwrap();

    let listed = mgr.list_worktrees().unwrap();
    let slugs: Vec<&str> = listed.iter().map(|w| w.slug.as_str()).collect();
    assert_eq!(listed.len(), 2);
    assert!(slugs.contains(&"task-one"));
    assert!(slugs.contains(&"task-two"));
}

#[test]
fn test_remove_worktree_deletes_branch() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("short-lived").unwrap();

    mgr.remove_worktree("short-lived", true).unwrap();
    assert!(!info.path.exists());
    let branches = git(&repo.repo, &["branch", "--list"]);
    assert!(!branches.contains("auto-claude/short-lived"));
}

#[test]
fn test_merge_worktree_no_ff() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("feature-x").unwrap();

    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);
    repo.commit_file(&info.path, "feature.rs", "fn feature() {}\n", "add feature");

    let outcome = mgr.merge_worktree("feature-x", false, false).unwrap();
    assert_eq!(outcome, MergeOutcome::Merged);
    assert!(repo.repo.join("feature.rs").exists());

    // --no-ff produced a merge commit with two parents.
    let parents = git(&repo.repo, &["log", "-1", "--format=%P"]);
    assert_eq!(parents.trim().split_whitespace().count(), 2);
}

#[test]
fn test_merge_already_up_to_date() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    mgr.create_worktree("no-changes").unwrap();

    let outcome = mgr.merge_worktree("no-changes", false, false).unwrap();
    assert_eq!(outcome, MergeOutcome::AlreadyUpToDate);
}

#[test]
fn test_merge_conflict_aborts_cleanly() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("conflicting").unwrap();

    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);
    repo.commit_file(&info.path, "README.md", "worktree version\n", "worktree edit");
    repo.commit_file(&repo.repo, "README.md", "main version\n", "main edit");

    let err = mgr.merge_worktree("conflicting", false, false).unwrap_err();
    assert!(err.to_string().contains("aborted"));

    // The merge was aborted: nothing staged or in conflict (the untracked
    // .auto-claude/ worktree dir is expected).
    let status = git(&repo.repo, &["status", "--porcelain"]);
    let dirty: Vec<&str> = status
        .lines()
        .filter(|l| !l.starts_with("??"))
        .collect();
    assert!(dirty.is_empty(), "dirty tree after abort: {dirty:?}");
}

#[test]
fn test_no_commit_merge_unstages_task_artifacts() {
    let repo = TestRepo::new();
    // Ignore logs/ in the base branch before branching.
    repo.commit_file(&repo.repo, ".gitignore", "logs/\n", "add gitignore");
    git(&repo.repo, &["push", "origin", "main"]);

    let mgr = manager(&repo);
    let info = mgr.create_worktree("with-artifacts").unwrap();
    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);

    // Real change plus two artifacts that must never reach base: a
    // task-state file under .auto-claude/ and a force-added ignored file.
    repo.commit_file(&info.path, "real.rs", "fn real() {}\n", "real change");
    std::fs::create_dir_all(info.path.join(".auto-claude")).unwrap();
    std::fs::write(info.path.join(".auto-claude/task-note.txt"), "note").unwrap();
    std::fs::create_dir_all(info.path.join("logs")).unwrap();
    std::fs::write(info.path.join("logs/tmp.log"), "log").unwrap();
    git(&info.path, &["add", "-f", ".auto-claude/task-note.txt", "logs/tmp.log"]);
    git(&info.path, &["commit", "-m", "add artifacts"]);

    let outcome = mgr.merge_worktree("with-artifacts", true, false).unwrap();
    assert_eq!(outcome, MergeOutcome::Merged);

    let staged = git(&repo.repo, &["diff", "--cached", "--name-only"]);
    let staged: Vec<&str> = staged.lines().collect();
    assert!(staged.contains(&"real.rs"), "staged: {staged:?}");
    assert!(!staged.iter().any(|f| f.starts_with(".auto-claude/")));
    assert!(!staged.contains(&"logs/tmp.log"));

    // Clean up the staged merge for the tempdir teardown.
    git(&repo.repo, &["merge", "--abort"]);
}

#[test]
fn test_detect_file_renames_across_base() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);

    repo.commit_file(&repo.repo, "src/old_name.rs", "pub fn f() {}\n", "add module");
    let merge_base = git(&repo.repo, &["rev-parse", "HEAD"]).trim().to_string();

    git(&repo.repo, &["mv", "src/old_name.rs", "src/new_name.rs"]);
    git(&repo.repo, &["commit", "-m", "rename module"]);

    let renames = mgr.detect_file_renames(&merge_base, "main").unwrap();
    assert_eq!(renames.get("src/old_name.rs").map(String::as_str), Some("src/new_name.rs"));
}

#[test]
fn test_stats_reflect_worktree_activity() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("busy").unwrap();

    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);
    repo.commit_file(&info.path, "a.rs", "fn a() {}\nfn b() {}\n", "one");
    repo.commit_file(&info.path, "b.rs", "fn c() {}\n", "two");

    let stats = mgr.stats("busy").unwrap();
    assert_eq!(stats.commits_ahead, 2);
    assert_eq!(stats.files_changed, 2);
    assert!(stats.insertions >= 3);
    assert_eq!(stats.days_since_last_activity, Some(0));
    assert!(!stats.is_stale());
}

#[test]
fn test_merge_preview_reports_without_writing() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("previewed").unwrap();

    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);
    repo.commit_file(&info.path, "new_file.rs", "fn x() {}\n", "change");

    let before = git(&repo.repo, &["rev-parse", "HEAD"]);
    let preview = mgr.merge_preview("previewed").unwrap();
    assert_eq!(preview.branch, "auto-claude/previewed");
    assert_eq!(preview.base_branch, "main");
    assert!(preview.files_changed.contains(&"new_file.rs".to_string()));
    assert!(!preview.conflicts_expected);

    // Nothing moved.
    let after = git(&repo.repo, &["rev-parse", "HEAD"]);
    assert_eq!(before, after);
    assert!(!repo.repo.join("new_file.rs").exists());
}

#[test]
fn test_spec_numbers_scan_worktrees() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);

    // Main checkout holds 002; a sibling worktree holds 005.
    std::fs::create_dir_all(repo.repo.join("specs/002-early")).unwrap();
    let info = mgr.create_worktree("parallel-task").unwrap();
    std::fs::create_dir_all(info.path.join("specs/005-in-worktree")).unwrap();

    let spec_dir = reserve_spec_dir(&mgr, "next-task", Duration::from_secs(5)).unwrap();
    let name = spec_dir.file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(parse_spec_number(&name), Some(6));
    assert!(spec_dir.is_dir());
}

#[test]
fn test_push_branch_reaches_origin() {
    let repo = TestRepo::new();
    let mgr = manager(&repo);
    let info = mgr.create_worktree("pushable").unwrap();

    git(&info.path, &["config", "user.email", "test@example.com"]);
    git(&info.path, &["config", "user.name", "Test"]);
    repo.commit_file(&info.path, "pushed.rs", "fn p() {}\n", "pushable change");

    mgr.push_branch("pushable").unwrap();

    let remote = git(&repo.repo, &["ls-remote", "origin", "auto-claude/pushable"]);
    assert!(remote.contains("auto-claude/pushable"));
}
