//! Git operations, executed inside the sandbox and parsed host-side.

use serde::Serialize;

use crate::error::{ManagerError, Result};
use crate::platform::PlatformClient;
use crate::shell;

// ---------------------------------------------------------------------------
// Parsed types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    pub branch: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitBranch {
    pub name: String,
    pub current: bool,
    pub remote: bool,
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Parse `git status --porcelain -b -uall` output.
pub fn parse_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in output.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            parse_branch_header(header, &mut status);
            continue;
        }
        if line.len() < 4 {
            continue;
        }
        let x = line.as_bytes()[0] as char;
        let y = line.as_bytes()[1] as char;
        // Renames are reported as "R  old -> new"; the new path is the one
        // that exists in the working tree.
        let path = line[3..]
            .rsplit(" -> ")
            .next()
            .unwrap_or(&line[3..])
            .to_string();

        if x == '?' && y == '?' {
            status.untracked.push(path);
            continue;
        }
        if x == 'U' || y == 'U' || (x == 'A' && y == 'A') || (x == 'D' && y == 'D') {
            status.conflicted.push(path);
            continue;
        }
        if x != ' ' {
            status.staged.push(path.clone());
        }
        if y != ' ' {
            status.unstaged.push(path);
        }
    }

    status
}

fn parse_branch_header(header: &str, status: &mut GitStatus) {
    // Forms: "main...origin/main [ahead 1, behind 2]", "main",
    // "No commits yet on main", "HEAD (no branch)".
    if let Some(rest) = header.strip_prefix("No commits yet on ") {
        status.branch = Some(rest.trim().to_string());
        return;
    }
    if header.starts_with("HEAD") {
        return;
    }

    let (name_part, bracket) = match header.split_once(" [") {
        Some((n, b)) => (n, Some(b.trim_end_matches(']'))),
        None => (header, None),
    };
    let name = name_part.split("...").next().unwrap_or(name_part);
    status.branch = Some(name.trim().to_string());

    if let Some(counters) = bracket {
        for part in counters.split(", ") {
            if let Some(n) = part.strip_prefix("ahead ") {
                status.ahead = n.trim().parse().unwrap_or(0);
            } else if let Some(n) = part.strip_prefix("behind ") {
                status.behind = n.trim().parse().unwrap_or(0);
            }
        }
    }
}

/// Parse `git branch -a --sort=-committerdate` output.
pub fn parse_branches(output: &str) -> Vec<GitBranch> {
    let mut branches = Vec::new();
    for line in output.lines() {
        let current = line.starts_with('*');
        let name = line.trim_start_matches('*').trim();
        if name.is_empty() || name.contains("->") {
            continue; // skip "remotes/origin/HEAD -> origin/main"
        }
        let remote = name.starts_with("remotes/");
        branches.push(GitBranch {
            name: name.strip_prefix("remotes/").unwrap_or(name).to_string(),
            current,
            remote,
        });
    }
    branches
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Find the repository root: the project directory itself, or exactly one
/// level below it (fresh sandboxes clone into a subdirectory sometimes).
pub async fn find_git_root(
    platform: &PlatformClient,
    sandbox_id: &str,
    project_dir: &str,
) -> Result<String> {
    let probe = platform
        .exec(
            sandbox_id,
            &format!("test -d {}/.git", shell::quote(project_dir)),
            None,
            Some(10),
        )
        .await?;
    if probe.exit_code == 0 {
        return Ok(project_dir.to_string());
    }

    let nested = platform
        .exec(
            sandbox_id,
            "ls -d */.git 2>/dev/null | head -1",
            Some(project_dir),
            Some(10),
        )
        .await?;
    let found = nested.result.trim();
    if nested.exit_code == 0 && !found.is_empty() {
        let sub = found.trim_end_matches("/.git");
        return Ok(format!("{project_dir}/{sub}"));
    }

    Err(ManagerError::GitNoRepo(project_dir.to_string()))
}

pub async fn status(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
) -> Result<GitStatus> {
    let output = platform
        .exec_checked(
            sandbox_id,
            "git status --porcelain -b -uall",
            Some(git_root),
            Some(30),
        )
        .await?;
    Ok(parse_status(&output))
}

pub async fn branches(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
) -> Result<Vec<GitBranch>> {
    let output = platform
        .exec_checked(
            sandbox_id,
            "git branch -a --sort=-committerdate",
            Some(git_root),
            Some(30),
        )
        .await?;
    Ok(parse_branches(&output))
}

pub async fn stage(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    paths: &[String],
) -> Result<()> {
    let command = if paths.is_empty() {
        "git add -A".to_string()
    } else {
        format!("git add -- {}", shell::quote_all(paths))
    };
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

pub async fn unstage(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    paths: &[String],
) -> Result<()> {
    let command = if paths.is_empty() {
        "git reset HEAD".to_string()
    } else {
        format!("git reset HEAD -- {}", shell::quote_all(paths))
    };
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

pub async fn discard(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    paths: &[String],
) -> Result<()> {
    let command = format!("git checkout -- {}", shell::quote_all(paths));
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

pub async fn commit(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    message: &str,
) -> Result<()> {
    let command = format!("git commit -m {}", shell::quote(message));
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

pub async fn push(platform: &PlatformClient, sandbox_id: &str, git_root: &str) -> Result<()> {
    platform
        .exec_checked(sandbox_id, "git push", Some(git_root), Some(120))
        .await?;
    Ok(())
}

pub async fn pull(platform: &PlatformClient, sandbox_id: &str, git_root: &str) -> Result<()> {
    platform
        .exec_checked(sandbox_id, "git pull", Some(git_root), Some(120))
        .await?;
    Ok(())
}

pub async fn checkout(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    branch: &str,
) -> Result<()> {
    let command = format!("git checkout {}", shell::quote(branch));
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

/// Create and switch to a branch. Shell form so it works on a repo with no
/// commits yet (no HEAD to fork from).
pub async fn create_branch(
    platform: &PlatformClient,
    sandbox_id: &str,
    git_root: &str,
    branch: &str,
) -> Result<()> {
    let command = format!("git checkout -b {}", shell::quote(branch));
    platform
        .exec_checked(sandbox_id, &command, Some(git_root), Some(30))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_with_ahead_behind() {
        let out = "## main...origin/main [ahead 2, behind 1]\n";
        let s = parse_status(out);
        assert_eq!(s.branch.as_deref(), Some("main"));
        assert_eq!(s.ahead, 2);
        assert_eq!(s.behind, 1);
    }

    #[test]
    fn parses_plain_branch_header() {
        let s = parse_status("## feature/login\n");
        assert_eq!(s.branch.as_deref(), Some("feature/login"));
        assert_eq!((s.ahead, s.behind), (0, 0));
    }

    #[test]
    fn parses_no_commits_yet_header() {
        let s = parse_status("## No commits yet on main\n");
        assert_eq!(s.branch.as_deref(), Some("main"));
    }

    #[test]
    fn detached_head_has_no_branch() {
        let s = parse_status("## HEAD (no branch)\n");
        assert_eq!(s.branch, None);
    }

    #[test]
    fn classifies_entries() {
        let out = "\
## main
M  staged_only.rs
 M unstaged_only.rs
MM both.rs
?? new_file.rs
UU conflicted.rs
A  added.rs
";
        let s = parse_status(out);
        assert_eq!(s.staged, vec!["staged_only.rs", "both.rs", "added.rs"]);
        assert_eq!(s.unstaged, vec!["unstaged_only.rs", "both.rs"]);
        assert_eq!(s.untracked, vec!["new_file.rs"]);
        assert_eq!(s.conflicted, vec!["conflicted.rs"]);
    }

    #[test]
    fn rename_reports_the_new_path() {
        let s = parse_status("## main\nR  old.rs -> new.rs\n");
        assert_eq!(s.staged, vec!["new.rs"]);
    }

    #[test]
    fn stage_then_unstage_is_symmetric_on_paths() {
        // The command pair targets the same path set; a stage followed by an
        // unstage of the same paths restores the index.
        let paths = vec!["a.rs".to_string(), "b dir/c.rs".to_string()];
        let add = format!("git add -- {}", shell::quote_all(&paths));
        let reset = format!("git reset HEAD -- {}", shell::quote_all(&paths));
        assert_eq!(add, "git add -- a.rs 'b dir/c.rs'");
        assert_eq!(reset, "git reset HEAD -- a.rs 'b dir/c.rs'");
    }

    #[test]
    fn parses_branch_listing() {
        let out = "\
* main
  feature/auth
  remotes/origin/HEAD -> origin/main
  remotes/origin/main
";
        let branches = parse_branches(out);
        assert_eq!(branches.len(), 3);
        assert!(branches[0].current);
        assert_eq!(branches[0].name, "main");
        assert!(!branches[1].remote);
        assert_eq!(branches[2].name, "origin/main");
        assert!(branches[2].remote);
    }

    #[tokio::test]
    async fn find_git_root_prefers_project_dir() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/toolbox/sb/process/execute")
            .with_body(r#"{"exitCode":0,"result":""}"#)
            .create_async()
            .await;
        let platform = PlatformClient::new(server.url(), "k");
        let root = find_git_root(&platform, "sb", "/home/daytona/proj")
            .await
            .unwrap();
        assert_eq!(root, "/home/daytona/proj");
    }

    #[tokio::test]
    async fn find_git_root_errors_when_nothing_found() {
        let mut server = mockito::Server::new_async().await;
        // Both the direct probe and the nested scan come back empty-handed.
        server
            .mock("POST", "/toolbox/sb/process/execute")
            .with_body(r#"{"exitCode":1,"result":""}"#)
            .expect(2)
            .create_async()
            .await;
        let platform = PlatformClient::new(server.url(), "k");
        let err = find_git_root(&platform, "sb", "/home/daytona/proj")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::GitNoRepo(_)));
    }
}
