//! Filesystem CRUD and content search inside the sandbox.

use serde::Serialize;

use crate::error::Result;
use crate::platform::PlatformClient;
use crate::shell;

/// Directories grep skips unless the caller narrows the search with
/// include patterns.
pub const DEFAULT_SEARCH_EXCLUDES: &[&str] =
    &["node_modules", ".git", "dist", "build", "target", ".next"];

// ---------------------------------------------------------------------------
// Parsed types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub file: String,
    pub line: u32,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Parse `ls -1pA` output: one entry per line, directories suffixed `/`.
pub fn parse_ls(output: &str) -> Vec<DirEntry> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(dir) => DirEntry {
                name: dir.to_string(),
                is_dir: true,
            },
            None => DirEntry {
                name: line.to_string(),
                is_dir: false,
            },
        })
        .collect()
}

/// Parse `grep -rn` output lines of the form `file:line:text`.
pub fn parse_grep(output: &str) -> Vec<SearchMatch> {
    output
        .lines()
        .filter_map(|line| {
            let (file, rest) = line.split_once(':')?;
            let (line_no, text) = rest.split_once(':')?;
            Some(SearchMatch {
                file: file.to_string(),
                line: line_no.parse().ok()?,
                text: text.to_string(),
            })
        })
        .collect()
}

/// Build the grep command line: include patterns narrow the search and
/// override the default directory excludes.
pub fn build_search_command(dir: &str, query: &str, include: Option<&[String]>) -> String {
    let mut cmd = String::from("grep -rn");
    match include {
        Some(patterns) if !patterns.is_empty() => {
            for pattern in patterns {
                cmd.push_str(&format!(" --include={}", shell::quote(pattern)));
            }
        }
        _ => {
            for dir in DEFAULT_SEARCH_EXCLUDES {
                cmd.push_str(&format!(" --exclude-dir={dir}"));
            }
        }
    }
    cmd.push_str(&format!(" -- {} {}", shell::quote(query), shell::quote(dir)));
    cmd
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

pub async fn list_dir(
    platform: &PlatformClient,
    sandbox_id: &str,
    path: &str,
) -> Result<Vec<DirEntry>> {
    let output = platform
        .exec_checked(
            sandbox_id,
            &format!("ls -1pA {}", shell::quote(path)),
            None,
            Some(15),
        )
        .await?;
    Ok(parse_ls(&output))
}

pub async fn create_file(platform: &PlatformClient, sandbox_id: &str, path: &str) -> Result<()> {
    platform
        .exec_checked(
            sandbox_id,
            &format!("touch {}", shell::quote(path)),
            None,
            Some(15),
        )
        .await?;
    Ok(())
}

pub async fn make_dir(platform: &PlatformClient, sandbox_id: &str, path: &str) -> Result<()> {
    platform
        .exec_checked(
            sandbox_id,
            &format!("mkdir -p {}", shell::quote(path)),
            None,
            Some(15),
        )
        .await?;
    Ok(())
}

pub async fn rename(
    platform: &PlatformClient,
    sandbox_id: &str,
    from: &str,
    to: &str,
) -> Result<()> {
    platform
        .exec_checked(
            sandbox_id,
            &format!("mv {} {}", shell::quote(from), shell::quote(to)),
            None,
            Some(15),
        )
        .await?;
    Ok(())
}

pub async fn remove(platform: &PlatformClient, sandbox_id: &str, path: &str) -> Result<()> {
    platform
        .exec_checked(
            sandbox_id,
            &format!("rm -rf {}", shell::quote(path)),
            None,
            Some(30),
        )
        .await?;
    Ok(())
}

pub async fn read_file(
    platform: &PlatformClient,
    sandbox_id: &str,
    path: &str,
) -> Result<Vec<u8>> {
    platform.download_file(sandbox_id, path).await
}

pub async fn write_file(
    platform: &PlatformClient,
    sandbox_id: &str,
    path: &str,
    content: Vec<u8>,
) -> Result<()> {
    platform.upload_file(sandbox_id, path, content).await
}

pub async fn search(
    platform: &PlatformClient,
    sandbox_id: &str,
    dir: &str,
    query: &str,
    include: Option<&[String]>,
) -> Result<Vec<SearchMatch>> {
    // grep exits 1 on zero matches; that is an empty result, not a failure.
    let result = platform
        .exec(
            sandbox_id,
            &build_search_command(dir, query, include),
            None,
            Some(30),
        )
        .await?;
    Ok(parse_grep(&result.result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
