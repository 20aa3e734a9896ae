//! Ownership file parsing and the path-to-owners resolver.
//!
//! An `owners.txt` in a directory governs every path under that directory
//! not overridden by a deeper `owners.txt`. The resolver maps a pull
//! request's cumulative changed paths to the set of governing files by
//! walking each directory upward, memoizing per directory so shared
//! directories cost one host round-trip.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::host::{HostError, SourceHost};

pub const OWNERS_FILE_NAME: &str = "owners.txt";

const PREFIX_COMMENT: char = ';';
const PREFIX_NO_NOTIFY: char = '*';
const TEAM_KEYWORD: &str = "TEAM:";

/// Owners and team references declared by one or more ownership files.
///
/// Derived per resolution, never persisted. A team reference is never itself
/// a reviewer; it must be expanded into member aliases before selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewerGroup {
    pub owners: BTreeSet<String>,
    pub teams: BTreeSet<String>,
}

/// Parse the raw text of one ownership file.
///
/// Deliberately total: malformed or empty input yields an empty group, never
/// an error. Unknown aliases surface later as directory-lookup failures.
pub fn parse_owners_file(content: &str) -> ReviewerGroup {
    let mut group = ReviewerGroup::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(PREFIX_COMMENT) {
            // A comment, unless it declares a team: "; TEAM: <name>".
            if let Some(team) = rest.trim_start().strip_prefix(TEAM_KEYWORD) {
                let team = team.trim();
                if !team.is_empty() {
                    group.teams.insert(team.to_string());
                }
            }
            continue;
        }

        if let Some(owner) = line.strip_prefix(PREFIX_NO_NOTIFY) {
            // No-notify marker: still an owner for selection purposes.
            let owner = owner.trim();
            if !owner.is_empty() {
                group.owners.insert(owner.to_string());
            }
            continue;
        }

        group.owners.insert(line.to_string());
    }

    group
}

/// The directory containing `path`, with `/` as the repository root.
fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn owners_path_in(dir: &str) -> String {
    if dir == "/" {
        format!("/{OWNERS_FILE_NAME}")
    } else {
        format!("{dir}/{OWNERS_FILE_NAME}")
    }
}

/// Fetch every changed path across the cumulative diff of a pull request.
///
/// The latest iteration carries the cumulative change list; it is paged
/// through until the host reports a zero continuation token. A token that
/// fails to advance is reported as a pagination error rather than looping.
pub async fn get_all_changed_paths(
    host: &dyn SourceHost,
    repo_id: &str,
    pr_id: u64,
) -> Result<Vec<String>, HostError> {
    let iteration = host.latest_iteration(repo_id, pr_id).await?;

    let mut paths = Vec::new();
    let mut skip = 0u32;
    loop {
        let page = host
            .list_changed_paths(repo_id, pr_id, iteration, skip)
            .await?;
        paths.extend(page.paths);

        if page.next_skip == 0 {
            return Ok(paths);
        }
        if page.next_skip <= skip {
            return Err(HostError::Pagination(format!(
                "continuation token did not advance ({} -> {})",
                skip, page.next_skip
            )));
        }
        skip = page.next_skip;
        debug!(skip, "fetching next page of changed paths");
    }
}

/// Resolve the governing ownership groups for a pull request.
///
/// Returns one `ReviewerGroup` per distinct governing `owners.txt`. A path
/// with no governing file contributes nothing; that is "no owners declared",
/// not an error.
pub async fn resolve_required_groups(
    host: &dyn SourceHost,
    repo_id: &str,
    pr_id: u64,
) -> Result<Vec<ReviewerGroup>, HostError> {
    let changed_paths = get_all_changed_paths(host, repo_id, pr_id).await?;

    // dir -> path of its governing owners file, if any
    let mut governing: HashMap<String, Option<String>> = HashMap::new();
    // owners file path -> parsed group, deduplicated across directories
    let mut groups: BTreeMap<String, ReviewerGroup> = BTreeMap::new();

    for path in &changed_paths {
        let dir = parent_dir(path);
        if governing.contains_key(dir) {
            continue;
        }

        // A memoized hit always refers to a file parsed earlier in this
        // call, so only fresh finds carry content to parse.
        if let Some((owners_path, content)) =
            find_governing_owners_file(host, repo_id, dir, &mut governing).await?
        {
            groups
                .entry(owners_path)
                .or_insert_with(|| parse_owners_file(&content));
        }
    }

    Ok(groups.into_values().collect())
}

/// Walk from `dir` toward the root looking for the nearest `owners.txt`.
///
/// Every directory visited along the way is recorded in the memo, so later
/// paths sharing an ancestor resolve without another round-trip. Directory
/// parents strictly shorten, so the walk always terminates. Returns the
/// found file's path and content only when the file was freshly fetched; a
/// memo hit means the caller already parsed it.
async fn find_governing_owners_file(
    host: &dyn SourceHost,
    repo_id: &str,
    dir: &str,
    memo: &mut HashMap<String, Option<String>>,
) -> Result<Option<(String, String)>, HostError> {
    let mut visited = Vec::new();
    let mut current = dir.to_string();

    let found = loop {
        if let Some(cached) = memo.get(&current) {
            break cached.clone().map(|path| (path, None));
        }
        visited.push(current.clone());

        match host
            .get_file_content(repo_id, &owners_path_in(&current))
            .await
        {
            Ok(content) => break Some((owners_path_in(&current), Some(content))),
            Err(HostError::NotFound) => {
                if current == "/" {
                    break None;
                }
                current = parent_dir(&current).to_string();
            }
            Err(e) => return Err(e),
        }
    };

    let owners_path = found.as_ref().map(|(path, _)| path.clone());
    for dir in visited {
        memo.insert(dir, owners_path.clone());
    }

    Ok(found.and_then(|(path, content)| content.map(|c| (path, c))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_owners_file() {
        let content = "; TEAM: Test Team\n*noNotifyOwner\nplainOwner\n;this is a comment\n";
        let group = parse_owners_file(content);

        assert_eq!(group.teams.len(), 1);
        assert!(group.teams.contains("Test Team"));
        assert_eq!(group.owners.len(), 2);
        assert!(group.owners.contains("noNotifyOwner"));
        assert!(group.owners.contains("plainOwner"));
    }

    #[test]
    fn test_parse_team_prefix_without_space() {
        // The team keyword is recognized with or without whitespace after
        // the comment character.
        let group = parse_owners_file(";TEAM: Alpha\n*bob\ncarol\n;comment\n\n");

        assert_eq!(group.teams, BTreeSet::from(["Alpha".to_string()]));
        assert_eq!(
            group.owners,
            BTreeSet::from(["bob".to_string(), "carol".to_string()])
        );
    }

    #[test]
    fn test_parse_empty_input() {
        let group = parse_owners_file("");
        assert!(group.owners.is_empty());
        assert!(group.teams.is_empty());
    }

    #[test]
    fn test_parse_comments_and_blanks_only() {
        let group = parse_owners_file(";comment\n\n   \n; another\n");
        assert!(group.owners.is_empty());
        assert!(group.teams.is_empty());
    }

    #[test]
    fn test_parse_never_fails_on_garbage() {
        let group = parse_owners_file("\u{0}\u{1}binary\r\n;;;\n***\n");
        // Control characters are just an (unresolvable) alias; the parser
        // stays total.
        assert!(group.teams.is_empty());
    }

    #[test]
    fn test_parse_whitespace_trimmed() {
        let group = parse_owners_file("   alice   \n\t*bob\t\n");
        assert!(group.owners.contains("alice"));
        assert!(group.owners.contains("bob"));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/src/util/file.rs"), "/src/util");
        assert_eq!(parent_dir("/src/util"), "/src");
        assert_eq!(parent_dir("/file.rs"), "/");
        assert_eq!(parent_dir("/"), "/");
    }

    #[test]
    fn test_owners_path_in() {
        assert_eq!(owners_path_in("/"), "/owners.txt");
        assert_eq!(owners_path_in("/src"), "/src/owners.txt");
    }
}
