//! Directory discovery for the two watch modes (§4.7).
//!
//! `absolute` mode treats `dirRegEx` as a literal path unless it looks
//! like a regex, in which case every root (`/` on this platform; no
//! Windows drive enumeration since the agent only ships for Unix-like
//! hosts) is scanned to a bounded depth. `pattern` mode walks under the
//! global `scanDir` instead, matching each candidate directory's
//! relative path or basename.

use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_ABSOLUTE_DEPTH: usize = 5;
pub const DEFAULT_PATTERN_DEPTH: usize = 10;

const SYSTEM_DIRS: &[&str] = &["/proc", "/sys", "/dev", "/run", "/tmp/.X11-unix"];

fn looks_like_regex(s: &str) -> bool {
    s.chars().any(|c| "\\^$.|?*+()[]{}".contains(c))
}

fn is_system_dir(path: &Path) -> bool {
    SYSTEM_DIRS.iter().any(|sys| path.starts_with(sys))
}

/// `absolute` mode discovery: literal path fast-path, or a bounded scan
/// from filesystem roots matching `dir_reg_ex` against each candidate's
/// full path.
pub fn discover_absolute(dir_reg_ex: &str, max_depth: usize) -> Vec<PathBuf> {
    if !looks_like_regex(dir_reg_ex) {
        return vec![PathBuf::from(dir_reg_ex)];
    }

    let regex = match Regex::new(dir_reg_ex) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    let mut matches = Vec::new();
    let root = Path::new("/");
    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| !is_system_dir(e.path()))
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() && regex.is_match(&entry.path().display().to_string()) {
            matches.push(entry.path().to_path_buf());
        }
    }
    matches
}

/// `pattern` mode discovery: relative to `scan_dir`. Absent a
/// `file_reg_ex`-style directory filter, the root itself is watched.
pub fn discover_pattern(
    scan_dir: &Path,
    dir_reg_ex: Option<&str>,
    max_depth: usize,
) -> Vec<PathBuf> {
    let Some(pattern) = dir_reg_ex.filter(|p| !p.is_empty()) else {
        return vec![scan_dir.to_path_buf()];
    };
    let regex = match Regex::new(pattern) {
        Ok(r) => r,
        Err(_) => return vec![scan_dir.to_path_buf()],
    };

    let mut matches = Vec::new();
    for entry in WalkDir::new(scan_dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(scan_dir)
            .unwrap_or(entry.path())
            .display()
            .to_string();
        let basename = entry
            .file_name()
            .to_str()
            .unwrap_or_default()
            .to_string();
        if regex.is_match(&relative) || regex.is_match(&basename) {
            matches.push(entry.path().to_path_buf());
        }
    }

    if matches.is_empty() {
        vec![scan_dir.to_path_buf()]
    } else {
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_path_with_no_regex_metacharacters_is_used_as_is() {
        let dirs = discover_absolute("/var/data/inbox", DEFAULT_ABSOLUTE_DEPTH);
        assert_eq!(dirs, vec![PathBuf::from("/var/data/inbox")]);
    }

    #[test]
    fn pattern_mode_falls_back_to_scan_dir_when_no_filter() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = discover_pattern(dir.path(), None, DEFAULT_PATTERN_DEPTH);
        assert_eq!(dirs, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn pattern_mode_matches_subdirectory_basename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("inbox/pending")).unwrap();
        std::fs::create_dir_all(dir.path().join("outbox")).unwrap();

        let dirs = discover_pattern(dir.path(), Some("pending$"), DEFAULT_PATTERN_DEPTH);
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with("pending"));
    }
}
