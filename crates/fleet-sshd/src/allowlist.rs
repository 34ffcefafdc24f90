//! Pubkey allowlist matching and SFTP path allowlisting (§4.9).

use russh_keys::key::PublicKey;
use std::path::{Path, PathBuf};

/// Parse each configured `authorizedSSHKeys` line as an OpenSSH public key
/// and keep only the ones that parse. Malformed lines are logged and
/// skipped rather than rejecting the whole config.
pub fn parse_allowed_keys(lines: &[String]) -> Vec<PublicKey> {
    lines
        .iter()
        .filter_map(|line| match russh_keys::parse_public_key_base64(key_material(line)) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(line = %line, error = %e, "skipping unparsable authorized key");
                None
            }
        })
        .collect()
}

/// An `authorized_keys` line is `<type> <base64> [comment]`; the parser
/// wants only the base64 material.
fn key_material(line: &str) -> &str {
    line.split_whitespace().nth(1).unwrap_or(line)
}

pub fn is_allowed(offered: &PublicKey, allowlist: &[PublicKey]) -> bool {
    allowlist.iter().any(|k| k.fingerprint() == offered.fingerprint())
}

/// Resolve `requested` against `roots`, rejecting escapes. `roots` must
/// be absolute, existing directories. An empty `roots` denies everything
/// (§4.9: "if the allowlist is empty, all SFTP file operations are
/// denied").
pub fn resolve_allowed_path(roots: &[PathBuf], requested: &str) -> Option<PathBuf> {
    if roots.is_empty() {
        return None;
    }
    if requested.contains("..") {
        return None;
    }

    for root in roots {
        let candidate = root.join(requested.trim_start_matches('/'));
        let canonical_root = root.canonicalize().ok()?;
        // The file may not exist yet (a `put`); canonicalize the parent
        // and re-append the filename so creation-time validation still
        // works.
        let canonical = match candidate.canonicalize() {
            Ok(c) => c,
            Err(_) => {
                let parent = candidate.parent()?;
                let filename = candidate.file_name()?;
                parent.canonicalize().ok()?.join(filename)
            }
        };
        if canonical.starts_with(&canonical_root) {
            return Some(canonical);
        }
    }
    None
}

pub fn canonicalize_roots(paths: &[String]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter_map(|p| {
            let path = Path::new(p);
            match path.canonicalize() {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(path = %p, error = %e, "skipping unresolvable sftp root");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_roots_denies_everything() {
        assert!(resolve_allowed_path(&[], "anything.txt").is_none());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        assert!(resolve_allowed_path(&roots, "../escape.txt").is_none());
    }

    #[test]
    fn path_within_root_resolves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let resolved = resolve_allowed_path(&roots, "a.txt").unwrap();
        assert_eq!(resolved, dir.path().join("a.txt").canonicalize().unwrap());
    }

    #[test]
    fn nonexistent_file_under_root_still_resolves_for_put() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let resolved = resolve_allowed_path(&roots, "new-upload.bin").unwrap();
        assert_eq!(resolved, dir.path().join("new-upload.bin"));
    }
}
