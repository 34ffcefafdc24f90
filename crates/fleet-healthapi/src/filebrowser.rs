//! File-browser endpoints (§4.10), gated on `fileBrowserSettings.enabled`.
//! Path resolution follows the same allowlist-then-canonicalize pattern
//! as the agent's inbound SFTP subsystem: an empty allowlist denies
//! everything, `..` is rejected outright, and a not-yet-existing upload
//! target is resolved via its parent directory.

use crate::{browser_enabled, browser_roots, max_upload_bytes, AppState, PathQuery};
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Resolve `requested` (a path relative to one of `roots`) to a
/// canonical path under that root. `requested` may not yet exist (an
/// upload target); its parent is canonicalized instead in that case.
pub fn resolve_allowed_path(roots: &[PathBuf], requested: &str) -> Option<PathBuf> {
    if roots.is_empty() || requested.contains("..") {
        return None;
    }

    for root in roots {
        let Ok(canonical_root) = root.canonicalize() else {
            continue;
        };
        let candidate = root.join(requested.trim_start_matches('/'));
        let canonical = match candidate.canonicalize() {
            Ok(c) => c,
            Err(_) => {
                let Some(parent) = candidate.parent() else {
                    continue;
                };
                let Ok(parent) = parent.canonicalize() else {
                    continue;
                };
                let Some(filename) = candidate.file_name() else {
                    continue;
                };
                parent.join(filename)
            }
        };
        if canonical.starts_with(&canonical_root) {
            return Some(canonical);
        }
    }
    None
}

pub fn list_dir(dir: &Path) -> std::io::Result<Vec<DirEntryInfo>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn forbidden() -> axum::response::Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": "file browser disabled or path not allowed" }))).into_response()
}

pub async fn browse(State(state): State<Arc<AppState>>, Query(q): Query<PathQuery>) -> axum::response::Response {
    if !browser_enabled(&state) {
        return forbidden();
    }
    let roots = browser_roots(&state);
    let requested = q.path.unwrap_or_default();
    let Some(resolved) = resolve_allowed_path(&roots, &requested) else {
        return forbidden();
    };
    match list_dir(&resolved) {
        Ok(entries) => Json(json!({ "path": requested, "entries": entries })).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

pub async fn download(State(state): State<Arc<AppState>>, Query(q): Query<PathQuery>) -> axum::response::Response {
    if !browser_enabled(&state) {
        return forbidden();
    }
    let roots = browser_roots(&state);
    let Some(path) = q.path.as_deref().and_then(|p| resolve_allowed_path(&roots, p)) else {
        return forbidden();
    };
    match std::fs::read(&path) {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

pub async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> axum::response::Response {
    if !browser_enabled(&state) {
        return forbidden();
    }
    let roots = browser_roots(&state);
    let max_bytes = max_upload_bytes(&state);

    let field = match multipart.next_field().await {
        Ok(Some(field)) => field,
        _ => return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing file field" }))).into_response(),
    };
    let Some(name) = field.file_name().map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing filename" }))).into_response();
    };
    let Some(destination) = resolve_allowed_path(&roots, &name) else {
        return forbidden();
    };

    let data = match field.bytes().await {
        Ok(d) => d,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    if data.len() as u64 > max_bytes {
        return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": "upload exceeds configured maximum" }))).into_response();
    }

    match std::fs::write(&destination, &data) {
        Ok(()) => Json(json!({ "ok": true, "path": destination.display().to_string() })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct MkdirRequest {
    pub path: String,
}

pub async fn mkdir(State(state): State<Arc<AppState>>, Json(body): Json<MkdirRequest>) -> axum::response::Response {
    if !browser_enabled(&state) {
        return forbidden();
    }
    let roots = browser_roots(&state);
    let Some(resolved) = resolve_allowed_path(&roots, &body.path) else {
        return forbidden();
    };
    match std::fs::create_dir_all(&resolved) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

pub async fn remove(State(state): State<Arc<AppState>>, Query(q): Query<PathQuery>) -> axum::response::Response {
    if !browser_enabled(&state) {
        return forbidden();
    }
    let roots = browser_roots(&state);
    let Some(resolved) = q.path.as_deref().and_then(|p| resolve_allowed_path(&roots, p)) else {
        return forbidden();
    };
    let result = if resolved.is_dir() {
        std::fs::remove_dir_all(&resolved)
    } else {
        std::fs::remove_file(&resolved)
    };
    match result {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_roots_denies_everything() {
        assert!(resolve_allowed_path(&[], "a.txt").is_none());
    }

    #[test]
    fn parent_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        assert!(resolve_allowed_path(&roots, "../escape.txt").is_none());
    }

    #[test]
    fn existing_path_under_root_resolves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let resolved = resolve_allowed_path(&roots, "a.txt").unwrap();
        assert_eq!(resolved, dir.path().join("a.txt").canonicalize().unwrap());
    }

    #[test]
    fn nonexistent_upload_target_resolves_via_parent() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let resolved = resolve_allowed_path(&roots, "new.bin").unwrap();
        assert_eq!(resolved, dir.path().join("new.bin"));
    }

    #[test]
    fn list_dir_sorts_entries_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let entries = list_dir(dir.path()).unwrap();
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].name, "b.txt");
    }
}
