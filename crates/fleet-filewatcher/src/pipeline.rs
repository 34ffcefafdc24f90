//! The stability probe and the ordered per-file operation pipeline
//! (§4.7 "File operations").

use chrono::Utc;
use fleet_config::types::FileWatcherRule;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file never became stable after {0} attempts")]
    NeverStable(u32),
    #[error("program {0:?} exited with status {1:?}")]
    ProgramFailed(String, Option<i32>),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Dispatches a `WF:<name>` post-program token into a synchronous workflow
/// run. The agent binary supplies the real implementation wired to the
/// `WorkflowExecutor`; this crate only needs the seam.
#[async_trait::async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(&self, workflow_name: &str, context: Value);
}

/// Probe `path` until its size and mtime are unchanged across a ≥500ms
/// window and it can be opened for read-write (or read-only, if the
/// filesystem denies write access — permission alone is not a write
/// lock), or give up after `max_retries`.
pub async fn wait_until_stable(
    path: &Path,
    max_retries: u32,
    delay_retry_ms: u64,
) -> PipelineResult<()> {
    const STABILITY_WINDOW: Duration = Duration::from_millis(500);

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe_once(path, STABILITY_WINDOW).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                debug!(path = %path.display(), error = %e, "stability probe failed, retrying");
            }
        }
        if attempts >= max_retries {
            return Err(PipelineError::NeverStable(max_retries));
        }
        tokio::time::sleep(Duration::from_millis(delay_retry_ms)).await;
    }
}

async fn probe_once(path: &Path, window: Duration) -> std::io::Result<bool> {
    let before = std::fs::metadata(path)?;
    tokio::time::sleep(window).await;
    let after = std::fs::metadata(path)?;

    let size_stable = before.len() == after.len();
    let mtime_stable = before.modified().ok() == after.modified().ok();
    if !size_stable || !mtime_stable {
        return Ok(false);
    }

    let openable = OpenOptions::new().write(true).open(path).is_ok()
        || OpenOptions::new().read(true).open(path).is_ok();
    Ok(openable)
}

/// Apply `{filename}`, `{name}`, `{ext}`, `{timestamp}` placeholders to a
/// rename template. If the template has none and `insert_timestamp` is
/// set, a timestamp is appended ahead of the extension.
fn render_name(template: Option<&str>, insert_timestamp: bool, source: &Path) -> String {
    let filename = source
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = source
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

    let Some(template) = template else {
        return if insert_timestamp {
            if ext.is_empty() {
                format!("{stem}_{timestamp}")
            } else {
                format!("{stem}_{timestamp}.{ext}")
            }
        } else {
            filename
        };
    };

    let has_placeholder = template.contains('{');
    let rendered = template
        .replace("{filename}", &filename)
        .replace("{name}", &stem)
        .replace("{ext}", &ext)
        .replace("{timestamp}", &timestamp);

    if !has_placeholder && insert_timestamp {
        format!("{rendered}_{timestamp}")
    } else {
        rendered
    }
}

/// Step 2: `copyToDir/<fileName-after-rename>`.
pub fn compute_destination(rule: &FileWatcherRule, source: &Path) -> Option<PathBuf> {
    let copy_to_dir = rule.copy_to_dir.as_deref()?;
    let rendered = render_name(
        rule.rename_file_to.as_deref(),
        rule.insert_timestamp,
        source,
    );
    Some(Path::new(copy_to_dir).join(rendered))
}

async fn run_program(token: &str) -> PipelineResult<()> {
    #[cfg(unix)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(token);
        c
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(token);
        c
    };

    let status = cmd.status().await?;
    if !status.success() {
        return Err(PipelineError::ProgramFailed(token.to_string(), status.code()));
    }
    Ok(())
}

/// Run the 9-step ordered file operation pipeline for a single matched
/// file. `dispatcher` is consulted only if `execProg` begins with `WF:`.
pub async fn run(
    rule: &FileWatcherRule,
    source: &Path,
    dispatcher: Option<&(dyn WorkflowDispatcher)>,
) -> PipelineResult<()> {
    // 1. pre-program
    if let Some(prog) = &rule.exec_prog_before {
        if let Err(e) = run_program(prog).await {
            warn!(rule = %rule.id, error = %e, "execProgBefore failed, continuing");
        }
    }

    let op_result = run_file_operation(rule, source).await;

    // 7. on any op error, run execProgError.
    if let Err(e) = &op_result {
        if let Some(prog) = &rule.exec_prog_error {
            if let Err(err) = run_program(prog).await {
                warn!(rule = %rule.id, error = %err, "execProgError itself failed");
            }
        }
        return Err(clone_err(e));
    }
    let final_path = op_result.unwrap();

    // 8. post-program / workflow dispatch.
    if let Some(prog) = &rule.exec_prog {
        if let Some(name) = prog.strip_prefix("WF:") {
            if let Some(dispatcher) = dispatcher {
                let context = json!({
                    "trigger": "filewatcher",
                    "file": final_path.display().to_string(),
                    "fileName": final_path.file_name().and_then(|s| s.to_str()).unwrap_or_default(),
                    "directory": final_path.parent().map(|p| p.display().to_string()).unwrap_or_default(),
                });
                dispatcher.dispatch(name, context).await;
            } else {
                warn!(rule = %rule.id, workflow = %name, "no workflow dispatcher configured, skipping WF: post-program");
            }
        } else if let Err(e) = run_program(prog).await {
            warn!(rule = %rule.id, error = %e, "execProg failed");
        }
    }

    // 9. delayNextFile.
    let delay = rule.processing_options.delay_next_file;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    Ok(())
}

fn clone_err(e: &PipelineError) -> PipelineError {
    match e {
        PipelineError::Io(io) => PipelineError::Io(std::io::Error::new(io.kind(), io.to_string())),
        PipelineError::NeverStable(n) => PipelineError::NeverStable(*n),
        PipelineError::ProgramFailed(p, c) => PipelineError::ProgramFailed(p.clone(), *c),
    }
}

async fn run_file_operation(rule: &FileWatcherRule, source: &Path) -> PipelineResult<PathBuf> {
    let Some(destination) = compute_destination(rule, source) else {
        // No copyToDir configured: nothing to move/copy, the rule only
        // runs its pre/post programs against the matched file in place.
        return Ok(source.to_path_buf());
    };
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // 3. backupToDir.
    if let Some(backup_dir) = &rule.backup_to_dir {
        std::fs::create_dir_all(backup_dir)?;
        let filename = source.file_name().unwrap_or_default();
        std::fs::copy(source, Path::new(backup_dir).join(filename))?;
    }

    // 4. overwrite check.
    if destination.exists() && !rule.overwrite {
        debug!(destination = %destination.display(), "destination exists and overwrite=false, skipping");
        return Ok(source.to_path_buf());
    }

    // 5/6. temp-extension staging, then move or copy.
    let staging = match &rule.copy_temp_extension {
        Some(ext) => {
            let mut staged = destination.clone().into_os_string();
            staged.push(ext);
            PathBuf::from(staged)
        }
        None => destination.clone(),
    };

    match rule.copy_file_option {
        22 => {
            std::fs::copy(source, &staging)?;
            if rule.remove_after_copy {
                std::fs::remove_file(source)?;
            }
        }
        _ => {
            move_file(source, &staging)?;
        }
    }

    if staging != destination {
        std::fs::rename(&staging, &destination)?;
    }

    Ok(destination)
}

fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(18) => {
            std::fs::copy(source, destination)?;
            std::fs::remove_file(source)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::types::{ProcessingOptions, TimeRestrictions, WatchMode};

    fn base_rule(id: &str) -> FileWatcherRule {
        FileWatcherRule {
            id: id.into(),
            enabled: true,
            watch_mode: WatchMode::Absolute,
            dir_reg_ex: "/tmp".into(),
            file_reg_ex: String::new(),
            content_reg_ex: None,
            operations: vec![],
            time_restrictions: TimeRestrictions::default(),
            processing_options: ProcessingOptions::default(),
            exec_prog_before: None,
            copy_to_dir: None,
            rename_file_to: None,
            insert_timestamp: false,
            backup_to_dir: None,
            overwrite: false,
            copy_temp_extension: None,
            copy_file_option: 21,
            remove_after_copy: false,
            exec_prog_error: None,
            exec_prog: None,
        }
    }

    #[test]
    fn render_name_applies_placeholders() {
        let source = Path::new("/inbox/report.csv");
        let rendered = render_name(Some("{name}-archived.{ext}"), false, source);
        assert_eq!(rendered, "report-archived.csv");
    }

    #[test]
    fn render_name_falls_back_to_filename_with_no_template() {
        let source = Path::new("/inbox/report.csv");
        let rendered = render_name(None, false, source);
        assert_eq!(rendered, "report.csv");
    }

    #[tokio::test]
    async fn move_pipeline_moves_file_into_copy_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in/a.txt");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, "payload").unwrap();

        let mut rule = base_rule("r1");
        rule.copy_to_dir = Some(dir.path().join("out").to_str().unwrap().to_string());

        run(&rule, &source, None).await.unwrap();

        assert!(!source.exists());
        let dest = dir.path().join("out/a.txt");
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn copy_pipeline_preserves_source_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, "payload").unwrap();

        let mut rule = base_rule("r1");
        rule.copy_to_dir = Some(dir.path().join("out").to_str().unwrap().to_string());
        rule.copy_file_option = 22;

        run(&rule, &source, None).await.unwrap();

        assert!(source.exists());
        let dest = dir.path().join("out/a.txt");
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn overwrite_false_skips_when_destination_exists() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, "new").unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join("a.txt"), "old").unwrap();

        let mut rule = base_rule("r1");
        rule.copy_to_dir = Some(out_dir.to_str().unwrap().to_string());
        rule.overwrite = false;
        rule.copy_file_option = 22;

        run(&rule, &source, None).await.unwrap();

        assert_eq!(std::fs::read_to_string(out_dir.join("a.txt")).unwrap(), "old");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn backup_to_dir_copies_original_before_move() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, "payload").unwrap();

        let mut rule = base_rule("r1");
        rule.copy_to_dir = Some(dir.path().join("out").to_str().unwrap().to_string());
        rule.backup_to_dir = Some(dir.path().join("backup").to_str().unwrap().to_string());

        run(&rule, &source, None).await.unwrap();

        let backup = dir.path().join("backup/a.txt");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "payload");
    }

    #[tokio::test]
    async fn stability_probe_succeeds_for_quiescent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "stable").unwrap();
        wait_until_stable(&path, 3, 10).await.unwrap();
    }
}
