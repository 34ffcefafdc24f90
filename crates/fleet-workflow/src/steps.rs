//! Built-in step types (§4.8 StepRegistry minimum set). Each handler
//! receives its already-templated config and the run's live context,
//! and may read or write fields on the context as its contract
//! documents.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command exited non-zero (code {0:?})")]
    CommandFailed(Option<i32>),
    #[error("step type '{0}' is not implemented")]
    Unimplemented(String),
    #[error("{0}")]
    Other(String),
}

pub type StepResult<T> = Result<T, StepError>;

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, config: &Value, context: &mut Value) -> StepResult<()>;
}

fn required_str<'a>(config: &'a Value, field: &str) -> StepResult<&'a str> {
    config
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StepError::MissingField(field.to_string()))
}

fn set_context(context: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = context {
        map.insert(key.to_string(), value);
    }
}

/// A sink workflow steps use to surface alerts (the `alert` step and,
/// indirectly, any step that wants to notify on partial failure). The
/// agent binary supplies the real implementation wired to the transport.
pub trait AlertSink: Send + Sync {
    fn alert(&self, level: &str, message: &str);
}

pub struct NoopAlertSink;
impl AlertSink for NoopAlertSink {
    fn alert(&self, _level: &str, _message: &str) {}
}

// ─── move-file ──────────────────────────────────────────────────────────

pub struct MoveFileStep;

#[async_trait]
impl StepHandler for MoveFileStep {
    async fn execute(&self, config: &Value, _context: &mut Value) -> StepResult<()> {
        let source = required_str(config, "source")?;
        let destination = required_str(config, "destination")?;
        if let Some(parent) = Path::new(destination).parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(source, destination) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                std::fs::copy(source, destination)?;
                std::fs::remove_file(source)?;
                Ok(())
            }
            Err(e) => Err(StepError::Io(e)),
        }
    }
}

/// `EXDEV` (cross-device rename) errno, without pulling in the `libc`
/// crate for a single constant.
fn libc_exdev() -> i32 {
    18
}

// ─── copy-file ──────────────────────────────────────────────────────────

pub struct CopyFileStep;

#[async_trait]
impl StepHandler for CopyFileStep {
    async fn execute(&self, config: &Value, _context: &mut Value) -> StepResult<()> {
        let source = required_str(config, "source")?;
        let destination = required_str(config, "destination")?;
        if let Some(parent) = Path::new(destination).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, destination)?;
        Ok(())
    }
}

// ─── delete-file ────────────────────────────────────────────────────────

pub struct DeleteFileStep;

#[async_trait]
impl StepHandler for DeleteFileStep {
    async fn execute(&self, config: &Value, _context: &mut Value) -> StepResult<()> {
        let path = required_str(config, "path")?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}

// ─── run-command ────────────────────────────────────────────────────────

pub struct RunCommandStep;

#[async_trait]
impl StepHandler for RunCommandStep {
    async fn execute(&self, config: &Value, context: &mut Value) -> StepResult<()> {
        let command = required_str(config, "command")?;
        let extra_args = config
            .get("arguments")
            .or_else(|| config.get("args"))
            .and_then(Value::as_str);
        let full_command = match extra_args {
            Some(args) => format!("{command} {args}"),
            None => command.to_string(),
        };
        let working_dir = config.get("workingDir").and_then(Value::as_str);

        set_context(context, "command", Value::String(full_command.clone()));

        let mut cmd = shell_command(&full_command);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();

        set_context(
            context,
            "output",
            Value::String(if stdout.is_empty() { stderr.clone() } else { stdout }),
        );
        set_context(
            context,
            "exitCode",
            exit_code.map(Value::from).unwrap_or(Value::Null),
        );

        if !output.status.success() {
            set_context(context, "commandError", Value::String(stderr));
            return Err(StepError::CommandFailed(exit_code));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

// ─── alert ──────────────────────────────────────────────────────────────

pub struct AlertStep {
    pub sink: std::sync::Arc<dyn AlertSink>,
}

#[async_trait]
impl StepHandler for AlertStep {
    async fn execute(&self, config: &Value, _context: &mut Value) -> StepResult<()> {
        let message = required_str(config, "message")?;
        let level = config.get("level").and_then(Value::as_str).unwrap_or("info");
        self.sink.alert(level, message);
        Ok(())
    }
}

// ─── unimplemented fallback ──────────────────────────────────────────────

pub struct UnimplementedStep {
    pub type_name: String,
}

#[async_trait]
impl StepHandler for UnimplementedStep {
    async fn execute(&self, _config: &Value, _context: &mut Value) -> StepResult<()> {
        warn!(step_type = %self.type_name, "unregistered step type invoked");
        Err(StepError::Unimplemented(self.type_name.clone()))
    }
}

// ─── s3-upload (optional) ────────────────────────────────────────────────

#[cfg(feature = "s3")]
pub struct S3UploadStep;

#[cfg(feature = "s3")]
#[async_trait]
impl StepHandler for S3UploadStep {
    async fn execute(&self, config: &Value, _context: &mut Value) -> StepResult<()> {
        use aws_credential_types::Credentials;
        use aws_sdk_s3::config::Region;
        use aws_sdk_s3::primitives::ByteStream;

        let file_path = required_str(config, "filePath")?;
        let bucket = required_str(config, "bucket")?;
        let s3_key = required_str(config, "s3Key")?;
        let prefix = config.get("prefix").and_then(Value::as_str).unwrap_or("");
        let region = required_str(config, "region")?;
        let access_key_id = required_str(config, "accessKeyId")?;
        let secret_access_key = required_str(config, "secretAccessKey")?;

        let key = if prefix.is_empty() {
            s3_key.to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), s3_key)
        };

        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "fleet-workflow-s3-upload",
        );
        let shared_config = aws_config::SdkConfig::builder()
            .region(Region::new(region.to_string()))
            .credentials_provider(aws_credential_types::provider::SharedCredentialsProvider::new(
                credentials,
            ))
            .build();
        let client = aws_sdk_s3::Client::new(&shared_config);

        let body = ByteStream::from_path(file_path)
            .await
            .map_err(|e| StepError::Other(e.to_string()))?;

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| StepError::Other(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn move_file_step_renames_within_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        let destination = dir.path().join("nested/b.txt");
        std::fs::write(&source, "hello").unwrap();

        let step = MoveFileStep;
        let mut ctx = json!({});
        step.execute(
            &json!({"source": source.to_str().unwrap(), "destination": destination.to_str().unwrap()}),
            &mut ctx,
        )
        .await
        .unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "hello");
    }

    #[tokio::test]
    async fn copy_file_step_preserves_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        let destination = dir.path().join("copy/b.txt");
        std::fs::write(&source, "data").unwrap();

        CopyFileStep
            .execute(
                &json!({"source": source.to_str().unwrap(), "destination": destination.to_str().unwrap()}),
                &mut json!({}),
            )
            .await
            .unwrap();

        assert!(source.exists());
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "data");
    }

    #[tokio::test]
    async fn run_command_step_populates_context_on_success() {
        let mut ctx = json!({});
        RunCommandStep
            .execute(&json!({"command": "echo hello"}), &mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx["output"], "hello");
        assert_eq!(ctx["exitCode"], 0);
    }

    #[tokio::test]
    async fn run_command_step_sets_command_error_on_failure() {
        let mut ctx = json!({});
        let result = RunCommandStep
            .execute(&json!({"command": "sh -c 'exit 3'"}), &mut ctx)
            .await;
        assert!(matches!(result, Err(StepError::CommandFailed(Some(3)))));
        assert_eq!(ctx["exitCode"], 3);
    }

    #[tokio::test]
    async fn missing_required_field_is_reported() {
        let result = DeleteFileStep.execute(&json!({}), &mut json!({})).await;
        assert!(matches!(result, Err(StepError::MissingField(f)) if f == "path"));
    }
}
