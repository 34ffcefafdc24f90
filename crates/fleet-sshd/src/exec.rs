//! The `exec` subsystem (§4.9): runs the requested command directly,
//! never through a shell, so a client cannot smuggle in pipelines or
//! redirection it wasn't explicitly granted.

use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
}

/// Split `command` on whitespace; `argv[0]` is the binary, the rest are
/// passed as literal arguments (no shell interpretation of quoting,
/// globs, or pipes).
pub async fn run(command: &str) -> std::io::Result<ExecOutcome> {
    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return Ok(ExecOutcome {
            stdout: Vec::new(),
            stderr: b"empty command".to_vec(),
            exit_code: 127,
        });
    };
    let args: Vec<&str> = tokens.collect();

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout).await?;
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_end(&mut stderr).await?;
    }

    let status = child.wait().await?;
    Ok(ExecOutcome {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_binary_directly_without_shell_expansion() {
        let outcome = run("echo hello").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hello");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn shell_metacharacters_are_passed_as_literal_arguments() {
        // `echo` receives `$HOME` as a literal argv entry since there is
        // no shell to expand it.
        let outcome = run("echo $HOME").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "$HOME");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let outcome = run("false").await.unwrap();
        assert_ne!(outcome.exit_code, 0);
    }
}
