use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::OnceLock,
};

use anyhow::anyhow;
use tokio::process::Command;

mod output;

pub use output::*;

/// Commands are run directly, and cannot include '&&'
pub async fn run_standard_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let lexed = if let Some(lexed) = shlex::split(command)
    && !lexed.is_empty()
  {
    lexed
  } else {
    return CommandOutput::from_err(std::io::Error::other(
      "Command lexed into empty args",
    ));
  };

  let mut cmd = Command::new(&lexed[0]);

  cmd
    .args(&lexed[1..])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

fn shell() -> &'static str {
  static DEFAULT_SHELL: OnceLock<String> = OnceLock::new();
  DEFAULT_SHELL.get_or_init(|| {
    if PathBuf::from("/bin/bash").exists()
      || PathBuf::from("/usr/bin/bash").exists()
    {
      String::from("bash")
    } else {
      String::from("sh")
    }
  })
}

/// Commands are wrapped in the shell, and can include '&&' and pipes.
pub async fn run_shell_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut cmd = Command::new(shell());

  cmd
    .args(["-c", command])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

/// Run a command with per-call environment variables, direct exec.
pub async fn run_command_with_env(
  command: &str,
  envs: &[(&str, &str)],
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let lexed = if let Some(lexed) = shlex::split(command)
    && !lexed.is_empty()
  {
    lexed
  } else {
    return CommandOutput::from_err(std::io::Error::other(
      "Command lexed into empty args",
    ));
  };

  let mut cmd = Command::new(&lexed[0]);

  cmd
    .args(&lexed[1..])
    .envs(envs.iter().copied())
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

/// Run a command for a named stage, tracing the invocation and
/// converting failure into an error carrying the combined output.
pub async fn run_stage_command(
  stage: &str,
  command: &str,
  path: impl Into<Option<&Path>>,
) -> anyhow::Result<CommandOutput> {
  tracing::debug!("{stage} | running: {command}");
  let output = run_standard_command(command, path).await;
  if output.success() {
    Ok(output)
  } else {
    Err(anyhow!("{stage} failed | {}", output.combined()))
  }
}

/// Shell variant of [run_stage_command].
pub async fn run_stage_shell_command(
  stage: &str,
  command: &str,
  path: impl Into<Option<&Path>>,
) -> anyhow::Result<CommandOutput> {
  tracing::debug!("{stage} | running: {command}");
  let output = run_shell_command(command, path).await;
  if output.success() {
    Ok(output)
  } else {
    Err(anyhow!("{stage} failed | {}", output.combined()))
  }
}

/// Whether a binary resolves on the lookup path.
pub async fn binary_on_path(name: &str) -> bool {
  run_shell_command(&format!("command -v {name}"), None)
    .await
    .success()
}
