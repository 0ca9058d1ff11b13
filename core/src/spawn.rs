use std::collections::HashMap;
use std::iter;
use std::process::Stdio;

use procmux_protocol::LaunchParams;
use procmux_protocol::LaunchScriptParams;
use tokio::process::Command;

use crate::error::Result;
use crate::error::SupervisorError;

/// A fully configured command plus the human-readable form used in log
/// lines and error messages.
#[derive(Debug)]
pub(crate) struct PreparedCommand {
    pub(crate) display: String,
    pub(crate) command: Command,
}

/// Builds the child command for a launch request: validates the arguments,
/// applies shell interpretation when asked for, merges the environment, and
/// wires stdio (null stdin, piped stdout/stderr).
pub(crate) fn prepare(params: &LaunchParams) -> Result<PreparedCommand> {
    if params.run_id.trim().is_empty() {
        return Err(SupervisorError::invalid_argument("run_id must be non-empty"));
    }
    if params.command.trim().is_empty() {
        return Err(SupervisorError::invalid_argument("command must be non-empty"));
    }

    let mut command = if params.shell {
        let line = shell_line(&params.command, &params.args)?;
        shell_invocation(&line)
    } else {
        let mut command = Command::new(&params.command);
        command.args(&params.args);
        command
    };

    if let Some(cwd) = params.cwd.as_deref() {
        command.current_dir(cwd);
    }
    command
        .env_clear()
        .envs(merged_env(&params.env))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    Ok(PreparedCommand {
        display: display_line(&params.command, &params.args),
        command,
    })
}

/// The script-file calling convention: the path is always handed to the
/// platform shell, which is what makes `.bat` and friends launchable.
pub(crate) fn prepare_script(params: &LaunchScriptParams) -> Result<PreparedCommand> {
    if params.script_path.trim().is_empty() {
        return Err(SupervisorError::invalid_argument(
            "script_path must be non-empty",
        ));
    }
    prepare(&LaunchParams {
        run_id: params.run_id.clone(),
        command: params.script_path.clone(),
        args: params.args.clone(),
        cwd: params.cwd.clone(),
        env: params.env.clone(),
        shell: true,
    })
}

/// Child environment: the supervisor's own environment with caller-supplied
/// variables layered on top, caller winning on key collision.
pub(crate) fn merged_env(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    env
}

/// Joins command and arguments into one shell line. A bare command with no
/// arguments passes through untouched so callers may hand over a full shell
/// expression (`echo a; echo b`).
fn shell_line(command: &str, args: &[String]) -> Result<String> {
    if args.is_empty() {
        return Ok(command.to_string());
    }
    shlex::try_join(iter::once(command).chain(args.iter().map(String::as_str)))
        .map_err(|err| SupervisorError::invalid_argument(format!("unjoinable command line: {err}")))
}

#[cfg(windows)]
fn shell_invocation(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell_invocation(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

fn display_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}
