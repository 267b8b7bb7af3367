//! Shell command execution for lifecycle plans.
//!
//! A command is one shell script together with its declared environment and
//! process-launch policy. Execution seeds the child's stdin with the bytes
//! produced by the previous plan node, captures stdout for the next one, and
//! passes stderr through to the agent's own stderr.

use std::fmt;
use std::process::Stdio;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::environment::Environment;
use crate::error::{Error, Result};

/// Shell used when a command does not name one.
pub const DEFAULT_SHELL: &str = "bash";

/// Process credentials applied at spawn time.
///
/// All three are applied inside the child before `exec`, in the order
/// supplementary groups, gid, uid, so the group changes happen while the
/// process still holds the privilege to make them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// User id the child runs as.
    pub uid: u32,
    /// Group id the child runs as.
    pub gid: u32,
    /// Supplementary group ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<u32>,
}

/// A command to execute: the script, the environment to supply to it, and
/// the launch policy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "CommandRepr")]
pub struct Command {
    /// The shell script text.
    pub script: String,
    /// Variables declared on the command itself. These win over the
    /// supplied environment and may reference it.
    pub environment: Environment,
    /// Shell name; `None` uses [`DEFAULT_SHELL`].
    pub shell: Option<String>,
    /// Optional credentials for the child process.
    pub credential: Option<Credential>,
}

/// Commands deserialize from either a bare script string or a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRepr {
    Script(String),
    Full {
        script: String,
        #[serde(default)]
        environment: Environment,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        credential: Option<Credential>,
    },
}

impl From<CommandRepr> for Command {
    fn from(repr: CommandRepr) -> Self {
        match repr {
            CommandRepr::Script(script) => Self {
                script,
                ..Self::default()
            },
            CommandRepr::Full {
                script,
                environment,
                shell,
                credential,
            } => Self {
                script,
                environment,
                shell,
                credential,
            },
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.environment.is_empty() && self.shell.is_none() && self.credential.is_none() {
            return serializer.serialize_str(&self.script);
        }
        let mut fields = 2;
        fields += usize::from(self.shell.is_some());
        fields += usize::from(self.credential.is_some());
        let mut s = serializer.serialize_struct("Command", fields)?;
        s.serialize_field("script", &self.script)?;
        s.serialize_field("environment", &self.environment)?;
        if let Some(shell) = &self.shell {
            s.serialize_field("shell", shell)?;
        }
        if let Some(credential) = &self.credential {
            s.serialize_field("credential", credential)?;
        }
        s.end()
    }
}

impl fmt::Display for Command {
    /// Redacted rendering: shell, script, and environment keys only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shell = self.shell.as_deref().unwrap_or(DEFAULT_SHELL);
        write!(f, "{shell} -c {:?}", self.script)?;
        if !self.environment.is_empty() {
            let keys: Vec<&str> = self.environment.iter().map(|(k, _)| k).collect();
            write!(f, " (env: {})", keys.join(", "))?;
        }
        Ok(())
    }
}

/// Resolves a shell name to the program and arguments that run `script`.
///
/// The table is closed: an unknown shell is a configuration error.
fn shell_exec<'a>(script: &'a str, shell: Option<&str>) -> Result<(&'static str, Vec<&'a str>)> {
    match shell.unwrap_or(DEFAULT_SHELL) {
        "bash" => Ok(("bash", vec!["-c", script])),
        other => Err(Error::BadConfig(format!("unknown shell {other}"))),
    }
}

impl Command {
    /// Creates a command running `script` under the default shell.
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Runs the script with `input` seeded on stdin and the effective
    /// environment `self.environment` expanded against and merged with
    /// `environment`. Returns captured stdout.
    ///
    /// The calling task blocks on the child; if `token` is cancelled the
    /// child is killed and [`Error::Cancelled`] is returned.
    pub async fn process(
        &self,
        input: &[u8],
        environment: &Environment,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let env = self.environment.expand_and_merge_with(environment);
        let (shell, args) = shell_exec(&self.script, self.shell.as_deref())?;

        let mut cmd = std::process::Command::new(shell);
        cmd.args(args)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(credential) = &self.credential {
            apply_credential(&mut cmd, credential);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| self.failed(&e.to_string()))?;

        // Feed stdin from a separate task so a child that writes before
        // reading cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            let input = input.to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| self.failed(&e.to_string()))?
            }
            () = token.cancelled() => return Err(Error::Cancelled),
        };

        if !output.status.success() {
            return Err(self.failed(&output.status.to_string()));
        }
        Ok(output.stdout)
    }

    fn failed(&self, message: &str) -> Error {
        Error::CommandFailed {
            command: self.to_string(),
            message: message.to_string(),
        }
    }
}

/// Drops to the configured credentials inside the child before `exec`.
fn apply_credential(cmd: &mut std::process::Command, credential: &Credential) {
    use std::os::unix::process::CommandExt;

    let uid = nix::unistd::Uid::from_raw(credential.uid);
    let gid = nix::unistd::Gid::from_raw(credential.gid);
    let groups: Vec<nix::unistd::Gid> = credential
        .groups
        .iter()
        .copied()
        .map(nix::unistd::Gid::from_raw)
        .collect();
    // Single pre_exec so the ordering (groups, gid, uid) is explicit rather
    // than split between std's own uid/gid handling and a callback. The
    // closure runs between fork and exec: no allocation in there.
    unsafe {
        cmd.pre_exec(move || {
            if !groups.is_empty() {
                nix::unistd::setgroups(&groups)?;
            }
            nix::unistd::setgid(gid)?;
            nix::unistd::setuid(uid)?;
            Ok(())
        });
    }
}
