//! [`RemoteExecutor`] backed by the system OpenSSH client.
//!
//! Each target gets one multiplexed master connection (`ControlMaster`) that
//! later commands reuse. Commands and file transfers on one target are
//! serialized through its session lock. Console streams are long-lived and
//! run beside them as their own channel.

use super::{commands, CommandOutput, LineStream, RemoteError, RemoteExecutor, RemoteTarget};
use crate::config::SshHostConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

/// Exit status ssh uses for its own (connection) errors.
const SSH_TRANSPORT_EXIT: i32 = 255;

struct Session {
    host: SshHostConfig,
    /// Set once the master connection is up.
    master: Mutex<bool>,
    /// Held for the whole of a command or file transfer.
    busy: Mutex<()>,
}

impl Session {
    fn new(host: SshHostConfig) -> Self {
        Self {
            host,
            master: Mutex::new(false),
            busy: Mutex::new(()),
        }
    }
}

pub struct SshExecutor {
    sessions: HashMap<RemoteTarget, Session>,
    control_dir: PathBuf,
    program: PathBuf,
}

impl SshExecutor {
    pub fn new(
        cluster_manager: SshHostConfig,
        compute: SshHostConfig,
        control_dir: PathBuf,
    ) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(RemoteTarget::ClusterManager, Session::new(cluster_manager));
        sessions.insert(RemoteTarget::Compute, Session::new(compute));
        Self {
            sessions,
            control_dir,
            program: PathBuf::from("ssh"),
        }
    }

    /// Use another ssh client binary instead of `ssh` from `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn session(&self, target: RemoteTarget) -> Result<&Session, RemoteError> {
        self.sessions
            .get(&target)
            .filter(|s| !s.host.host.is_empty())
            .ok_or(RemoteError::NotConfigured(target))
    }

    fn command(&self, session: &Session) -> Command {
        let host = &session.host;
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}/%C", self.control_dir.display()))
            .arg("-o")
            .arg("ControlPersist=120")
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-p")
            .arg(host.port.to_string());
        if let Some(identity) = &host.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", host.user, host.host));
        cmd.kill_on_drop(true);
        cmd
    }

    /// Open the master connection for `target` if it is not up yet.
    async fn ensure_master(&self, target: RemoteTarget) -> Result<(), RemoteError> {
        let session = self.session(target)?;
        let mut ready = session.master.lock().await;
        if *ready {
            return Ok(());
        }

        std::fs::create_dir_all(&self.control_dir)?;
        tracing::debug!(
            "[SshExecutor] Opening master connection to {} ({})",
            target,
            session.host.host
        );

        let output = self
            .command(session)
            .arg("true")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RemoteError::Spawn { target, source })?;

        if !output.status.success() {
            return Err(RemoteError::Transport {
                target,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        *ready = true;
        Ok(())
    }

    async fn exec(
        &self,
        target: RemoteTarget,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output, RemoteError> {
        self.ensure_master(target).await?;
        let session = self.session(target)?;
        let _busy = session.busy.lock().await;

        tracing::debug!("[SshExecutor] {}> {}", target, command);

        let mut cmd = self.command(session);
        cmd.arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|source| RemoteError::Spawn { target, source })?;

        if let Some(data) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.code() == Some(SSH_TRANSPORT_EXIT) {
            // Master may have died; reconnect next time
            *session.master.lock().await = false;
            return Err(RemoteError::Transport {
                target,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, target: RemoteTarget, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self.exec(target, command, None).await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn write_file(
        &self,
        target: RemoteTarget,
        path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError> {
        let command = format!("cat > {}", commands::shell_quote(path));
        let output = self.exec(target, &command, Some(contents)).await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                target,
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::debug!(
            "[SshExecutor] Wrote {} bytes to {}:{}",
            contents.len(),
            target,
            path
        );
        Ok(())
    }

    async fn read_file(&self, target: RemoteTarget, path: &str) -> Result<Vec<u8>, RemoteError> {
        let command = format!("cat {}", commands::shell_quote(path));
        let output = self.exec(target, &command, None).await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                target,
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn file_exists(&self, target: RemoteTarget, path: &str) -> Result<bool, RemoteError> {
        let output = self
            .run(target, &format!("test -e {}", commands::shell_quote(path)))
            .await?;
        Ok(output.success())
    }

    async fn remove_file(&self, target: RemoteTarget, path: &str) -> Result<(), RemoteError> {
        self.run_checked(target, &format!("rm -f {}", commands::shell_quote(path)))
            .await?;
        Ok(())
    }

    async fn stream_lines(
        &self,
        target: RemoteTarget,
        command: &str,
    ) -> Result<LineStream, RemoteError> {
        self.ensure_master(target).await?;
        let session = self.session(target)?;

        tracing::debug!("[SshExecutor] {}> {} (streaming)", target, command);

        let mut child = self
            .command(session)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RemoteError::Spawn { target, source })?;

        let stdout = child.stdout.take().ok_or_else(|| RemoteError::Transport {
            target,
            message: "no stdout pipe".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                tokio::select! {
                    _ = tx.closed() => break,
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            // Serial consoles emit CRLF and the odd invalid byte
                            let line = String::from_utf8_lossy(&buf)
                                .trim_end_matches(['\r', '\n'])
                                .to_string();
                            if tx.send(Ok(line)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(RemoteError::Io(e))).await;
                            break;
                        }
                    }
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        });

        Ok(rx)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in ssh client that runs its last argument locally.
    fn fake_ssh(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("ssh");
        std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\nexec sh -c \"$last\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn host(name: &str) -> SshHostConfig {
        SshHostConfig {
            host: name.to_string(),
            ..SshHostConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commands_on_one_target_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SshExecutor::new(
            host("cm-01.sos.ethz.ch"),
            host("comp-epyc-lee-3.sos.ethz.ch"),
            dir.path().join("control"),
        )
        .with_program(fake_ssh(dir.path()));
        let log = dir.path().join("order.log");
        let command = |tag: &str| {
            format!(
                "echo start-{tag} >> {log}; sleep 0.3; echo end-{tag} >> {log}",
                tag = tag,
                log = log.display()
            )
        };

        let (cmd_a, cmd_b) = (command("a"), command("b"));
        let (a, b) = tokio::join!(
            executor.run(RemoteTarget::Compute, &cmd_a),
            executor.run(RemoteTarget::Compute, &cmd_b),
        );
        assert!(a.unwrap().success());
        assert!(b.unwrap().success());

        let order = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = order.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("start-"));
        assert_eq!(lines[1], lines[0].replace("start-", "end-"));
        assert!(lines[2].starts_with("start-"));
        assert_eq!(lines[3], lines[2].replace("start-", "end-"));
    }

    #[tokio::test]
    async fn test_unconfigured_target() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SshExecutor::new(host(""), host("comp"), dir.path().to_path_buf())
            .with_program(fake_ssh(dir.path()));
        assert!(matches!(
            executor.run(RemoteTarget::ClusterManager, "true").await,
            Err(RemoteError::NotConfigured(RemoteTarget::ClusterManager))
        ));
    }
}
