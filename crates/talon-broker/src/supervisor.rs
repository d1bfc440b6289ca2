use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, Result};

/// Default grace between SIGINT and SIGKILL on stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Launches and owns one plugin or channel subprocess.
///
/// Stdout is scanned exactly once for a handshake line on start; whatever
/// the child prints afterwards is drained to the trace log by a background
/// task. On stop the child gets SIGINT, a grace period, then SIGKILL.
pub struct Supervisor {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    child: Option<Child>,
}

impl Supervisor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            child: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Spawn the child and scan stdout for the first line within
    /// `handshake_timeout`. Early exit, a closed stdout, or a timeout kills
    /// the child and fails. Returns the raw handshake line.
    pub async fn start(&mut self, handshake_timeout: Duration) -> Result<String> {
        let mut child = self.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let _ = child.start_kill();
                    return Err(BrokerError::EarlyExit { status: "stdout closed".to_string() });
                }
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(BrokerError::Io(e));
                }
            },
            status = child.wait() => {
                let status = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return Err(BrokerError::EarlyExit { status });
            }
            _ = tokio::time::sleep(handshake_timeout) => {
                let _ = child.start_kill();
                return Err(BrokerError::HandshakeTimeout {
                    timeout_ms: handshake_timeout.as_millis() as u64,
                });
            }
        };

        debug!(program = %self.program, handshake = %line, "subprocess handshake received");
        drain_stdout(self.program.clone(), lines);
        self.child = Some(child);
        Ok(line)
    }

    /// Spawn without expecting a handshake line (channel sock-dir mode).
    /// Stdout is drained from the first line.
    pub fn start_silent(&mut self) -> Result<()> {
        let mut child = self.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        drain_stdout(self.program.clone(), BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        debug!(program = %self.program, "spawning subprocess");
        cmd.spawn().map_err(|source| BrokerError::Spawn {
            program: self.program.clone(),
            source,
        })
    }

    /// Non-blocking liveness check.
    pub fn running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Resolve when the child is reaped. Fires once; subsequent calls
    /// return immediately.
    pub async fn exited(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.wait().await;
        }
    }

    /// Interrupt-then-kill: SIGINT, wait up to `grace`, then SIGKILL.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            // SAFETY: plain signal send to our own child's pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                debug!(program = %self.program, status = ?status.ok(), "subprocess stopped");
            }
            Err(_) => {
                warn!(program = %self.program, grace_secs = grace.as_secs(), "grace expired, killing subprocess");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        Ok(())
    }
}

fn drain_stdout(
    program: String,
    mut lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            trace!(program = %program, line = %line, "subprocess stdout");
        }
    });
}
