//! Pseudo-terminal shells for interactive sessions
//!
//! Each accepted `pty-req` gets its own [`ShellTerminal`]: a PTY pair with a
//! login shell attached to the slave side. The I/O halves and the child are
//! handed back separately so the caller can move them onto blocking threads.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};

/// Shells accepted without consulting `/etc/shells`
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/dash",
    "/bin/ash",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/dash",
    "/usr/local/bin/bash",
];

/// Shell used when nothing else resolves
const FALLBACK_SHELL: &str = "/bin/sh";

/// Terminal type exported when the client does not send one
const DEFAULT_TERM: &str = "xterm";

/// Validate that a shell path is allowed and exists
fn validate_shell_path(shell: &str) -> Result<String> {
    let listed = ALLOWED_SHELLS.contains(&shell)
        || std::fs::read_to_string("/etc/shells")
            .map(|shells| {
                shells.lines().any(|line| {
                    let line = line.trim();
                    !line.starts_with('#') && line == shell
                })
            })
            .unwrap_or(false);

    if !listed {
        anyhow::bail!("Shell '{}' is not an allowed login shell", shell);
    }
    if !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

/// Pick the shell to run: configured, then `$SHELL`, then `/bin/sh`.
///
/// Candidates that fail validation fall through to the next one.
pub fn resolve_shell(configured: Option<&str>) -> Result<String> {
    let from_env = std::env::var("SHELL").ok();
    let candidates = configured
        .into_iter()
        .chain(from_env.as_deref())
        .chain(std::iter::once(FALLBACK_SHELL));

    for candidate in candidates {
        match validate_shell_path(candidate) {
            Ok(shell) => return Ok(shell),
            Err(e) => tracing::debug!("Skipping shell candidate: {}", e),
        }
    }

    anyhow::bail!("No usable shell found")
}

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    /// Clamp the wire values (u32) into PTY dimensions; zero becomes 80x24
    pub fn from_wire(cols: u32, rows: u32) -> Self {
        let clamp = |v: u32, default: u16| {
            if v == 0 {
                default
            } else {
                u16::try_from(v).unwrap_or(u16::MAX)
            }
        };
        Self {
            cols: clamp(cols, 80),
            rows: clamp(rows, 24),
        }
    }

    fn as_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Shell launch parameters shared by every session of a server
#[derive(Debug, Clone, Default)]
pub struct ShellSettings {
    /// Preferred shell
    pub shell: Option<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
}

/// The detachable I/O side of a [`ShellTerminal`]
pub struct ShellIo {
    /// Output from the shell
    pub reader: Box<dyn Read + Send>,
    /// Input to the shell
    pub writer: Box<dyn Write + Send>,
    /// The shell process, for waiting on exit
    pub child: Box<dyn Child + Send + Sync>,
}

/// A running shell attached to a PTY
pub struct ShellTerminal {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl ShellTerminal {
    /// Open a PTY and start a shell on it
    pub fn spawn(settings: &ShellSettings, term: &str, size: TerminalSize) -> Result<(Self, ShellIo)> {
        let shell = resolve_shell(settings.shell.as_deref())?;

        let PtyPair { master, slave } = native_pty_system()
            .openpty(size.as_pty_size())
            .with_context(|| "Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&shell);
        let term = if term.is_empty() { DEFAULT_TERM } else { term };
        cmd.env("TERM", term);
        for (key, value) in &settings.env {
            cmd.env(key, value);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }

        let child = slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        // Only the child may hold the slave, otherwise the reader never sees EOF
        drop(slave);

        let pid = child.process_id();
        tracing::info!("Spawned {} (pid {:?}) with size {}x{}", shell, pid, size.cols, size.rows);

        let reader = master
            .try_clone_reader()
            .with_context(|| "Failed to clone PTY reader")?;
        let writer = master
            .take_writer()
            .with_context(|| "Failed to take PTY writer")?;
        let killer = child.clone_killer();

        Ok((
            Self { master, killer, pid },
            ShellIo {
                reader,
                writer,
                child,
            },
        ))
    }

    /// Process id of the shell
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resize the PTY
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        tracing::debug!("Resizing pty of pid {:?} to {}x{}", self.pid, size.cols, size.rows);
        self.master
            .resize(size.as_pty_size())
            .with_context(|| "Failed to resize PTY")
    }

    /// Kill the shell; a no-op when it already exited
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            tracing::debug!("Kill of pid {:?} failed: {}", self.pid, e);
        }
    }
}

impl Drop for ShellTerminal {
    fn drop(&mut self) {
        self.kill();
    }
}
