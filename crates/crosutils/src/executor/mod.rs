use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_log_line;

pub mod signals;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StepStarted {
        id: String,
    },
    StepLog {
        id: String,
        line: String,
    },
    StepFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Default sink: every event becomes a `tracing` event.
#[derive(Default)]
pub struct TracingSink;

impl ExecSink for TracingSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StepStarted { id } => tracing::debug!(step = %id, "started"),
            ExecEvent::StepLog { id, line } => tracing::info!(step = %id, "{line}"),
            ExecEvent::StepFinished {
                id,
                ok: true,
                elapsed_ms,
                ..
            } => tracing::debug!(step = %id, elapsed_ms = elapsed_ms as u64, "finished"),
            ExecEvent::StepFinished {
                id,
                error,
                elapsed_ms,
                ..
            } => tracing::debug!(
                step = %id,
                elapsed_ms = elapsed_ms as u64,
                "failed: {}",
                error.unwrap_or_default()
            ),
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// `[tools]`: executable overrides keyed by tool name.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    overrides: BTreeMap<String, PathBuf>,
}

impl ToolPaths {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let raw: BTreeMap<String, String> = doc.section("tools")?;
        let mut overrides = BTreeMap::new();
        for (name, path) in raw {
            let path = path.trim();
            if path.is_empty() {
                return Err(Error::input(format!("tools.{name} is empty")));
            }
            overrides.insert(name, PathBuf::from(path));
        }
        Ok(Self { overrides })
    }

    pub fn set(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.overrides.insert(name.into(), path.into());
    }

    pub fn program(&self, name: &str) -> PathBuf {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(name))
    }

    /// Locate a tool: overrides must exist as given, bare names are searched on `PATH`.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let program = self.program(name);
        if program.components().count() > 1 {
            return is_executable(&program).then_some(program);
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&program))
            .find(|p| is_executable(p))
    }
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    p.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_step: Option<String>,
    tools: Arc<ToolPaths>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_step: None,
            tools: Arc::new(ToolPaths::default()),
        }
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || signals::interrupted()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_step(&mut self, id: impl Into<String>) {
        self.current_step = Some(id.into());
    }

    fn step_id(&self) -> String {
        self.current_step.clone().unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::StepLog {
            id: self.step_id(),
            line: msg.to_string(),
        });
    }

    /// Run one named step, reporting start/finish to the sink.
    pub fn step<T>(&mut self, id: &str, f: impl FnOnce(&mut ExecCtx) -> Result<T>) -> Result<T> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }
        let prev = self.current_step.replace(id.to_string());
        self.sink.emit(ExecEvent::StepStarted { id: id.to_string() });
        let start = Instant::now();
        let res = f(self);
        let elapsed_ms = start.elapsed().as_millis();
        self.sink.emit(ExecEvent::StepFinished {
            id: id.to_string(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(ToString::to_string),
            elapsed_ms,
        });
        self.current_step = prev;
        res
    }

    pub fn command(&self, tool: &str) -> Command {
        Command::new(self.tools.program(tool))
    }

    /// Run a command that changes host or device state; only logged in dry-run.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", describe(&cmd)));
            return Ok(());
        }
        self.spawn_streaming(cmd, true)
    }

    /// Run a command whose effects stay inside a scratch/output directory.
    /// These run even in dry-run so later steps have their inputs.
    pub fn run_scratch_cmd(&self, cmd: Command) -> Result<()> {
        self.spawn_streaming(cmd, true)
    }

    /// Cleanup commands run even after cancellation and never fail the caller.
    /// Returns whether the command succeeded.
    pub fn run_cleanup_cmd(&self, cmd: Command) -> bool {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", describe(&cmd)));
            return true;
        }
        let desc = describe(&cmd);
        match self.spawn_streaming(cmd, false) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(step = %self.step_id(), "cleanup '{desc}' failed: {e}");
                false
            }
        }
    }

    /// Run a read-only query and return its stdout.
    pub fn query(&self, mut cmd: Command) -> Result<String> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }
        let desc = describe(&cmd);
        tracing::debug!(step = %self.step_id(), "query: {desc}");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::command(format!("failed to run {desc}: {e}")).with_source(e))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let summary = stderr.trim();
            return Err(Error::command(if summary.is_empty() {
                format!("{desc} failed: {}", out.status)
            } else {
                format!("{desc} failed: {}: {}", out.status, sanitize_log_line(summary))
            }));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn spawn_streaming(&self, mut cmd: Command, honour_cancel: bool) -> Result<()> {
        if honour_cancel && self.cancelled() {
            return Err(Error::cancelled());
        }
        let desc = describe(&cmd);
        tracing::debug!(step = %self.step_id(), "exec: {desc}");

        // Own process group so an interrupt can take down the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command(format!("failed to spawn {desc}: {e}")).with_source(e))?;
        let pgid = child.id();
        if honour_cancel {
            signals::set_foreground(pgid);
        }

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child.wait();
        if honour_cancel {
            signals::clear_foreground();
        }
        let status = status
            .map_err(|e| Error::command(format!("wait for {desc} failed: {e}")).with_source(e))?;
        if honour_cancel && self.cancelled() {
            return Err(Error::new(
                ErrorKind::Cancelled,
                format!("cancelled while running {desc}"),
            ));
        }
        if !status.success() {
            return Err(Error::command(format!("{desc} failed: {status}")));
        }
        Ok(())
    }
}

/// Shell-like rendering of a command for logs.
pub fn describe(cmd: &Command) -> String {
    let quote = |s: &OsStr| {
        let s = s.to_string_lossy();
        if !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
        {
            s.into_owned()
        } else {
            format!("'{}'", s.replace('\'', r"'\''"))
        }
    };
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            // emerge progress spinners use bare '\r'.
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}
