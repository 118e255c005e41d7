//! One external compiler subprocess and its owning state.
//!
//! A `Compiler` owns the subprocess, the framed stdin/stdout channel, and a
//! background thread that drains stderr into the host log. It is exclusive to
//! one lease holder at a time; nothing here is internally synchronized.

use crate::assemble::{AssemblerRef, CompileRequest, Unit};
use crate::config::PoolConfig;
use crate::delegate::{Delegate, WaitOutcome};
use crate::error::{Result, XccError};
use crate::ipc::{FrameReader, FrameWriter, Pipe, PipeFd};
use crate::protocol::{self, TYPE_ERROR, TYPE_HHAS};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bounded wait for subprocess termination during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Counter for unique stderr-drain thread names.
static STDERR_THREAD_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Handle to one compiler subprocess.
///
/// Invariant: `pid` is `Some` exactly when `writer`, `reader` and the stderr
/// drain are all live.
pub struct Compiler {
    pid: Option<Pid>,
    writer: Option<FrameWriter>,
    reader: Option<FrameReader>,
    stderr_drain: Option<JoinHandle<()>>,
    version: Option<String>,
    compilations: u64,
    config: Arc<PoolConfig>,
    delegate: Arc<Delegate>,
    assembler: AssemblerRef,
}

impl Compiler {
    /// Create an unstarted compiler. The subprocess is spawned lazily on
    /// first use.
    pub fn new(config: Arc<PoolConfig>, delegate: Arc<Delegate>, assembler: AssemblerRef) -> Self {
        Self {
            pid: None,
            writer: None,
            reader: None,
            stderr_drain: None,
            version: None,
            compilations: 0,
            config,
            delegate,
            assembler,
        }
    }

    /// Whether a subprocess is currently attached.
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// The attached subprocess id, if any.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The compiler's version string, starting the subprocess if needed.
    pub fn version(&mut self) -> Result<String> {
        if !self.is_running() {
            self.spawn()?;
        }
        Ok(self.version.clone().unwrap_or_default())
    }

    /// Compile one source file.
    ///
    /// Transport failures kill the subprocess and surface as
    /// [`XccError::Transport`]; the pool facade retries those. A structured
    /// compile error leaves the subprocess running (the pipe is still in
    /// sync) and surfaces as [`XccError::Compile`].
    pub fn compile(&mut self, request: &CompileRequest<'_>) -> Result<Unit> {
        if self.config.reset_after > 0 && self.compilations > self.config.reset_after {
            tracing::debug!(
                compilations = self.compilations,
                threshold = self.config.reset_after,
                "restarting compiler to shed accumulated state"
            );
            self.stop();
        }
        if !self.is_running() {
            self.spawn()?;
        }
        self.compilations += 1;

        let text = match self.exchange(request) {
            Ok(text) => text,
            Err(err @ XccError::Transport(_)) => {
                self.stop();
                if self.config.verbose_errors {
                    tracing::error!("external compiler error: {}", err);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match self
            .assembler
            .assemble(request.filename, &request.md5, &text)
        {
            Ok(unit) => Ok(unit),
            Err(err) => {
                let message = if self.config.verbose_errors {
                    let wrapped = format!(
                        "{}\n========== Source ==========\n{}\n========== Compiler Output ==========\n{}\n",
                        err,
                        String::from_utf8_lossy(request.source),
                        String::from_utf8_lossy(&text),
                    );
                    tracing::error!("external compiler produced a bad unit: {}", wrapped);
                    wrapped
                } else {
                    err.to_string()
                };
                Err(XccError::Compile(message))
            }
        }
    }

    /// Write the code frame and read one reply frame.
    fn exchange(&mut self, request: &CompileRequest<'_>) -> Result<Vec<u8>> {
        let writer = self
            .writer
            .as_mut()
            .expect("running compiler has a stdin channel");
        let mut header = protocol::code_header(&request.md5, request.filename, request.systemlib);
        writer.send(&mut header, request.source)?;

        let reader = self
            .reader
            .as_mut()
            .expect("running compiler has a stdout channel");
        let frame = reader.read_frame()?;
        match frame.header.kind.as_str() {
            TYPE_HHAS => Ok(frame.body),
            TYPE_ERROR => Err(XccError::Compile(frame.header.error_message())),
            other => Err(XccError::Compile(format!(
                "unknown message type, {}",
                other
            ))),
        }
    }

    /// Spawn the subprocess and run the startup sequence: version handshake,
    /// discard newline, config push.
    fn spawn(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let stdin_pipe = Pipe::new()?;
        let stdout_pipe = Pipe::new()?;
        let stderr_pipe = Pipe::new()?;

        let pid = {
            let session = self.delegate.session()?;
            session.spawn(
                &self.config.command,
                &[
                    stdin_pipe.read.as_raw_fd(),
                    stdout_pipe.write.as_raw_fd(),
                    stderr_pipe.write.as_raw_fd(),
                ],
                &[0, 1, 2],
            )?
        };
        let pid = match pid {
            Some(pid) => pid,
            None => {
                let message = format!(
                    "unable to start external compiler with command: {}",
                    self.config.command
                );
                tracing::error!("{}", message);
                return Err(XccError::BadCompiler(message));
            }
        };

        // The remote halves now live in the child; close our copies.
        drop(stdin_pipe.read);
        drop(stdout_pipe.write);
        drop(stderr_pipe.write);

        let mut writer = FrameWriter::new(PipeFd::new(stdin_pipe.write));
        let mut reader = FrameReader::new(PipeFd::new(stdout_pipe.read));
        let stderr_drain = spawn_stderr_drain(pid, PipeFd::new(stderr_pipe.read));

        self.pid = Some(pid);
        self.stderr_drain = Some(stderr_drain);

        // The very first line on stdout is the version handshake; it carries
        // no body and may omit the bytes field entirely.
        let version = match read_version(&mut reader) {
            Ok(version) => version,
            Err(_) => {
                self.writer = Some(writer);
                self.reader = Some(reader);
                self.stop();
                return Err(XccError::BadCompiler(
                    "couldn't read version message from external compiler".into(),
                ));
            }
        };

        // The subprocess discards the first line it reads, so open the
        // conversation with a bare newline.
        if writer.send_raw(b"\n").is_err() {
            self.writer = Some(writer);
            self.reader = Some(reader);
            self.stop();
            return Err(XccError::BadCompiler(
                "couldn't write initial newline".into(),
            ));
        }

        tracing::debug!(pid = pid.as_raw(), version = %version, "external compiler started");

        self.writer = Some(writer);
        self.reader = Some(reader);
        self.version = Some(version);

        self.write_configs()
    }

    /// Push the two config frames. Empty bodies when config inheritance is
    /// off.
    fn write_configs(&mut self) -> Result<()> {
        let (bound, misc) = if self.config.inherit_config {
            (
                self.config.bound_config.clone(),
                self.config.misc_config.clone(),
            )
        } else {
            (String::new(), String::new())
        };
        let writer = self
            .writer
            .as_mut()
            .expect("running compiler has a stdin channel");
        let mut header = protocol::config_header();
        writer.send(&mut header, bound.as_bytes())?;
        let mut header = protocol::config_header();
        writer.send(&mut header, misc.as_bytes())?;
        Ok(())
    }

    /// Tear down the subprocess. Safe from any state and idempotent.
    pub fn stop(&mut self) {
        let pid = match self.pid.take() {
            Some(pid) => pid,
            None => {
                self.join_stderr_drain();
                return;
            }
        };

        self.compilations = 0;

        // Dropping the channel handles closes our pipe ends, signalling EOF
        // to the subprocess.
        self.writer = None;
        self.reader = None;

        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            tracing::warn!(pid = pid.as_raw(), "external compiler: kill failed: {}", e);
        }

        let reaped = match self
            .delegate
            .session()
            .and_then(|session| session.wait(pid, STOP_TIMEOUT))
        {
            Ok(WaitOutcome::Exited { code }) => {
                if code != 0 {
                    tracing::warn!(
                        pid = pid.as_raw(),
                        "external compiler exited with status code {}",
                        code
                    );
                }
                true
            }
            Ok(WaitOutcome::Signaled {
                signal,
                core_dumped,
            }) => {
                if signal != Signal::SIGTERM as i32 {
                    tracing::warn!(
                        pid = pid.as_raw(),
                        "external compiler terminated by signal {}{}",
                        signal,
                        if core_dumped { " (core dumped)" } else { "" }
                    );
                }
                true
            }
            Ok(WaitOutcome::TimedOut) => {
                tracing::warn!(
                    pid = pid.as_raw(),
                    "unable to wait for external compiler, leaking it to the reaper"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    pid = pid.as_raw(),
                    "unable to wait for external compiler: {}",
                    e
                );
                false
            }
        };

        if reaped {
            // The subprocess is gone, so its stderr write end is closed and
            // the drain sees EOF; the join completes.
            self.join_stderr_drain();
        } else {
            // The subprocess may still hold stderr open; a join would block
            // until it finally dies. The drain exits on its own at EOF.
            let _ = self.stderr_drain.take();
        }
    }

    /// Drop ownership of the subprocess without killing or waiting.
    ///
    /// Called in a fork child: the subprocess belongs to the parent, and the
    /// drain thread does not exist on this side of the fork, so its handle is
    /// dropped, never joined.
    pub fn detach_from_process(&mut self) {
        self.pid = None;
        self.writer = None;
        self.reader = None;
        let _ = self.stderr_drain.take();
    }

    fn join_stderr_drain(&mut self) {
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Compiler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse the handshake line: JSON with a string `version` field.
fn read_version(reader: &mut FrameReader) -> Result<String> {
    let line = reader.read_line()?;
    let header: serde_json::Value = serde_json::from_str(&line)
        .map_err(|e| XccError::transport("invalid version message", e))?;
    match header.get("version").and_then(|v| v.as_str()) {
        Some(version) => Ok(version.to_string()),
        None => Err(XccError::Transport(
            "version message has no 'version' field".into(),
        )),
    }
}

/// Start the background thread that forwards the subprocess's stderr to the
/// host log. The thread owns the read end and exits on EOF or error.
fn spawn_stderr_drain(pid: Pid, stderr: PipeFd) -> JoinHandle<()> {
    let seq = STDERR_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = pid.as_raw();
    std::thread::Builder::new()
        .name(format!("compiler-{}-stderr", seq))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                tracing::error!(pid, "external compiler: {}", line);
            }
            tracing::debug!(pid, "ceasing to log stderr from external compiler");
        })
        .expect("failed to spawn stderr drain thread")
}
