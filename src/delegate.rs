//! Fork-safe process-spawn delegate.
//!
//! A multi-threaded host must not fork/exec directly: another thread may hold
//! a lock (malloc, stdio) at fork time and the child would inherit it locked.
//! Instead the manager forks a small delegate subprocess early, while the
//! host is still effectively single-threaded, and every later spawn and wait
//! is performed by the delegate on the host's behalf.
//!
//! Control protocol: one JSON message per `SOCK_SEQPACKET` datagram over a
//! socketpair. Spawn requests attach the pre-opened pipe fds to the same
//! datagram via `SCM_RIGHTS`, paired positionally with `wanted_fds` ("dup
//! `created[i]` onto `wanted[i]` in the child").

use crate::error::{Result, XccError};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Largest control message we expect on the delegate socket.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Poll interval for the bounded wait loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DelegateRequest {
    /// Spawn `command` via `sh -c`; the created fds ride along as
    /// `SCM_RIGHTS` and land on `wanted_fds` in the child.
    Spawn {
        command: String,
        wanted_fds: Vec<RawFd>,
    },
    /// Bounded wait for a previously spawned pid.
    Wait { pid: i32, timeout_ms: u64 },
    /// Drop the delegate's identity so later spawns run as `username`.
    ChangeUser { username: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
enum DelegateReply {
    /// Spawn result; `pid` is -1 when the fork failed.
    Spawned { pid: i32 },
    /// Wait result.
    Waited { outcome: WaitOutcome },
    /// Operation completed with nothing to report.
    Done,
    /// Operation failed in the delegate.
    Failed { message: String },
}

/// How a waited-on subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Normal exit with a status code.
    Exited { code: i32 },
    /// Killed by a signal.
    Signaled { signal: i32, core_dumped: bool },
    /// Still running when the timeout elapsed.
    TimedOut,
}

/// Parent-side handle to the delegate subprocess.
///
/// All operations are serialized by one mutex; [`Delegate::session`] returns
/// a guard that holds it for the duration of each operation.
pub struct Delegate {
    pid: Pid,
    sock: Mutex<Option<OwnedFd>>,
}

impl Delegate {
    /// Fork the delegate subprocess. Call this before the host spawns
    /// threads; the child never returns from here.
    pub fn create() -> Result<Self> {
        // SOCK_CLOEXEC: the socket must survive the fork into the delegate
        // but never leak into the compilers the delegate execs.
        let (parent_sock, child_sock) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| XccError::transport("unable to create delegate socket", e))?;

        match unsafe { fork() }.map_err(|e| XccError::transport("unable to fork delegate", e))? {
            ForkResult::Child => {
                drop(parent_sock);
                delegate_main(child_sock);
            }
            ForkResult::Parent { child } => {
                drop(child_sock);
                tracing::debug!(pid = child.as_raw(), "spawn delegate started");
                Ok(Self {
                    pid: child,
                    sock: Mutex::new(Some(parent_sock)),
                })
            }
        }
    }

    /// Acquire exclusive use of the delegate for one or more operations.
    pub fn session(&self) -> Result<DelegateSession<'_>> {
        let guard = self.sock.lock().expect("delegate mutex poisoned");
        if guard.is_none() {
            return Err(XccError::Transport("spawn delegate is closed".into()));
        }
        Ok(DelegateSession { guard })
    }

    /// Close the control socket and reap the delegate. The delegate exits on
    /// EOF; the reap is bounded and best-effort.
    pub fn shutdown(&self) {
        let mut guard = self.sock.lock().expect("delegate mutex poisoned");
        if guard.take().is_none() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            pid = self.pid.as_raw(),
                            "spawn delegate did not exit, abandoning"
                        );
                        return;
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Ok(_) | Err(_) => return,
            }
        }
    }

    /// Drop the (inherited) control socket without signalling or waiting.
    /// Used in a fork child: the delegate belongs to the parent.
    pub fn detach(&self) {
        let mut guard = self.sock.lock().expect("delegate mutex poisoned");
        let _ = guard.take();
    }
}

/// Scoped exclusive use of the delegate. Dropping the session releases the
/// delegate for other threads.
pub struct DelegateSession<'a> {
    guard: MutexGuard<'a, Option<OwnedFd>>,
}

impl DelegateSession<'_> {
    fn sock(&self) -> &OwnedFd {
        self.guard.as_ref().expect("checked in Delegate::session")
    }

    /// Ask the delegate to spawn `command`, wiring `created[i]` onto
    /// `wanted[i]` in the child. Returns `None` when the delegate could not
    /// fork the subprocess.
    pub fn spawn(&self, command: &str, created: &[RawFd], wanted: &[RawFd]) -> Result<Option<Pid>> {
        let request = DelegateRequest::Spawn {
            command: command.to_string(),
            wanted_fds: wanted.to_vec(),
        };
        match self.roundtrip(&request, created)? {
            DelegateReply::Spawned { pid } if pid >= 0 => Ok(Some(Pid::from_raw(pid))),
            DelegateReply::Spawned { .. } => Ok(None),
            DelegateReply::Failed { message } => Err(XccError::Transport(message)),
            other => Err(XccError::Transport(format!(
                "unexpected delegate reply: {:?}",
                other
            ))),
        }
    }

    /// Bounded wait for `pid`.
    pub fn wait(&self, pid: Pid, timeout: Duration) -> Result<WaitOutcome> {
        let request = DelegateRequest::Wait {
            pid: pid.as_raw(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.roundtrip(&request, &[])? {
            DelegateReply::Waited { outcome } => Ok(outcome),
            DelegateReply::Failed { message } => Err(XccError::Transport(message)),
            other => Err(XccError::Transport(format!(
                "unexpected delegate reply: {:?}",
                other
            ))),
        }
    }

    /// Drop the delegate's identity to `username`; subsequent spawns run as
    /// that user.
    pub fn change_user(&self, username: &str) -> Result<()> {
        let request = DelegateRequest::ChangeUser {
            username: username.to_string(),
        };
        match self.roundtrip(&request, &[])? {
            DelegateReply::Done => Ok(()),
            DelegateReply::Failed { message } => Err(XccError::Transport(message)),
            other => Err(XccError::Transport(format!(
                "unexpected delegate reply: {:?}",
                other
            ))),
        }
    }

    fn roundtrip(&self, request: &DelegateRequest, fds: &[RawFd]) -> Result<DelegateReply> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| XccError::transport("unable to encode delegate request", e))?;
        send_message(self.sock(), &payload, fds)
            .map_err(|e| XccError::transport("error writing to spawn delegate", e))?;

        let (reply, _fds) = recv_message(self.sock())
            .map_err(|e| XccError::transport("error reading from spawn delegate", e))?
            .ok_or_else(|| XccError::Transport("spawn delegate closed its socket".into()))?;
        serde_json::from_slice(&reply)
            .map_err(|e| XccError::transport("invalid delegate reply", e))
    }
}

/// Send one datagram with optional fd payload.
fn send_message(sock: &OwnedFd, payload: &[u8], fds: &[RawFd]) -> nix::Result<()> {
    let iov = [IoSlice::new(payload)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    loop {
        match sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Receive one datagram. Returns `None` on EOF. Any fds arrive with
/// close-on-exec already set.
fn recv_message(sock: &OwnedFd) -> nix::Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 8]);
    let (len, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = loop {
            match recvmsg::<()>(
                sock.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => break msg,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        };
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for fd in received {
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        (msg.bytes, fds)
    };
    if len == 0 {
        return Ok(None);
    }
    buf.truncate(len);
    Ok(Some((buf, fds)))
}

/// Delegate subprocess main loop. Serves requests until EOF, then exits.
fn delegate_main(sock: OwnedFd) -> ! {
    loop {
        let (payload, fds) = match recv_message(&sock) {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => break,
        };
        let reply = match serde_json::from_slice::<DelegateRequest>(&payload) {
            Ok(DelegateRequest::Spawn {
                command,
                wanted_fds,
            }) => serve_spawn(&command, &fds, &wanted_fds),
            Ok(DelegateRequest::Wait { pid, timeout_ms }) => {
                serve_wait(Pid::from_raw(pid), Duration::from_millis(timeout_ms))
            }
            Ok(DelegateRequest::ChangeUser { username }) => serve_change_user(&username),
            Err(e) => DelegateReply::Failed {
                message: format!("invalid delegate request: {}", e),
            },
        };
        // fds drop here, closing the delegate's copies of the pipe ends.
        drop(fds);
        let encoded = match serde_json::to_vec(&reply) {
            Ok(encoded) => encoded,
            Err(_) => break,
        };
        if send_message(&sock, &encoded, &[]).is_err() {
            break;
        }
    }
    // _exit: the host's atexit handlers belong to the host, not to this
    // forked copy of it.
    unsafe { nix::libc::_exit(0) };
}

/// Fork and exec one subprocess with the requested fd wiring.
fn serve_spawn(command: &str, created: &[OwnedFd], wanted: &[RawFd]) -> DelegateReply {
    if created.len() != wanted.len() {
        return DelegateReply::Failed {
            message: format!(
                "fd count mismatch: {} created, {} wanted",
                created.len(),
                wanted.len()
            ),
        };
    }

    // Argv is built before forking so the child only dup2s and execs.
    let sh = CString::new("/bin/sh").expect("static path");
    let argv = match CString::new(command) {
        Ok(cmd) => [
            CString::new("sh").expect("static arg"),
            CString::new("-c").expect("static arg"),
            cmd,
        ],
        Err(_) => {
            return DelegateReply::Failed {
                message: "command contains a NUL byte".into(),
            }
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Only async-signal-safe calls between fork and exec. dup2 clears
            // close-on-exec on the target descriptors.
            for (fd, want) in created.iter().zip(wanted) {
                if unsafe { nix::libc::dup2(fd.as_raw_fd(), *want) } < 0 {
                    unsafe { nix::libc::_exit(127) };
                }
            }
            let _ = nix::unistd::execv(&sh, &argv);
            unsafe { nix::libc::_exit(127) };
        }
        Ok(ForkResult::Parent { child }) => DelegateReply::Spawned {
            pid: child.as_raw(),
        },
        Err(_) => DelegateReply::Spawned { pid: -1 },
    }
}

/// Non-blocking waitpid loop with a deadline.
fn serve_wait(pid: Pid, timeout: Duration) -> DelegateReply {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                return DelegateReply::Waited {
                    outcome: WaitOutcome::Exited { code },
                }
            }
            Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                return DelegateReply::Waited {
                    outcome: WaitOutcome::Signaled {
                        signal: signal as i32,
                        core_dumped,
                    },
                }
            }
            Ok(_) => {
                // Still alive (or stopped/continued, which we wait through).
                if Instant::now() >= deadline {
                    return DelegateReply::Waited {
                        outcome: WaitOutcome::TimedOut,
                    };
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) => {
                return DelegateReply::Failed {
                    message: format!("waitpid failed: {}", e),
                }
            }
        }
    }
}

/// Resolve a username and drop the delegate's identity to it.
fn serve_change_user(username: &str) -> DelegateReply {
    let user = match nix::unistd::User::from_name(username) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return DelegateReply::Failed {
                message: format!("unknown user: {}", username),
            }
        }
        Err(e) => {
            return DelegateReply::Failed {
                message: format!("unable to look up user {}: {}", username, e),
            }
        }
    };

    let name = match CString::new(username) {
        Ok(name) => name,
        Err(_) => {
            return DelegateReply::Failed {
                message: "username contains a NUL byte".into(),
            }
        }
    };

    let result = nix::unistd::setgid(user.gid)
        .and_then(|_| nix::unistd::initgroups(&name, user.gid))
        .and_then(|_| nix::unistd::setuid(user.uid));
    match result {
        Ok(()) => DelegateReply::Done,
        Err(e) => DelegateReply::Failed {
            message: format!("unable to change to user {}: {}", username, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Pipe, PipeFd};
    use std::io::{BufRead, BufReader, Write};

    #[test]
    fn test_spawn_and_wait_through_delegate() {
        let delegate = Delegate::create().expect("failed to create delegate");

        // Wire a `cat` child: what we write to its stdin comes back on its
        // stdout.
        let stdin_pipe = Pipe::new().unwrap();
        let stdout_pipe = Pipe::new().unwrap();
        let pid = {
            let session = delegate.session().unwrap();
            session
                .spawn(
                    "exec cat",
                    &[stdin_pipe.read.as_raw_fd(), stdout_pipe.write.as_raw_fd()],
                    &[0, 1],
                )
                .unwrap()
                .expect("spawn returned sentinel")
        };
        drop(stdin_pipe.read);
        drop(stdout_pipe.write);

        let mut writer = PipeFd::new(stdin_pipe.write);
        writer.write_all(b"hello\n").unwrap();
        drop(writer); // EOF: cat exits

        let mut reader = BufReader::new(PipeFd::new(stdout_pipe.read));
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "hello\n");

        let outcome = {
            let session = delegate.session().unwrap();
            session.wait(pid, Duration::from_secs(5)).unwrap()
        };
        assert_eq!(outcome, WaitOutcome::Exited { code: 0 });

        delegate.shutdown();
    }

    #[test]
    fn test_wait_times_out_on_live_process() {
        let delegate = Delegate::create().expect("failed to create delegate");

        let stdin_pipe = Pipe::new().unwrap();
        let pid = {
            let session = delegate.session().unwrap();
            session
                .spawn("exec sleep 30", &[stdin_pipe.read.as_raw_fd()], &[0])
                .unwrap()
                .expect("spawn returned sentinel")
        };
        drop(stdin_pipe.read);

        let outcome = {
            let session = delegate.session().unwrap();
            session.wait(pid, Duration::from_millis(50)).unwrap()
        };
        assert_eq!(outcome, WaitOutcome::TimedOut);

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let outcome = {
            let session = delegate.session().unwrap();
            session.wait(pid, Duration::from_secs(5)).unwrap()
        };
        assert!(matches!(outcome, WaitOutcome::Signaled { signal: 9, .. }));

        delegate.shutdown();
    }

    #[test]
    fn test_exec_failure_exits_127() {
        let delegate = Delegate::create().expect("failed to create delegate");

        let pid = {
            let session = delegate.session().unwrap();
            session
                .spawn("exec /nonexistent/compiler", &[], &[])
                .unwrap()
                .expect("sh itself should spawn")
        };
        let outcome = {
            let session = delegate.session().unwrap();
            session.wait(pid, Duration::from_secs(5)).unwrap()
        };
        assert!(matches!(outcome, WaitOutcome::Exited { code } if code != 0));

        delegate.shutdown();
    }

    #[test]
    fn test_change_user_unknown_user_fails() {
        let delegate = Delegate::create().expect("failed to create delegate");
        let err = {
            let session = delegate.session().unwrap();
            session.change_user("no-such-user-xcc").unwrap_err()
        };
        assert!(matches!(err, XccError::Transport(_)));
        delegate.shutdown();
    }

    #[test]
    fn test_session_after_shutdown_fails() {
        let delegate = Delegate::create().expect("failed to create delegate");
        delegate.shutdown();
        assert!(delegate.session().is_err());
    }
}
