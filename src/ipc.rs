//! Pipe primitives and the framed channel.
//!
//! A frame is one JSON header line followed by exactly `header.bytes` bytes
//! of raw body. There is no magic number, CRC, or per-frame version; a
//! framing failure poisons the worker and the pipes are torn down.

use crate::error::{Result, XccError};
use crate::protocol::ReplyHeader;
use nix::fcntl::OFlag;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Buffer size for the framed channel (64KB).
const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Wrap an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes have no fd-level buffering
    }
}

/// One pipe with both ends close-on-exec.
///
/// The end destined for the subprocess is handed to the spawn delegate, which
/// dup2s it over a standard descriptor (clearing close-on-exec in the child);
/// the local end stays in this process.
pub struct Pipe {
    /// Read end.
    pub read: OwnedFd,
    /// Write end.
    pub write: OwnedFd,
}

impl Pipe {
    /// Open a pipe with `O_CLOEXEC` set on both ends.
    pub fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| XccError::transport("unable to open pipe", e))?;
        Ok(Self { read, write })
    }
}

/// Write half of the framed channel: the worker's stdin.
pub struct FrameWriter {
    writer: BufWriter<PipeFd>,
}

impl FrameWriter {
    /// Create a writer over the local write end of a pipe.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(CHANNEL_BUFFER_SIZE, fd),
        }
    }

    /// Send one frame: `bytes` is stamped into the header, then the header
    /// line and exactly `body.len()` bytes are written and flushed.
    pub fn send(&mut self, header: &mut serde_json::Value, body: &[u8]) -> Result<()> {
        header["bytes"] = serde_json::Value::from(body.len());
        let line = header.to_string();
        self.write_all(line.as_bytes())?;
        self.write_all(b"\n")?;
        if !body.is_empty() {
            self.write_all(body)?;
        }
        self.writer
            .flush()
            .map_err(|e| XccError::transport("error writing message", e))
    }

    /// Write raw bytes without framing and flush. Used for the single
    /// discard newline the subprocess expects right after the handshake.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)?;
        self.writer
            .flush()
            .map_err(|e| XccError::transport("error writing message", e))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| XccError::transport("error writing message", e))
    }
}

/// One decoded frame from the worker.
#[derive(Debug)]
pub struct Frame {
    /// Parsed header line.
    pub header: ReplyHeader,
    /// Exactly `header.bytes` bytes of body (empty when `bytes` was 0 or
    /// absent).
    pub body: Vec<u8>,
}

/// Read half of the framed channel: the worker's stdout.
pub struct FrameReader {
    reader: BufReader<PipeFd>,
}

impl FrameReader {
    /// Create a reader over the local read end of a pipe.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(CHANNEL_BUFFER_SIZE, fd),
        }
    }

    /// Read one line, excluding the trailing newline. EOF is a transport
    /// error: a worker never half-closes mid-conversation.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| XccError::transport("error reading line", e))?;
        if n == 0 {
            return Err(XccError::Transport(
                "error reading line: unexpected end of file".into(),
            ));
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    /// Read one frame: a JSON header line, then exactly `header.bytes` bytes
    /// of body. A missing `type` defaults to `""` and a missing `bytes` to 0
    /// (in which case the body read is skipped entirely).
    pub fn read_frame(&mut self) -> Result<Frame> {
        let line = self.read_line()?;
        let header: ReplyHeader = serde_json::from_str(&line)
            .map_err(|e| XccError::transport("invalid reply header", e))?;
        let mut body = vec![0u8; header.bytes];
        if header.bytes > 0 {
            self.reader
                .read_exact(&mut body)
                .map_err(|e| XccError::transport("error reading reply body", e))?;
        }
        Ok(Frame { header, body })
    }
}
