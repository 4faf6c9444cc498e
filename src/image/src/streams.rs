//! Explicit standard streams.
//!
//! Operations never touch the process stdio directly; they write through an
//! [`IoStreams`] so the CLI can route progress to stderr and tests can
//! capture everything.

use std::io::{self, IsTerminal, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cloneable, thread-safe writer handle.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write one line.
    pub fn line(&self, line: impl AsRef<str>) -> io::Result<()> {
        let mut w = self.inner.lock();
        w.write_all(line.as_ref().as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// A cloneable stdin handle.
#[derive(Clone)]
pub struct SharedReader {
    inner: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl SharedReader {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(reader))),
        }
    }
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }
}

/// In-memory buffer that can stand in for a stream and be read back.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Standard streams of one invocation.
#[derive(Clone)]
pub struct IoStreams {
    pub stdin: SharedReader,
    pub stdout: SharedWriter,
    pub stderr: SharedWriter,
    /// Stdout is attached to a terminal.
    pub stdout_is_terminal: bool,
    /// Stdin is attached to a terminal.
    pub stdin_is_terminal: bool,
    /// Stdin is zero-sized and not a pipe, so there is nothing to read.
    pub stdin_is_empty: bool,
}

impl IoStreams {
    /// The process streams.
    pub fn system() -> Self {
        Self {
            stdout_is_terminal: io::stdout().is_terminal(),
            stdin_is_terminal: io::stdin().is_terminal(),
            stdin_is_empty: stdin_is_empty(),
            stdin: SharedReader::new(io::stdin()),
            stdout: SharedWriter::new(io::stdout()),
            stderr: SharedWriter::new(io::stderr()),
        }
    }

    /// Streams backed by buffers; returns `(streams, stdout, stderr)`.
    pub fn buffered(stdin: &[u8]) -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let streams = Self {
            stdin_is_empty: stdin.is_empty(),
            stdin: SharedReader::new(io::Cursor::new(stdin.to_vec())),
            stdout: SharedWriter::new(out.clone()),
            stderr: SharedWriter::new(err.clone()),
            stdout_is_terminal: false,
            stdin_is_terminal: false,
        };
        (streams, out, err)
    }
}

/// True when fd 0 is zero-sized and not a FIFO.
fn stdin_is_empty() -> bool {
    // SAFETY: fstat only writes into the zeroed stat buffer we own.
    unsafe {
        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(libc::STDIN_FILENO, &mut stat) != 0 {
            return true;
        }
        let is_fifo = (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO;
        stat.st_size == 0 && !is_fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_streams_capture() {
        let (mut streams, out, err) = IoStreams::buffered(b"input");
        streams.stdout.line("hello").unwrap();
        streams.stderr.line("warn").unwrap();
        let mut input = String::new();
        streams.stdin.read_to_string(&mut input).unwrap();

        assert_eq!(out.text(), "hello\n");
        assert_eq!(err.text(), "warn\n");
        assert_eq!(input, "input");
        assert!(!streams.stdin_is_empty);
        assert!(!streams.stdout_is_terminal);
    }

    #[test]
    fn test_empty_stdin_flag() {
        let (streams, _, _) = IoStreams::buffered(b"");
        assert!(streams.stdin_is_empty);
    }
}
