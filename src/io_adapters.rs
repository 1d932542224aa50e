use std::io::{self, BufRead, BufReader, Cursor, Read, Result as IoResult, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Memory-backed reader for handlers.
///
/// Public so it can be constructed from other modules and from tests.
pub struct MemReader {
    cursor: Cursor<Vec<u8>>,
}

impl MemReader {
    /// Create a MemReader that will read from the provided buffer.
    pub fn new(buf: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(buf),
        }
    }
}

impl Read for MemReader {
    fn read(&mut self, out: &mut [u8]) -> IoResult<usize> {
        self.cursor.read(out)
    }
}

impl BufRead for MemReader {
    fn fill_buf(&mut self) -> IoResult<&[u8]> {
        self.cursor.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.cursor.consume(amt)
    }
}

/// Memory-backed writer for capturing output.
///
/// Clones share the same buffer, so one clone can be handed to a handler
/// (possibly on a job thread) while another is kept to inspect the output.
#[derive(Clone, Default)]
pub struct MemWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collected output, lossily decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

/// Where a session's output goes.
#[derive(Clone)]
pub enum Sink {
    Stdout,
    Stderr,
    Memory(MemWriter),
}

impl Sink {
    /// A fresh writer for one handler invocation.
    pub fn writer(&self) -> Box<dyn Write + Send> {
        match self {
            Sink::Stdout => Box::new(io::stdout()),
            Sink::Stderr => Box::new(io::stderr()),
            Sink::Memory(mem) => Box::new(mem.clone()),
        }
    }
}

/// Where a session's input comes from.
#[derive(Clone)]
pub enum Source {
    Stdin,
    Memory(Arc<Vec<u8>>),
    Empty,
}

impl Source {
    /// A fresh reader for one handler invocation.
    ///
    /// Memory sources hand every invocation its own copy of the buffer.
    pub fn reader(&self) -> Box<dyn BufRead + Send> {
        match self {
            Source::Stdin => Box::new(BufReader::new(io::stdin())),
            Source::Memory(data) => Box::new(MemReader::new(data.as_ref().clone())),
            Source::Empty => Box::new(io::empty()),
        }
    }
}

/// The three standard streams of an interactive session.
#[derive(Clone)]
pub struct SessionIo {
    pub stdin: Source,
    pub stdout: Sink,
    pub stderr: Sink,
}

impl SessionIo {
    /// Streams bound to the controlling terminal.
    pub fn terminal() -> Self {
        Self {
            stdin: Source::Stdin,
            stdout: Sink::Stdout,
            stderr: Sink::Stderr,
        }
    }

    /// Streams backed by memory: `input` is served on stdin, and the returned
    /// writers collect stdout and stderr.
    pub fn captured(input: &[u8]) -> (Self, MemWriter, MemWriter) {
        let out = MemWriter::new();
        let err = MemWriter::new();
        let io = Self {
            stdin: Source::Memory(Arc::new(input.to_vec())),
            stdout: Sink::Memory(out.clone()),
            stderr: Sink::Memory(err.clone()),
        };
        (io, out, err)
    }
}
