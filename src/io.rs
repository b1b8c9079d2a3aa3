//! Input and output endpoints.
//!
//! - `-` or no path means stdin / stdout.
//! - A `.gz` suffix selects gzip; stdin is also sniffed for the gzip magic.
//! - Opening runs on a helper thread so a stalled stdin surfaces as periodic
//!   warnings (and optionally a timeout) instead of a silent hang.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, bounded};
use flate2::Compression as GzLevel;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tracing::{info, warn};

use crate::error::{KmerError, Result};
use crate::pipeline::PipelineConfig;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUF: usize = 1 << 20;

/// Boxed line reader handed to a pipeline producer.
pub type InputReader = Box<dyn BufRead + Send>;

/// Where records come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(PathBuf),
}

impl InputSource {
    /// `-` means stdin; anything else is a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            InputSource::Stdin
        } else {
            InputSource::File(PathBuf::from(arg))
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Stdin => write!(f, "stdin"),
            InputSource::File(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Detected input encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Plain,
    Gzip,
}

fn has_gz_suffix(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// Open an input, detecting gzip. May block on stdin until the first bytes arrive.
pub fn open_input(source: &InputSource) -> Result<(InputReader, InputFormat)> {
    match source {
        InputSource::File(path) => {
            let file = File::open(path)?;
            if has_gz_suffix(path) {
                let dec = MultiGzDecoder::new(BufReader::new(file));
                Ok((
                    Box::new(BufReader::with_capacity(READ_BUF, dec)),
                    InputFormat::Gzip,
                ))
            } else {
                Ok((
                    Box::new(BufReader::with_capacity(READ_BUF, file)),
                    InputFormat::Plain,
                ))
            }
        }
        InputSource::Stdin => sniff(BufReader::with_capacity(READ_BUF, io::stdin())),
    }
}

/// Wrap a reader in a gzip decoder when it starts with the gzip magic.
pub fn sniff<R: BufRead + Send + 'static>(mut reader: R) -> Result<(InputReader, InputFormat)> {
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok((
            Box::new(BufReader::with_capacity(READ_BUF, MultiGzDecoder::new(reader))),
            InputFormat::Gzip,
        ))
    } else {
        Ok((Box::new(reader), InputFormat::Plain))
    }
}

/// Open `source` on a helper thread and wait for it, warning every
/// `startup_warn_interval` and failing with `Timeout` after `startup_timeout`.
pub fn open_with_watchdog(source: &InputSource, cfg: &PipelineConfig) -> Result<InputReader> {
    let (tx, rx) = bounded(1);
    let src = source.clone();
    std::thread::Builder::new()
        .name("kmatch-open".into())
        .spawn(move || {
            let _ = tx.send(open_input(&src));
        })?;

    let started = Instant::now();
    loop {
        match rx.recv_timeout(cfg.warn_interval()) {
            Ok(opened) => {
                let (reader, format) = opened?;
                info!(input = %source, ?format, "opened input");
                return Ok(reader);
            }
            Err(RecvTimeoutError::Timeout) => {
                let waited = started.elapsed();
                if let Some(limit) = cfg.timeout() {
                    if waited >= limit {
                        return Err(KmerError::Timeout {
                            what: format!("input format of {source}"),
                            waited,
                        });
                    }
                }
                warn!(
                    input = %source,
                    waited_secs = waited.as_secs(),
                    "still waiting for input; is anything being written to it?"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(KmerError::Io(io::Error::other(format!(
                    "input opener for {source} exited without reporting"
                ))));
            }
        }
    }
}

/// Concatenate several inputs into one reader, opened lazily in order.
///
/// A source whose last line lacks a terminator is closed with `\n` so records
/// never run across source boundaries.
pub fn open_chain(sources: &[InputSource], cfg: &PipelineConfig) -> Result<InputReader> {
    match sources {
        [] => open_with_watchdog(&InputSource::Stdin, cfg),
        [one] => open_with_watchdog(one, cfg),
        [first, rest @ ..] => Ok(Box::new(ChainReader {
            current: open_with_watchdog(first, cfg)?,
            pending: rest.iter().rev().cloned().collect(),
            cfg: cfg.clone(),
            at_line_start: true,
            inject_newline: false,
        })),
    }
}

struct ChainReader {
    current: InputReader,
    /// Remaining sources, last to open first.
    pending: Vec<InputSource>,
    cfg: PipelineConfig,
    at_line_start: bool,
    inject_newline: bool,
}

impl ChainReader {
    fn advance(&mut self) -> io::Result<bool> {
        match self.pending.pop() {
            None => Ok(false),
            Some(next) => {
                self.current = open_with_watchdog(&next, &self.cfg).map_err(|e| match e {
                    KmerError::Io(io) => io,
                    other => io::Error::other(other.to_string()),
                })?;
                Ok(true)
            }
        }
    }
}

impl Read for ChainReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let avail = self.fill_buf()?;
            let n = avail.len().min(buf.len());
            buf[..n].copy_from_slice(&avail[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ChainReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        loop {
            if self.inject_newline {
                return Ok(&b"\n"[..]);
            }
            if !self.current.fill_buf()?.is_empty() {
                break;
            }
            if !self.at_line_start {
                self.inject_newline = true;
                self.at_line_start = true;
                continue;
            }
            if !self.advance()? {
                return Ok(&[]);
            }
        }
        self.current.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if amt == 0 {
            return;
        }
        if self.inject_newline {
            self.inject_newline = false;
            return;
        }
        if let Ok(buf) = self.current.fill_buf() {
            if let Some(&last) = buf.get(amt - 1) {
                self.at_line_start = last == b'\n';
            }
        }
        self.current.consume(amt)
    }
}

// ---------------- Output ----------------

/// Where records go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
    Gzip(PathBuf),
}

impl OutputTarget {
    /// `-` means stdout; a `.gz` suffix selects gzip.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            return OutputTarget::Stdout;
        }
        let path = PathBuf::from(arg);
        if has_gz_suffix(&path) {
            OutputTarget::Gzip(path)
        } else {
            OutputTarget::File(path)
        }
    }

    /// Create the destination.
    pub fn open(&self) -> Result<OutputStream> {
        Ok(match self {
            OutputTarget::Stdout => {
                let w: Box<dyn Write + Send> = Box::new(io::stdout());
                OutputStream::Plain(BufWriter::with_capacity(READ_BUF, w))
            }
            OutputTarget::File(p) => {
                let w: Box<dyn Write + Send> = Box::new(File::create(p)?);
                OutputStream::Plain(BufWriter::with_capacity(READ_BUF, w))
            }
            OutputTarget::Gzip(p) => OutputStream::Gzip(GzEncoder::new(
                BufWriter::with_capacity(READ_BUF, File::create(p)?),
                GzLevel::default(),
            )),
        })
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "stdout"),
            OutputTarget::File(p) | OutputTarget::Gzip(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Open output destination.
pub enum OutputStream {
    Plain(BufWriter<Box<dyn Write + Send>>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl OutputStream {
    /// Flush and, for gzip, write the stream trailer.
    pub fn close(self) -> io::Result<()> {
        match self {
            OutputStream::Plain(mut w) => w.flush(),
            OutputStream::Gzip(enc) => enc.finish()?.flush(),
        }
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputStream::Plain(w) => w.write(buf),
            OutputStream::Gzip(w) => w.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            OutputStream::Plain(w) => w.write_all(buf),
            OutputStream::Gzip(w) => w.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::Plain(w) => w.flush(),
            OutputStream::Gzip(w) => w.flush(),
        }
    }
}
