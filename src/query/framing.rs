//! Newline framing for the ServerQuery byte stream.
//!
//! The protocol is plain text with one message per `\n`-terminated line:
//!
//! ```text
//! TS3\n\r
//! Welcome to the TeamSpeak 3 ServerQuery interface ...\n\r
//! login client_login_name=serveradmin client_login_password=secret\n
//! error id=0 msg=ok\n\r
//! ```
//!
//! The server terminates lines with `\n\r`, so the `\r` ends up at the start
//! of the following line. Lines are therefore returned untrimmed and the
//! connection task trims them and skips the ones that end up blank.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Line delimiter used in both directions.
pub const LINE_DELIMITER: u8 = b'\n';

/// Maximum line length (16MB) to prevent OOM from malicious/buggy servers.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Splits an async byte stream into lines.
///
/// Incomplete trailing data is kept between reads. When the stream ends a
/// non-empty remainder is yielded as a final line, after which every call
/// returns `Ok(None)`.
#[derive(Debug)]
pub struct LineFramer<R> {
    reader: BufReader<R>,
    /// Bytes of the line currently being assembled.
    pending: Vec<u8>,
    max_line_length: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    /// Wrap a reader, allowing lines up to [`MAX_LINE_LENGTH`] bytes.
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, MAX_LINE_LENGTH)
    }

    /// Wrap a reader with a custom line length limit.
    pub fn with_max_line_length(reader: R, max_line_length: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            max_line_length,
            finished: false,
        }
    }

    /// Read the next line, without its delimiter.
    ///
    /// Returns `Ok(None)` once the stream is exhausted.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. Partially read bytes stay in the framer
    /// and the next call continues the same line, so it can be used as a
    /// `tokio::select!` branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails or a line exceeds the
    /// length limit (not counting the delimiter). The framer is exhausted
    /// afterwards.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        // Read at most one byte past the limit so an unterminated flood is
        // detected without buffering it.
        let budget = (self.max_line_length + 1).saturating_sub(self.pending.len()) as u64;
        let bytes_read = (&mut self.reader)
            .take(budget)
            .read_until(LINE_DELIMITER, &mut self.pending)
            .await
            .context("Failed to read from query connection")?;

        let terminated = self.pending.last() == Some(&LINE_DELIMITER);
        if !terminated && self.pending.len() > self.max_line_length {
            let size = self.pending.len();
            self.pending = Vec::new();
            self.finished = true;
            return Err(anyhow!(
                "Line length {} exceeds maximum {} bytes",
                size,
                self.max_line_length
            ));
        }

        if bytes_read == 0 && self.pending.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.pending);
        if terminated {
            line.pop();
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Write one command line followed by the delimiter and flush.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(LINE_DELIMITER);

    writer
        .write_all(&frame)
        .await
        .context("Failed to write command line")?;

    writer.flush().await.context("Failed to flush command line")?;

    Ok(())
}
