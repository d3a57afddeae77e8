//! ASCII line protocol spoken by the tunnel's Arduino.
//!
//! One LF-terminated line per sample, fields separated by commas:
//!
//! ```text
//! 1234.50,5.231        rpm, lift force
//! 1234.50,5.231,1      rpm, lift force, validity (0/1/true/false)
//! RPM:1234.5,LIFT:5.23 key-prefixed form (keys are ignored)
//! ```
//!
//! Anything else (empty lines, boot banners, partial lines, non-finite numbers) is not a
//! frame and yields `None`.
//!
//! [`LineReader`] assembles lines from a byte stream. Bytes of an unfinished line stay in
//! the reader across timeouts and cancelled reads, so a line split over two reads is
//! returned whole by the second one.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::core::RawReading;

/// Parse one protocol line.
pub fn parse_frame(line: &str) -> Option<RawReading> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut fields = trimmed.split(',').map(field_value);
    let rpm = parse_number(fields.next()?)?;
    let lift_force = parse_number(fields.next()?)?;
    let is_valid = match fields.next() {
        None => true,
        Some(flag) => parse_flag(flag)?,
    };
    if fields.next().is_some() {
        return None;
    }

    Some(RawReading {
        rpm,
        lift_force,
        is_valid,
    })
}

/// Outcome of one [`LineReader::read_line`].
#[derive(Debug)]
pub enum LineRead {
    /// A complete line, terminator included
    Line(String),
    /// No terminator arrived in time; the bytes seen so far are kept
    TimedOut,
    /// End of stream (an unterminated tail is discarded with it)
    Closed,
    /// The stream failed
    Failed(std::io::Error),
}

/// Line assembler over a buffered byte stream.
pub struct LineReader<R> {
    reader: R,
    partial: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Wrap a stream with an empty line buffer
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
        }
    }

    /// Bytes of the unfinished line
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Wait up to `limit` for the rest of the current line.
    ///
    /// Cancel safe: dropping the future keeps every byte already read for the next call.
    pub async fn read_line(&mut self, limit: Duration) -> LineRead {
        let read = self.reader.read_until(b'\n', &mut self.partial);
        match tokio::time::timeout(limit, read).await {
            Err(_) => LineRead::TimedOut,
            Ok(Err(e)) => LineRead::Failed(e),
            Ok(Ok(0)) => LineRead::Closed,
            Ok(Ok(_)) if self.partial.last() != Some(&b'\n') => LineRead::Closed,
            Ok(Ok(_)) => {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                LineRead::Line(line)
            }
        }
    }
}

/// Strips an optional `KEY:` prefix.
fn field_value(field: &str) -> &str {
    match field.split_once(':') {
        Some((_, value)) => value.trim(),
        None => field.trim(),
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}
