//! Encoding of captured process output into log lines.
//!
//! Each chunk read from a child's stdout or stderr becomes exactly one line:
//! a two byte stream marker (`$&` for stdout, `&$` for stderr) followed by the
//! chunk with backslashes and newlines escaped, terminated by `\n`. Readers can
//! therefore split a log on newlines and still recover which stream every
//! chunk came from.

pub const STDOUT_PREFIX: &[u8; 2] = b"$&";
pub const STDERR_PREFIX: &[u8; 2] = b"&$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn prefix(self) -> &'static [u8; 2] {
        match self {
            OutputStream::Stdout => STDOUT_PREFIX,
            OutputStream::Stderr => STDERR_PREFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// Encode one output chunk as a single newline-terminated log line.
pub fn encode(stream: OutputStream, chunk: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(chunk.len() + 4);
    line.extend_from_slice(stream.prefix());
    for &byte in chunk {
        match byte {
            b'\\' => line.extend_from_slice(b"\\\\"),
            b'\n' => line.extend_from_slice(b"\\n"),
            other => line.push(other),
        }
    }
    line.push(b'\n');
    line
}

/// Parse a single log line, with or without its trailing newline.
///
/// Returns `None` for lines that carry no stream marker.
pub fn decode(line: &[u8]) -> Option<LogLine> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let (stream, body) = if let Some(body) = line.strip_prefix(STDOUT_PREFIX) {
        (OutputStream::Stdout, body)
    } else if let Some(body) = line.strip_prefix(STDERR_PREFIX) {
        (OutputStream::Stderr, body)
    } else {
        return None;
    };

    let mut data = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            data.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'n') => data.push(b'\n'),
            Some(b'\\') => data.push(b'\\'),
            Some(other) => {
                data.push(b'\\');
                data.push(other);
            }
            None => data.push(b'\\'),
        }
    }

    Some(LogLine { stream, data })
}

/// Parse every line of a persisted log, skipping unmarked lines.
pub fn decode_all(content: &[u8]) -> Vec<LogLine> {
    content
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(decode)
        .collect()
}

/// Drop the leading partial line of a window that starts mid-file.
///
/// Everything up to and including the first newline is discarded; a window
/// with no newline holds no complete line and yields nothing.
pub fn skip_partial_line(content: &[u8]) -> &[u8] {
    match content.iter().position(|&b| b == b'\n') {
        Some(end) => &content[end + 1..],
        None => &[],
    }
}

/// Reassemble the raw bytes one stream produced.
pub fn reassemble(content: &[u8], stream: OutputStream) -> Vec<u8> {
    decode_all(content)
        .into_iter()
        .filter(|line| line.stream == stream)
        .flat_map(|line| line.data)
        .collect()
}
