//! Decoding of daemon output streams.
//!
//! Non-TTY container output is multiplexed: each frame carries an 8-byte
//! header (`[stream, 0, 0, 0, len_be32]`) followed by `len` payload bytes.

use std::io::{self, Read};

const HEADER_LEN: usize = 8;

/// Splits a byte stream into lines, buffering partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, emitting every complete non-empty line.
    pub fn push(&mut self, chunk: &[u8], on_line: &mut dyn FnMut(&str)) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit(&line[..line.len() - 1], on_line);
        }
    }

    /// Emit whatever is left after the stream ended. Only call this when no
    /// more output can follow; a cut-off line would otherwise be emitted
    /// twice, once truncated.
    pub fn finish(&mut self, on_line: &mut dyn FnMut(&str)) {
        let rest = std::mem::take(&mut self.pending);
        emit(&rest, on_line);
    }
}

fn emit(raw: &[u8], on_line: &mut dyn FnMut(&str)) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if !text.is_empty() {
        on_line(text);
    }
}

/// Read a multiplexed stream to its end, handing each frame's payload and
/// stream number (1 = stdout, 2 = stderr) to `on_frame`.
pub fn demux(
    mut reader: impl Read,
    on_frame: &mut dyn FnMut(u8, &[u8]),
) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        match read_full(&mut reader, &mut header)? {
            0 => return Ok(()),
            n if n < HEADER_LEN => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated stream frame header",
                ))
            }
            _ => {}
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        on_frame(header[0], &payload);
    }
}

/// Split a multiplexed log stream into lines. The trailing partial line is
/// emitted only when the stream ended cleanly and `stopped` reports that
/// the container exited; a later attach replays it in full otherwise.
pub fn follow_lines(
    reader: impl Read,
    stopped: impl FnOnce() -> bool,
    on_line: &mut dyn FnMut(&str),
) -> io::Result<()> {
    let mut lines = LineBuffer::new();
    let result = demux(reader, &mut |_, payload| lines.push(payload, on_line));
    if result.is_ok() && stopped() {
        lines.finish(on_line);
    }
    result
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encode one frame; used by tests and the mock engine.
pub fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[stream, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
