//! Incremental newline framing of an upstream byte stream.

/// Splits an arbitrary chunked byte stream into newline-terminated lines.
///
/// Bytes are buffered until a `\n` arrives; `scanned` remembers how far the
/// buffer has already been searched so each byte is inspected once.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Remove and return the next complete line, without its terminator.
    ///
    /// Surrounding whitespace (including `\r`) is trimmed and blank lines are
    /// skipped. Returns `None` once no full line remains buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let offset = self.buf[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(offset) = offset else {
                self.scanned = self.buf.len();
                return None;
            };
            let end = self.scanned + offset;
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;

            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    /// Consume whatever unterminated content is left, as one final line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Bytes currently buffered without a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
