/// Write-capped byte accumulator for captured process output.
///
/// Writes past `capacity` are reported as fully written and dropped, so a
/// runaway producer keeps making progress while memory stays bounded. A
/// write that straddles the limit keeps only the prefix that fits.
/// `truncated()` tells the caller whether anything was dropped.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            truncated: false,
        }
    }

    /// Append `chunk`, returning `chunk.len()` regardless of how much was kept.
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        let remaining = self.capacity - self.buf.len();
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
        chunk.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Lossy UTF-8 view; truncation may split a multi-byte sequence.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

impl std::io::Write for CappedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(CappedBuffer::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
