use alloc::vec::Vec;

/// Sequential byte supply for the parser.
///
/// Sources are single-owner and forward-only; no seeking is required. A
/// short [`read`](Source::read) or [`read_into`](Source::read_into) is how a
/// source signals end of input.
pub trait Source {
    /// Look at the next byte without consuming it.
    fn peek(&mut self) -> Option<u8>;

    /// Consume and return the next byte.
    fn get(&mut self) -> Option<u8>;

    /// Discard up to `count` bytes.
    fn ignore(&mut self, count: usize);

    /// Fill `buf` from the stream, returning how many bytes were copied.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Append up to `count` bytes to `buf`, returning how many arrived.
    fn read_into(&mut self, buf: &mut Vec<u8>, count: usize) -> usize;

    /// Bytes consumed so far.
    fn position(&self) -> u64;
}

/// A [`Source`] over a borrowed byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl<'a> From<&'a [u8]> for SliceSource<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

impl Source for SliceSource<'_> {
    fn peek(&mut self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn get(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn ignore(&mut self, count: usize) {
        self.pos = self.pos.saturating_add(count).min(self.data.len());
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.remaining());
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        count
    }

    fn read_into(&mut self, buf: &mut Vec<u8>, count: usize) -> usize {
        let count = count.min(self.remaining());
        buf.extend_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        count
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}
