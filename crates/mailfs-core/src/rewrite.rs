//! Streaming splice of a byte patch into existing content

use std::io::{self, Read};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Prefix,
    Patch,
    Tail,
}

/// Reads `original` with `[offset, offset + patch.len())` replaced by `patch`.
///
/// Single forward pass: construct a new rewriter for every read-through.
/// If `original` ends before `offset`, the output is whatever was read followed
/// by the patch.
#[derive(Debug)]
pub struct ContentRewriter<R> {
    original: R,
    patch: Vec<u8>,
    offset: u64,
    position: u64,
    patch_pos: usize,
    phase: Phase,
    original_exhausted: bool,
}

impl<R: Read> ContentRewriter<R> {
    pub fn new(original: R, patch: Vec<u8>, offset: u64) -> Self {
        Self {
            original,
            patch,
            offset,
            position: 0,
            patch_pos: 0,
            phase: Phase::Prefix,
            original_exhausted: false,
        }
    }

    /// Next byte, or `None` at the end of the output.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Discards up to `n` bytes of output and returns how many were skipped.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        io::copy(&mut self.by_ref().take(n), &mut io::sink())
    }

    /// Bytes known to be readable without reaching the unknown-length tail.
    pub fn available(&self) -> u64 {
        let prefix = match self.phase {
            Phase::Prefix if !self.original_exhausted => self.offset.saturating_sub(self.position),
            _ => 0,
        };
        let patch = match self.phase {
            Phase::Tail => 0,
            _ => (self.patch.len() - self.patch_pos) as u64,
        };
        prefix + patch
    }

    fn enter_tail(&mut self) -> io::Result<()> {
        self.phase = Phase::Tail;
        if !self.original_exhausted {
            let overwritten = self.patch.len() as u64;
            let skipped = io::copy(&mut (&mut self.original).take(overwritten), &mut io::sink())?;
            if skipped < overwritten {
                self.original_exhausted = true;
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for ContentRewriter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.phase {
                Phase::Prefix => {
                    if self.position >= self.offset || self.original_exhausted {
                        self.phase = Phase::Patch;
                        continue;
                    }
                    let want = std::cmp::min(buf.len() as u64, self.offset - self.position) as usize;
                    let n = self.original.read(&mut buf[..want])?;
                    if n == 0 {
                        self.original_exhausted = true;
                        continue;
                    }
                    self.position += n as u64;
                    return Ok(n);
                }
                Phase::Patch => {
                    if self.patch_pos >= self.patch.len() {
                        self.enter_tail()?;
                        continue;
                    }
                    let n = std::cmp::min(buf.len(), self.patch.len() - self.patch_pos);
                    buf[..n].copy_from_slice(&self.patch[self.patch_pos..self.patch_pos + n]);
                    self.patch_pos += n;
                    self.position += n as u64;
                    return Ok(n);
                }
                Phase::Tail => {
                    if self.original_exhausted {
                        return Ok(0);
                    }
                    let n = self.original.read(buf)?;
                    if n == 0 {
                        self.original_exhausted = true;
                    }
                    self.position += n as u64;
                    return Ok(n);
                }
            }
        }
    }
}
