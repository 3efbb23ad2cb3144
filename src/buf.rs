//! Chunked FIFO byte buffer for non-blocking I/O pipelines.
//!
//! Appends never move existing bytes: storage is a queue of fixed-size
//! chunks, a read cursor in the head chunk, and a derived write cursor at
//! `rpos + len`. Copy access (`write`/`read`) and zero-copy access
//! (`dwrite_lock`/`dwrite_unlock`, `dread_lock`/`dread_unlock`) coexist;
//! the lock pairs let a caller run one `recvv`/`sendv` straight against
//! chunk interiors and then commit the byte count the kernel actually
//! moved.
//!
//! Lock rules: the returned slice vectors borrow the buffer, so they cannot
//! outlive it; between lock and unlock the lock counters keep the protocol
//! honest — a write-locked buffer still accepts `read`, a read-locked
//! buffer still accepts `write`, and the conflicting operation fails with
//! `Busy`.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};

use crate::error::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
pub struct ChunkBuf {
    chunks: VecDeque<Box<[u8]>>,
    chunk_size: usize,
    /// Read offset inside the head chunk; always < chunk_size.
    rpos: usize,
    /// Committed readable bytes. The write cursor is `rpos + len`.
    len: usize,
    /// 0 = unlimited.
    limit: usize,
    /// Byte count locked by an outstanding dread_lock.
    rlock: Option<usize>,
    /// Byte count reserved by an outstanding dwrite_lock.
    wlock: Option<usize>,
}

impl Default for ChunkBuf {
    fn default() -> ChunkBuf {
        ChunkBuf::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkBuf {
    /// `chunk_size` of 0 falls back to the default.
    pub fn new(chunk_size: usize) -> ChunkBuf {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        ChunkBuf {
            chunks: VecDeque::new(),
            chunk_size,
            rpos: 0,
            len: 0,
            limit: 0,
            rlock: None,
            wlock: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Cap the stored length; 0 removes the cap. Bytes already stored are
    /// unaffected, further writes are checked against the new cap.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_read_locked(&self) -> bool {
        self.rlock.is_some()
    }

    pub fn is_write_locked(&self) -> bool {
        self.wlock.is_some()
    }

    /// Would storing `add` more bytes breach the limit?
    pub fn will_overflow(&self, add: usize) -> bool {
        self.limit != 0 && self.len + add > self.limit
    }

    /// Append a copy of `data`, allocating chunks as needed. Whole or
    /// nothing: a limit breach stores none of it.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.wlock.is_some() {
            return Err(Error::Busy("buffer is write-locked"));
        }
        if self.will_overflow(data.len()) {
            return Err(Error::Overflow);
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let abs = self.rpos + self.len;
            let ci = abs / self.chunk_size;
            let off = abs % self.chunk_size;
            if ci == self.chunks.len() {
                self.chunks.push_back(vec![0u8; self.chunk_size].into_boxed_slice());
            }
            let take = remaining.len().min(self.chunk_size - off);
            self.chunks[ci][off..off + take].copy_from_slice(&remaining[..take]);
            self.len += take;
            remaining = &remaining[take..];
        }
        Ok(data.len())
    }

    /// Copy out up to `out.len()` bytes from the head, freeing drained
    /// chunks.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.rlock.is_some() {
            return Err(Error::Busy("buffer is read-locked"));
        }
        let want = out.len().min(self.len);
        let mut copied = 0;
        while copied < want {
            let abs = self.rpos + copied;
            let ci = abs / self.chunk_size;
            let off = abs % self.chunk_size;
            let take = (want - copied).min(self.chunk_size - off);
            out[copied..copied + take].copy_from_slice(&self.chunks[ci][off..off + take]);
            copied += take;
        }
        self.consume(want);
        Ok(want)
    }

    /// Reserve exactly `n` writable bytes past the write cursor and return
    /// mutable slices covering them. The reservation is invisible to `len`
    /// until committed by `dwrite_unlock`. `n == 0` reserves nothing and
    /// takes no lock.
    pub fn dwrite_lock(&mut self, n: usize) -> Result<Vec<IoSliceMut<'_>>> {
        if self.wlock.is_some() {
            return Err(Error::Busy("buffer is write-locked"));
        }
        if self.will_overflow(n) {
            return Err(Error::Overflow);
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        let end = self.rpos + self.len + n;
        while self.chunks.len() * self.chunk_size < end {
            self.chunks.push_back(vec![0u8; self.chunk_size].into_boxed_slice());
        }
        self.wlock = Some(n);

        let abs = self.rpos + self.len;
        let ci = abs / self.chunk_size;
        let mut off = abs % self.chunk_size;
        let mut remaining = n;
        let chunk_size = self.chunk_size;
        let mut iovs = Vec::new();
        for chunk in self.chunks.range_mut(ci..) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk_size - off);
            iovs.push(IoSliceMut::new(&mut chunk[off..off + take]));
            remaining -= take;
            off = 0;
        }
        Ok(iovs)
    }

    /// Commit `written` of the reserved bytes (0 retires the whole
    /// reservation), trim chunks past the new write cursor, release the
    /// lock.
    pub fn dwrite_unlock(&mut self, written: usize) -> Result<()> {
        let reserved = self.wlock.ok_or(Error::InvalidArgument("buffer is not write-locked"))?;
        if written > reserved {
            return Err(Error::InvalidArgument("commit exceeds reservation"));
        }
        self.len += written;
        let keep = (self.rpos + self.len).div_ceil(self.chunk_size);
        self.chunks.truncate(keep);
        self.wlock = None;
        if self.len == 0 {
            self.chunks.clear();
            self.rpos = 0;
        }
        Ok(())
    }

    /// Lock up to `min(n, len)` readable bytes and return slices covering
    /// them for zero-copy send. Returns the locked count. `n == 0` (or an
    /// empty buffer) locks nothing.
    pub fn dread_lock(&mut self, n: usize) -> Result<(usize, Vec<IoSlice<'_>>)> {
        if self.rlock.is_some() {
            return Err(Error::Busy("buffer is read-locked"));
        }
        let avail = n.min(self.len);
        if avail == 0 {
            return Ok((0, Vec::new()));
        }
        self.rlock = Some(avail);

        let ci = self.rpos / self.chunk_size;
        let mut off = self.rpos % self.chunk_size;
        let mut remaining = avail;
        let chunk_size = self.chunk_size;
        let mut iovs = Vec::new();
        for chunk in self.chunks.range(ci..) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk_size - off);
            iovs.push(IoSlice::new(&chunk[off..off + take]));
            remaining -= take;
            off = 0;
        }
        Ok((avail, iovs))
    }

    /// Discard `consumed` bytes from the head (what the kernel actually
    /// took) and release the read lock.
    pub fn dread_unlock(&mut self, consumed: usize) -> Result<()> {
        let locked = self.rlock.ok_or(Error::InvalidArgument("buffer is not read-locked"))?;
        if consumed > locked {
            return Err(Error::InvalidArgument("discard exceeds locked amount"));
        }
        self.rlock = None;
        self.consume(consumed);
        Ok(())
    }

    /// Drop `k` committed bytes from the head, freeing fully drained
    /// chunks. Chunks holding an uncommitted write reservation survive the
    /// empty-buffer reset.
    fn consume(&mut self, k: usize) {
        self.len -= k;
        self.rpos += k;
        while self.rpos >= self.chunk_size && !self.chunks.is_empty() {
            self.chunks.pop_front();
            self.rpos -= self.chunk_size;
        }
        if self.len == 0 && self.wlock.is_none() {
            self.chunks.clear();
            self.rpos = 0;
        }
    }
}
