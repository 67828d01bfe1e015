//! Content-defined chunking ("hashsplit").
//!
//! A byte stream is segmented at boundaries chosen by the data: after each
//! byte enters the rolling checksum, a boundary is declared when the low
//! `bits` bits of the digest are all zero. A hard ceiling of `4 · 2^bits`
//! bytes bounds the blob size on streams that never split naturally; no
//! minimum size is enforced, so tiny blobs are legal.
//!
//! Each boundary carries a **level**: the number of trailing one-bits of
//! `digest >> bits`. The tree builder closes one subtree layer per level, so
//! a level-`L` boundary simultaneously ends the blob and `L` layers of the
//! chunk tree. A hard-ceiling boundary and a mid-stream flush are level 0;
//! end-of-stream flushes the pending blob at [`MAX_LEVEL`] so every open
//! subtree closes cleanly.
//!
//! The splitter is a pure transducer: it buffers at most one blob's worth
//! of bytes regardless of input length, and the emitted blob sequence
//! depends only on the byte stream — never on how the stream was sliced
//! into `feed` calls.

use crate::errors::Result;
use crate::rollsum::Rollsum;

/// Default boundary significance. `bits = 13` gives ~8 KiB expected blobs.
pub const DEFAULT_BLOB_BITS: u32 = 13;

/// Synthetic level attached to the final flush, higher than any natural
/// boundary level so all pending subtrees close.
pub const MAX_LEVEL: u32 = u32::BITS;

/// Hard ceiling on blob size for a given `bits` parameter.
#[inline]
pub const fn max_blob_size(bits: u32) -> usize {
    4 << bits
}

/// Streaming hashsplitter. Feed bytes in arbitrary slices; blobs are
/// handed to the sink as `(bytes, level)` the moment a boundary fires.
pub struct HashSplitter {
    bits:        u32,
    mask:        u32,
    ceiling:     usize,
    sum:         Rollsum,
    buf:         Vec<u8>,
    emitted_any: bool,
}

impl HashSplitter {
    pub fn new(bits: u32) -> Self {
        debug_assert!((1..=22).contains(&bits), "bits out of range: {bits}");
        HashSplitter {
            bits,
            mask:        (1u32 << bits) - 1,
            ceiling:     max_blob_size(bits),
            sum:         Rollsum::new(),
            buf:         Vec::with_capacity(max_blob_size(bits.min(16))),
            emitted_any: false,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Push bytes through the splitter. `emit(blob, level)` is called once
    /// per completed blob, in stream order.
    pub fn feed<F>(&mut self, bytes: &[u8], emit: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], u32) -> Result<()>,
    {
        for &b in bytes {
            self.sum.roll(b);
            self.buf.push(b);

            let digest = self.sum.digest();
            if digest & self.mask == 0 {
                let level = (digest >> self.bits).trailing_ones();
                self.flush(level, emit)?;
            } else if self.buf.len() >= self.ceiling {
                // Pathological stream with no natural split point.
                self.flush(0, emit)?;
            }
        }
        Ok(())
    }

    /// End of stream: emit whatever is pending at the synthetic top level.
    ///
    /// An empty stream still emits exactly one zero-length blob, so an
    /// empty file gets a stable identity.
    pub fn finish<F>(mut self, emit: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], u32) -> Result<()>,
    {
        if !self.buf.is_empty() || !self.emitted_any {
            let buf = std::mem::take(&mut self.buf);
            self.emitted_any = true;
            emit(&buf, MAX_LEVEL)?;
        }
        Ok(())
    }

    fn flush<F>(&mut self, level: u32, emit: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], u32) -> Result<()>,
    {
        emit(&self.buf, level)?;
        self.buf.clear();
        self.emitted_any = true;
        Ok(())
    }
}

/// Drive a reader through a splitter in bounded reads.
pub fn split_reader<R, F>(mut reader: R, bits: u32, emit: &mut F) -> Result<()>
where
    R: std::io::Read,
    F: FnMut(&[u8], u32) -> Result<()>,
{
    let mut splitter = HashSplitter::new(bits);
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        splitter.feed(&chunk[..n], emit)?;
    }
    splitter.finish(emit)
}
