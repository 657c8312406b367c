use core::{
    fmt,
    ops::{Bound, Deref, RangeBounds},
};
use std::sync::Arc;

use super::reader::{DidntRead, Reader};

/// A trait for types that can back a [`Chunk`] and provide a byte slice view.
///
/// This allows different buffer types (like [`Vec<u8>`] or a static slice) to
/// be used as the backing storage of a [`Chunk`]. The trait requires
/// `Send + Sync` to ensure thread-safe sharing via [`Arc`].
pub trait DynBuf: Send + Sync {
    /// Returns a byte slice view of the entire buffer.
    fn as_slice(&self) -> &[u8];
}

impl DynBuf for Vec<u8> {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl DynBuf for Box<[u8]> {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl<const N: usize> DynBuf for [u8; N] {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl DynBuf for &'static [u8] {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl DynBuf for String {
    fn as_slice(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl DynBuf for &'static str {
    fn as_slice(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// A cloneable wrapper to a contiguous slice of bytes.
///
/// [`Chunk`] provides a cheaply cloneable, reference-counted view into a byte
/// buffer. It uses `Arc` internally to share the underlying buffer across
/// multiple instances, making it ideal for scenarios where buffer data must be
/// passed around without copying.
///
/// The buffer maintains its own start and end offsets, allowing for efficient
/// subslicing via the [`view`](Chunk::view) method without copying data. The
/// message layer relies on views being O(1): a message payload is sliced into
/// wire frames without ever duplicating the payload bytes.
///
/// # Examples
///
/// ```
/// use blipwire::Chunk;
///
/// let chunk: Chunk = vec![0u8, 1, 2, 3, 4, 5].into();
/// let view = chunk.view(2..5).unwrap();
/// assert_eq!(view.as_slice(), &[2, 3, 4]);
///
/// // Views can be chained, and clones share the underlying buffer.
/// let sub = view.view(1..).unwrap();
/// assert_eq!(sub.as_slice(), &[3, 4]);
/// ```
#[derive(Clone)]
pub struct Chunk {
    buf: Arc<dyn DynBuf>,
    start: usize,
    end: usize,
}

impl Chunk {
    /// Creates a new [`Chunk`] with the specified start and end offsets.
    ///
    /// # Errors
    ///
    /// Returns the original buffer if `start > end` or
    /// `end > buf.as_slice().len()`.
    pub fn new(buf: Arc<dyn DynBuf>, start: usize, end: usize) -> Result<Chunk, Arc<dyn DynBuf>> {
        if start <= end && end <= buf.as_slice().len() {
            Ok(Self { buf, start, end })
        } else {
            Err(buf)
        }
    }

    /// Returns an empty [`Chunk`].
    pub fn empty() -> Chunk {
        Self {
            buf: Arc::new(&[][..] as &'static [u8]),
            start: 0,
            end: 0,
        }
    }

    /// Returns the length of the buffer in bytes.
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if the buffer has a length of 0.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a byte slice view of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        // Constructors validate start <= end <= buf.len(), and view() only
        // narrows the range.
        &self.buf.as_slice()[self.start..self.end]
    }

    /// Creates a view into a subrange of this buffer.
    ///
    /// This method creates a new [`Chunk`] that shares the same underlying
    /// buffer but with adjusted offsets. The range is relative to the current
    /// buffer's view.
    ///
    /// # Returns
    ///
    /// Returns `Some(Chunk)` if the range is valid, or `None` if the range is
    /// out of bounds.
    #[must_use]
    pub fn view(&self, range: impl RangeBounds<usize>) -> Option<Self> {
        let start_delta = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end_delta = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len(),
        };
        (start_delta <= end_delta && end_delta <= self.len()).then_some(Chunk {
            buf: Arc::clone(&self.buf),
            start: self.start + start_delta,
            end: self.start + end_delta,
        })
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl<Rhs: AsRef<[u8]> + ?Sized> PartialEq<Rhs> for Chunk {
    fn eq(&self, other: &Rhs) -> bool {
        self.as_slice() == other.as_ref()
    }
}

impl Eq for Chunk {}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x?}", self.as_slice())
    }
}

impl<T> From<Arc<T>> for Chunk
where
    T: DynBuf + 'static,
{
    fn from(buf: Arc<T>) -> Self {
        let end = buf.as_slice().len();
        Self { buf, start: 0, end }
    }
}

impl<T> From<T> for Chunk
where
    T: DynBuf + 'static,
{
    fn from(buf: T) -> Self {
        Self::from(Arc::new(buf))
    }
}

impl Reader for Chunk {
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        if into.len() > self.len() {
            return Err(DidntRead);
        }
        into.copy_from_slice(&self.as_slice()[..into.len()]);
        self.start += into.len();
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DidntRead> {
        let byte = *self.as_slice().first().ok_or(DidntRead)?;
        self.start += 1;
        Ok(byte)
    }

    fn read_chunk(&mut self, len: usize) -> Result<Chunk, DidntRead> {
        let chunk = self.view(..len).ok_or(DidntRead)?;
        self.start += len;
        Ok(chunk)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

/// Internal writer for accumulating bytes and snapshotting them as [`Chunk`]s.
///
/// Each snapshot captures the data written since the last snapshot, as a
/// zero-copy view into the shared allocation. The inbound message layer uses
/// one writer per message: the property block is snapshotted first, then the
/// body keeps accumulating in the same allocation.
#[derive(Debug)]
pub(crate) struct ChunkWriter {
    inner: Arc<Vec<u8>>,
    start: usize,
}

impl ChunkWriter {
    /// Creates a new empty `ChunkWriter`.
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Vec::new()),
            start: 0,
        }
    }

    /// Number of bytes written since the last snapshot.
    pub(crate) fn bytes_written(&self) -> usize {
        self.inner.len() - self.start
    }

    /// Appends `bytes` to the accumulator.
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.writer().extend_from_slice(bytes);
    }

    /// Creates a [`Chunk`] snapshot of the data written since the last
    /// snapshot, and advances the snapshot position past it.
    pub(crate) fn snapshot(&mut self) -> Chunk {
        let chunk = Chunk {
            buf: self.inner.clone(),
            start: self.start,
            end: self.inner.len(),
        };
        self.start = self.inner.len();
        chunk
    }

    fn writer(&mut self) -> &mut Vec<u8> {
        // SAFETY: This Arc-to-mutable-reference cast is sound because:
        // 1. We hold `&mut self`, so no other code can reach `self.inner` through this writer.
        // 2. The Arc is cloned only by `snapshot()`; the returned Chunks are views into ranges [start..end] strictly
        //    below the write position, re-derived from the Vec on every access, and every owner of this writer reads
        //    those snapshots under the same lock that guards writes.
        // 3. The returned reference's lifetime is bound to `&mut self`, so it cannot escape.
        unsafe { &mut *(Arc::as_ptr(&self.inner) as *mut Vec<u8>) }
    }
}
