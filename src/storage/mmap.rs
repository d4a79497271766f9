//! Shared read-write memory mapping for segment files
//!
//! Segments expose their on-disk bytes as a single mutable mapping that is
//! written through `&self`. Mutation is serialized by the owning segment's
//! write mutex; readers never take that mutex and instead rely on the
//! segment's atomic cursor (release store after the byte copy, acquire load
//! before access) to bound the prefix they may touch.

use memmap2::MmapMut;
use std::fs::File;
use std::io;

/// A shared mutable mapping over a whole segment file
///
/// Writers go through [`write_at`](SharedMmap::write_at) while holding the
/// owning segment's write mutex; readers use [`slice`](SharedMmap::slice) /
/// [`read_into`](SharedMmap::read_into) on offsets at or below the segment
/// cursor they loaded with acquire ordering.
pub(crate) struct SharedMmap {
    map: MmapMut,
}

// SAFETY: Sharing the mapping across threads is sound under the segment
// protocol:
// - all stores go through write_at, which is only called with the owning
//   segment's write mutex held, so stores never race each other
// - readers only dereference offsets below the segment cursor; the cursor is
//   published with a release store after the bytes are copied and loaded
//   with acquire before access, so observed prefixes are fully written
// - header bytes are rewritten in place by the single writer; readers obtain
//   header values from the segment's atomics, not from the mapping
unsafe impl Send for SharedMmap {}
unsafe impl Sync for SharedMmap {}

impl SharedMmap {
    /// Map the whole file read-write, shared
    pub fn map(file: &File) -> io::Result<Self> {
        // SAFETY: The file was just opened read-write and stays open for the
        // lifetime of the mapping (the segment owns both). The file is
        // truncated to its final length before mapping and is never resized
        // afterwards, so the mapping never outgrows the file.
        let map = unsafe { MmapMut::map_mut(file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Copy `src` into the mapping at `offset`
    ///
    /// Caller must hold the owning segment's write mutex and must have
    /// bounds-checked the range.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.map.len());
        // SAFETY: The range is within the mapping (asserted above) and the
        // caller holds the segment write mutex, so no concurrent store
        // overlaps this range. Concurrent readers are kept away from the
        // range by the cursor protocol described on the type.
        unsafe {
            let dst = self.map.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(offset), src.len());
        }
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.map[offset..offset + len]
    }

    /// Copy mapping bytes at `offset` into `dst`
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.map[offset..offset + dst.len()]);
    }

    /// Store a big-endian i64 at `offset`
    pub fn put_i64(&self, offset: usize, value: i64) {
        self.write_at(offset, &value.to_be_bytes());
    }

    /// Load a big-endian i64 from `offset`
    pub fn get_i64(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf);
        i64::from_be_bytes(buf)
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        self.write_at(offset, &[value]);
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.map[offset]
    }

    /// Synchronously flush the mapping to the underlying file (msync)
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush()
    }
}

impl std::fmt::Debug for SharedMmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMmap")
            .field("len", &self.map.len())
            .finish()
    }
}
