//! Memory-mapped storage substrate.
//!
//! A store is a single file holding every genome, sequence and segment table
//! of an alignment. Objects inside the file are addressed by byte offsets
//! from the start of the mapping; offset 0 is reserved for the fixed-size
//! header, so 0 doubles as the null offset. Allocation is a bump pointer in
//! the header that only ever grows, and every allocation is padded so the
//! next one starts word-aligned.
//!
//! When writing, `close()` must be called explicitly on success. It clears
//! the dirty flag; a handle dropped on an error path leaves the flag set, so
//! the next open of the file fails instead of reading a half-written store.

use log::debug;
use memmap2::{Mmap, MmapMut};
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};

/// ASCII tag identifying this backend, NUL-padded to 32 bytes on disk.
pub const FORMAT_TAG: &str = "treelift-mmap";
pub const API_MAJOR_VERSION: u32 = 1;
pub const API_MINOR_VERSION: u32 = 1;
/// The header lives at offset 0, so no object ever has that offset.
pub const NULL_OFFSET: u64 = 0;

const TAG_BYTES: usize = 32;
const VERSION_BYTES: usize = 32;
const RESERVED_BYTES: usize = 256;

/// Fixed-size prefix at file offset 0.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StoreHeader {
    format: [u8; TAG_BYTES],
    api_version: [u8; VERSION_BYTES],
    payload_version: [u8; VERSION_BYTES],
    next_offset: u64,
    root_offset: u64,
    dirty: u8,
    reserved: [u8; RESERVED_BYTES],
}

/// Marker for plain-old-data record types that live inside the mapping.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, free of padding-sensitive semantics,
/// valid for any bit pattern, and have alignment no larger than the machine
/// word (allocations are only word-aligned).
pub unsafe trait Persistent: Copy + 'static {}

unsafe impl Persistent for u8 {}
unsafe impl Persistent for u64 {}
unsafe impl Persistent for i64 {}
unsafe impl Persistent for StoreHeader {}

/// Typed byte offset into the store, the persistent analogue of `&T`.
#[repr(transparent)]
pub struct Offset<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Offset<T> {
    pub const NULL: Offset<T> = Offset {
        raw: NULL_OFFSET,
        _marker: PhantomData,
    };

    pub fn new(raw: u64) -> Offset<T> {
        Offset {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.raw == NULL_OFFSET
    }
}

impl<T> Clone for Offset<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Offset<T> {}

impl<T> fmt::Debug for Offset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.raw)
    }
}

unsafe impl<T: 'static> Persistent for Offset<T> {}

/// Round up to the next machine-word multiple.
pub fn align_round(size: u64) -> u64 {
    let word = size_of::<usize>() as u64;
    size.div_ceil(word) * word
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Hook ensuring a byte range is resident before it is dereferenced.
///
/// The default open paths install no hook. Remote-backed mappings provide one
/// and open the store with `open_with_fetcher`, which forces the hook on
/// every resolution.
pub trait PageFetcher {
    fn fetch(&self, offset: u64, len: u64);
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    FormatInvalid {
        path: PathBuf,
    },
    VersionMismatch {
        path: PathBuf,
        found: String,
        expected: u32,
    },
    DirtyOnOpen {
        path: PathBuf,
    },
    CapacityExceeded {
        requested: u64,
        file_size: u64,
    },
    ReadOnlyStore {
        path: PathBuf,
    },
    InvalidLayout(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::FormatInvalid { path } => {
                write!(f, "'{}' is not a treelift mmap store", path.display())
            }
            StoreError::VersionMismatch {
                path,
                found,
                expected,
            } => write!(
                f,
                "'{}' has incompatible format version {} (implementation major version is {})",
                path.display(),
                found,
                expected
            ),
            StoreError::DirtyOnOpen { path } => write!(
                f,
                "'{}' is marked dirty: it was not closed cleanly and its contents cannot be trusted",
                path.display()
            ),
            StoreError::CapacityExceeded {
                requested,
                file_size,
            } => write!(
                f,
                "store is full: cannot allocate {} bytes, specify a file size larger than {}",
                requested, file_size
            ),
            StoreError::ReadOnlyStore { path } => {
                write!(f, "'{}' is open read-only", path.display())
            }
            StoreError::InvalidLayout(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

enum MapInner {
    Ro(Mmap),
    Rw(MmapMut),
}

impl MapInner {
    fn bytes(&self) -> &[u8] {
        match self {
            MapInner::Ro(m) => m,
            MapInner::Rw(m) => m,
        }
    }
}

/// Handle to one mapped store file.
pub struct MmapStore {
    path: PathBuf,
    mode: AccessMode,
    map: MapInner,
    file_size: u64,
    fetcher: Option<Box<dyn PageFetcher>>,
}

impl MmapStore {
    /// Create a new store file of `file_size` bytes and map it read-write.
    ///
    /// The file is marked dirty immediately; it stays dirty until `close()`.
    pub fn create<P: AsRef<Path>>(path: P, file_size: u64) -> Result<MmapStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        let header_size = align_round(size_of::<StoreHeader>() as u64);
        if file_size < header_size {
            return Err(StoreError::CapacityExceeded {
                requested: header_size,
                file_size,
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(file_size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut store = MmapStore {
            path,
            mode: AccessMode::ReadWrite,
            map: MapInner::Rw(map),
            file_size,
            fetcher: None,
        };
        store.init_header(header_size);
        // Push the dirty header to disk so a crash before close() is visible
        // to the next open.
        store.flush()?;
        debug!(
            "created store {} ({} bytes)",
            store.path.display(),
            file_size
        );
        Ok(store)
    }

    /// Map an existing store file.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<MmapStore, StoreError> {
        Self::open_inner(path.as_ref(), mode, None)
    }

    /// Map an existing store file, forcing `fetcher` to run over every byte
    /// range before it is resolved. Used when the mapping is backed by a
    /// remote transport that pages data in on demand.
    pub fn open_with_fetcher<P: AsRef<Path>>(
        path: P,
        mode: AccessMode,
        fetcher: Box<dyn PageFetcher>,
    ) -> Result<MmapStore, StoreError> {
        Self::open_inner(path.as_ref(), mode, Some(fetcher))
    }

    fn open_inner(
        path: &Path,
        mode: AccessMode,
        fetcher: Option<Box<dyn PageFetcher>>,
    ) -> Result<MmapStore, StoreError> {
        let file = match mode {
            AccessMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            AccessMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
        };
        let file_size = file.metadata()?.len();
        if (file_size as usize) < size_of::<StoreHeader>() {
            return Err(StoreError::FormatInvalid {
                path: path.to_path_buf(),
            });
        }
        let map = match mode {
            AccessMode::ReadOnly => MapInner::Ro(unsafe { Mmap::map(&file)? }),
            AccessMode::ReadWrite => MapInner::Rw(unsafe { MmapMut::map_mut(&file)? }),
        };
        let mut store = MmapStore {
            path: path.to_path_buf(),
            mode,
            map,
            file_size,
            fetcher,
        };
        store.validate_header()?;
        if mode == AccessMode::ReadWrite {
            store.header_mut().dirty = 1;
            store.flush()?;
        }
        Ok(store)
    }

    /// Check whether the first bytes of a file carry the store's format tag.
    pub fn is_mmap_file(initial_bytes: &[u8]) -> bool {
        if initial_bytes.len() < TAG_BYTES {
            return false;
        }
        initial_bytes[..TAG_BYTES] == padded_tag()
    }

    fn init_header(&mut self, header_size: u64) {
        let header = self.header_mut();
        header.format = padded_tag();
        header.api_version = pad_string(&format!(
            "{}.{}",
            API_MAJOR_VERSION, API_MINOR_VERSION
        ));
        header.payload_version =
            pad_string(&format!("treelift {}", env!("CARGO_PKG_VERSION")));
        header.next_offset = header_size;
        header.root_offset = NULL_OFFSET;
        header.dirty = 1;
        header.reserved = [0; RESERVED_BYTES];
    }

    fn validate_header(&self) -> Result<(), StoreError> {
        let header = self.header();
        if header.format != padded_tag() {
            return Err(StoreError::FormatInvalid {
                path: self.path.clone(),
            });
        }
        let version = unpad_string(&header.api_version);
        let major = version
            .split('.')
            .next()
            .and_then(|s| s.parse::<u32>().ok());
        // Minor versions may differ; only the major must match.
        if major != Some(API_MAJOR_VERSION) {
            return Err(StoreError::VersionMismatch {
                path: self.path.clone(),
                found: version,
                expected: API_MAJOR_VERSION,
            });
        }
        if header.dirty != 0 {
            return Err(StoreError::DirtyOnOpen {
                path: self.path.clone(),
            });
        }
        if header.next_offset > self.file_size {
            return Err(StoreError::FormatInvalid {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    fn header(&self) -> &StoreHeader {
        unsafe { &*(self.map.bytes().as_ptr() as *const StoreHeader) }
    }

    fn header_mut(&mut self) -> &mut StoreHeader {
        let bytes = match &mut self.map {
            MapInner::Rw(m) => m.as_mut_ptr(),
            MapInner::Ro(_) => unreachable!("header_mut on read-only store"),
        };
        unsafe { &mut *(bytes as *mut StoreHeader) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == AccessMode::ReadOnly
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn next_offset(&self) -> u64 {
        self.header().next_offset
    }

    /// Dotted API version stored in the file header.
    pub fn version(&self) -> String {
        unpad_string(&self.header().api_version)
    }

    /// Offset of the root object. Asserted non-null: reading a store that
    /// never registered a root is a programming error.
    pub fn root_offset(&self) -> u64 {
        let root = self.header().root_offset;
        assert!(root != NULL_OFFSET, "store has no root object");
        root
    }

    fn fetch_if_needed(&self, offset: u64, len: u64) {
        if let Some(fetcher) = &self.fetcher {
            fetcher.fetch(offset, len);
        }
    }

    /// Resolve a raw byte range inside the mapping.
    ///
    /// `offset` must lie below the allocation cursor; violating that is a
    /// programming error, checked in debug builds only.
    pub fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        debug_assert!(
            len == 0 || offset == NULL_OFFSET || offset < self.header().next_offset,
            "offset {} beyond allocation cursor {}",
            offset,
            self.header().next_offset
        );
        assert!(offset + len <= self.file_size);
        self.fetch_if_needed(offset, len);
        &self.map.bytes()[offset as usize..(offset + len) as usize]
    }

    pub fn bytes_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        debug_assert!(
            len == 0 || offset == NULL_OFFSET || offset < self.header().next_offset
        );
        assert!(offset + len <= self.file_size);
        self.fetch_if_needed(offset, len);
        match &mut self.map {
            MapInner::Rw(m) => &mut m[offset as usize..(offset + len) as usize],
            MapInner::Ro(_) => unreachable!("bytes_mut on read-only store"),
        }
    }

    /// Typed view of a single record at `offset`.
    pub fn view<T: Persistent>(&self, offset: u64) -> &T {
        let bytes = self.bytes(offset, size_of::<T>() as u64);
        debug_assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
        unsafe { &*(bytes.as_ptr() as *const T) }
    }

    pub fn view_mut<T: Persistent>(&mut self, offset: u64) -> &mut T {
        let bytes = self.bytes_mut(offset, size_of::<T>() as u64);
        debug_assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
        unsafe { &mut *(bytes.as_mut_ptr() as *mut T) }
    }

    /// Typed view of a contiguous record array.
    pub fn array<T: Persistent>(&self, offset: u64, count: u64) -> &[T] {
        let bytes = self.bytes(offset, count * size_of::<T>() as u64);
        debug_assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, count as usize) }
    }

    pub fn array_mut<T: Persistent>(&mut self, offset: u64, count: u64) -> &mut [T] {
        let bytes = self.bytes_mut(offset, count * size_of::<T>() as u64);
        debug_assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, count as usize) }
    }

    pub fn deref<T: Persistent>(&self, offset: Offset<T>) -> &T {
        self.view(offset.raw)
    }

    pub fn slice<T: Persistent>(&self, offset: Offset<T>, count: u64) -> &[T] {
        self.array(offset.raw, count)
    }

    /// Allocate `size` bytes and return the offset of the new block.
    ///
    /// The cursor advances by the word-aligned size so successor allocations
    /// stay aligned. With `is_root`, the offset is also recorded as the root
    /// object used to find everything else on reopen.
    pub fn alloc(&mut self, size: u64, is_root: bool) -> Result<u64, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnlyStore {
                path: self.path.clone(),
            });
        }
        let file_size = self.file_size;
        let header = self.header_mut();
        if header.next_offset + size > file_size {
            return Err(StoreError::CapacityExceeded {
                requested: size,
                file_size,
            });
        }
        let offset = header.next_offset;
        header.next_offset += align_round(size);
        if is_root {
            header.root_offset = offset;
        }
        Ok(offset)
    }

    fn flush(&self) -> Result<(), StoreError> {
        match &self.map {
            MapInner::Rw(m) => m.flush()?,
            MapInner::Ro(_) => {}
        }
        Ok(())
    }

    /// Mark the store clean and flush it. Write mode only.
    ///
    /// Callers must invoke this on success and only on success: on any error
    /// path the handle is dropped without close, leaving the dirty flag set
    /// so the next open rejects the file.
    pub fn close(mut self) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnlyStore {
                path: self.path.clone(),
            });
        }
        self.header_mut().dirty = 0;
        self.flush()?;
        debug!("closed store {} clean", self.path.display());
        Ok(())
    }

    /// Advise the OS to page the whole mapping in. No-op off unix.
    pub fn warm(&self) {
        #[cfg(unix)]
        {
            let advised = match &self.map {
                MapInner::Ro(m) => m.advise(memmap2::Advice::WillNeed),
                MapInner::Rw(m) => m.advise(memmap2::Advice::WillNeed),
            };
            if let Err(e) = advised {
                debug!("madvise failed on {}: {}", self.path.display(), e);
            }
        }
    }
}

fn padded_tag() -> [u8; TAG_BYTES] {
    pad_string(FORMAT_TAG)
}

fn pad_string<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    assert!(bytes.len() < N);
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

fn unpad_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    #[test]
    fn test_align_round() {
        let word = size_of::<usize>() as u64;
        assert_eq!(align_round(0), 0);
        assert_eq!(align_round(1), word);
        assert_eq!(align_round(word), word);
        assert_eq!(align_round(word + 1), 2 * word);
    }

    #[test]
    fn test_alloc_monotonic_aligned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        let mut store = MmapStore::create(&path, 1 << 16).unwrap();
        let word = size_of::<usize>() as u64;
        let mut prev = 0;
        for size in [1u64, 7, 8, 13, 64] {
            let off = store.alloc(size, false).unwrap();
            assert!(off > prev);
            assert_eq!(off % word, 0);
            assert!(off + align_round(size) <= store.file_size());
            prev = off;
        }
        store.close().unwrap();
    }

    #[test]
    fn test_capacity_exceeded_leaves_dirty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        let mut store = MmapStore::create(&path, 4096).unwrap();
        let mut allocated = Vec::new();
        loop {
            match store.alloc(512, false) {
                Ok(off) => allocated.push(off),
                Err(StoreError::CapacityExceeded { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(!allocated.is_empty());
        // Previous allocations remain intact after the failure.
        assert_eq!(store.next_offset(), *allocated.last().unwrap() + 512);
        // No close on the error path: the file stays dirty.
        drop(store);
        match MmapStore::open(&path, AccessMode::ReadOnly) {
            Err(StoreError::DirtyOnOpen { .. }) => {}
            other => panic!("expected DirtyOnOpen, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_roundtrip_root_and_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        let mut store = MmapStore::create(&path, 1 << 16).unwrap();
        let data_off = store.alloc(11, false).unwrap();
        store.bytes_mut(data_off, 11).copy_from_slice(b"hello world");
        let root_off = store.alloc(8, true).unwrap();
        *store.view_mut::<u64>(root_off) = 42;
        store.close().unwrap();

        let store = MmapStore::open(&path, AccessMode::ReadOnly).unwrap();
        assert_eq!(store.root_offset(), root_off);
        assert_eq!(store.bytes(data_off, 11), b"hello world");
        assert_eq!(*store.view::<u64>(root_off), 42);
    }

    #[test]
    fn test_dirty_on_unclosed_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        let store = MmapStore::create(&path, 4096).unwrap();
        // Simulate a crash: drop without close.
        drop(store);
        assert!(matches!(
            MmapStore::open(&path, AccessMode::ReadOnly),
            Err(StoreError::DirtyOnOpen { .. })
        ));
        assert!(matches!(
            MmapStore::open(&path, AccessMode::ReadWrite),
            Err(StoreError::DirtyOnOpen { .. })
        ));
    }

    #[test]
    fn test_reopen_write_marks_dirty_until_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        MmapStore::create(&path, 4096).unwrap().close().unwrap();

        let store = MmapStore::open(&path, AccessMode::ReadWrite).unwrap();
        drop(store);
        assert!(matches!(
            MmapStore::open(&path, AccessMode::ReadOnly),
            Err(StoreError::DirtyOnOpen { .. })
        ));
    }

    #[test]
    fn test_format_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        MmapStore::create(&path, 4096).unwrap().close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(MmapStore::is_mmap_file(&bytes));
        assert!(!MmapStore::is_mmap_file(b"##fileformat=VCFv4.2"));
        assert!(!MmapStore::is_mmap_file(b""));
    }

    #[test]
    fn test_not_a_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(matches!(
            MmapStore::open(&path, AccessMode::ReadOnly),
            Err(StoreError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn test_major_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        MmapStore::create(&path, 4096).unwrap().close().unwrap();
        // Patch the major version digit in place.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(TAG_BYTES as u64)).unwrap();
        file.write_all(b"9.0\0").unwrap();
        drop(file);
        assert!(matches!(
            MmapStore::open(&path, AccessMode::ReadOnly),
            Err(StoreError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_alloc_rejected_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        MmapStore::create(&path, 4096).unwrap().close().unwrap();
        let store = MmapStore::open(&path, AccessMode::ReadOnly).unwrap();
        // Read-only handles cannot allocate; exercised via the public API by
        // checking the mode flag, since alloc takes &mut self.
        assert!(store.is_read_only());
    }

    #[test]
    fn test_fetcher_invoked_on_resolution() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingFetcher(Arc<AtomicUsize>);
        impl PageFetcher for CountingFetcher {
            fn fetch(&self, _offset: u64, _len: u64) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.hal");
        let mut store = MmapStore::create(&path, 4096).unwrap();
        let off = store.alloc(16, false).unwrap();
        store.bytes_mut(off, 16).copy_from_slice(&[7u8; 16]);
        store.close().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let store = MmapStore::open_with_fetcher(
            &path,
            AccessMode::ReadOnly,
            Box::new(CountingFetcher(count.clone())),
        )
        .unwrap();
        let _ = store.bytes(off, 16);
        let _ = store.bytes(off, 8);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
