//! The heap: allocation, single-chunk reference counting, weak handles.

use indexmap::IndexMap;
use velac_util::{Ptr, PtrRegion, TypeId};

use crate::error::HeapError;
use crate::page::{ChunkHeader, Page};

/// Minimum free heap headroom kept below the allocation cap, in bytes.
pub const MEM_MIN_FREE_HEAP: i64 = 1024;

/// Minimum chunk size, in bytes.
pub const MEM_MIN_HEAP_CHUNK: usize = 64;

/// Minimum page size, in bytes.
pub const MEM_MIN_HEAP_PAGE: usize = 1024 * 1024;

/// Identifier of a host-registered on-free callback.
pub type OnFreeId = u32;

/// One surviving allocation, reported at VM teardown.
#[derive(Clone, Debug)]
pub struct LeakInfo {
    pub ptr: Ptr,
    pub size: i64,
    pub ip: usize,
    pub on_free: Option<OnFreeId>,
}

pub struct Heap {
    pages: IndexMap<u32, Page>,
    next_page_id: u32,
    /// Most recently allocated-into page, tried first.
    last_alloc: Option<u32>,
    total_size: i64,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            pages: IndexMap::new(),
            next_page_id: 1,
            last_alloc: None,
            total_size: 0,
        }
    }

    /// Allocates a chunk with reference count 1 and returns its handle.
    pub fn alloc(
        &mut self,
        size: i64,
        type_id: Option<TypeId>,
        on_free: Option<OnFreeId>,
        ip: usize,
    ) -> Result<Ptr, HeapError> {
        if size < 0 || size > i32::MAX as i64 - MEM_MIN_FREE_HEAP {
            return Err(HeapError::IllegalSize(size));
        }
        // One byte of slack keeps a NUL terminator representable for the
        // largest string that fits the chunk.
        let chunk_size = ((size as usize + 1 + 7) / 8 * 8).max(MEM_MIN_HEAP_CHUNK);

        let page_id = self.find_page_for_alloc(chunk_size)?;
        let page = self.pages.get_mut(&page_id).expect("page just found");
        let index = page.carve(ChunkHeader {
            ref_cnt: 1,
            size,
            type_id,
            on_free,
            ip,
            occupied: true,
        });
        self.last_alloc = Some(page_id);
        Ok(Ptr::heap(page_id, (index * page.chunk_size) as u32))
    }

    /// Finds a page with a free chunk of at least `chunk_size` bytes,
    /// preferring an exact size match, then the smallest that fits;
    /// otherwise adds a fresh page.
    fn find_page_for_alloc(&mut self, chunk_size: usize) -> Result<u32, HeapError> {
        if let Some(id) = self.last_alloc {
            if let Some(page) = self.pages.get(&id) {
                if page.chunk_size == chunk_size && page.has_free_chunk() {
                    return Ok(id);
                }
            }
        }
        let mut best: Option<(u32, usize)> = None;
        for (&id, page) in &self.pages {
            if !page.has_free_chunk() || page.chunk_size < chunk_size {
                continue;
            }
            if page.chunk_size == chunk_size {
                return Ok(id);
            }
            if best.map_or(true, |(_, size)| page.chunk_size < size) {
                best = Some((id, page.chunk_size));
            }
        }
        if let Some((id, _)) = best {
            return Ok(id);
        }
        self.add_page(chunk_size)
    }

    fn add_page(&mut self, chunk_size: usize) -> Result<u32, HeapError> {
        if self.next_page_id > Ptr::MAX_PAGE_ID {
            return Err(HeapError::OutOfMemory);
        }
        let num_chunks = (MEM_MIN_HEAP_PAGE / chunk_size).max(1);
        let id = self.next_page_id;
        self.next_page_id += 1;
        let page = Page::new(id, num_chunks, chunk_size);
        self.total_size += page.data.len() as i64;
        self.pages.insert(id, page);
        Ok(id)
    }

    pub fn page(&self, id: u32) -> Option<&Page> {
        self.pages.get(&id)
    }

    /// Resolves a heap handle to its page and chunk index, without
    /// liveness checks.
    fn locate(&self, ptr: Ptr) -> Option<(u32, usize)> {
        if ptr.region() != PtrRegion::Heap {
            return None;
        }
        let page = self.pages.get(&ptr.page_id())?;
        let offset = ptr.offset() as usize;
        if offset >= page.data.len() {
            return None;
        }
        Some((ptr.page_id(), page.chunk_index(offset)))
    }

    /// The chunk header behind a live heap handle.
    pub fn chunk(&self, ptr: Ptr) -> Option<&ChunkHeader> {
        let (page_id, index) = self.locate(ptr)?;
        self.pages.get(&page_id)?.chunk(index)
    }

    /// Whether the handle points into a live (allocated, referenced) chunk.
    pub fn is_live(&self, ptr: Ptr) -> bool {
        self.chunk(ptr).is_some_and(|c| c.occupied && c.ref_cnt > 0)
    }

    /// Read access to a chunk's bytes from the handle's offset to the end
    /// of the chunk.
    pub fn bytes(&self, ptr: Ptr) -> Result<&[u8], HeapError> {
        let (page_id, index) = self.locate(ptr).ok_or(HeapError::DanglingPointer(ptr))?;
        let page = &self.pages[&page_id];
        let chunk = page.chunk(index).ok_or(HeapError::DanglingPointer(ptr))?;
        if !chunk.occupied || chunk.ref_cnt <= 0 {
            return Err(HeapError::DanglingPointer(ptr));
        }
        let range = page.chunk_range(index);
        Ok(&page.data[ptr.offset() as usize..range.end])
    }

    /// Write access to a chunk's bytes from the handle's offset.
    pub fn bytes_mut(&mut self, ptr: Ptr) -> Result<&mut [u8], HeapError> {
        let (page_id, index) = self.locate(ptr).ok_or(HeapError::DanglingPointer(ptr))?;
        let page = self.pages.get_mut(&page_id).expect("page just located");
        let chunk = page.chunk(index).ok_or(HeapError::DanglingPointer(ptr))?;
        if !chunk.occupied || chunk.ref_cnt <= 0 {
            return Err(HeapError::DanglingPointer(ptr));
        }
        let range = page.chunk_range(index);
        let offset = ptr.offset() as usize;
        Ok(&mut page.data[offset..range.end])
    }

    /// Applies a reference-count delta to the chunk behind `ptr` and to its
    /// page, removing the page when its count reaches zero. Returns the
    /// chunk's new count. Handles outside the heap are ignored (count 0).
    pub fn change_ref_cnt(&mut self, ptr: Ptr, delta: i64) -> Result<i64, HeapError> {
        let Some((page_id, index)) = self.locate(ptr) else {
            return Ok(0);
        };
        let page = self.pages.get_mut(&page_id).expect("page just located");
        let Some(chunk) = page.chunk_mut(index) else {
            return Err(HeapError::DanglingPointer(ptr));
        };
        if chunk.ref_cnt <= 0 || !chunk.occupied {
            return Err(HeapError::WrongRefCount(ptr));
        }
        chunk.ref_cnt += delta;
        if chunk.ref_cnt < 0 {
            return Err(HeapError::WrongRefCount(ptr));
        }
        let new_cnt = chunk.ref_cnt;
        if new_cnt == 0 {
            chunk.occupied = false;
        }
        page.ref_cnt += delta;
        if page.ref_cnt == 0 {
            let page = self.pages.shift_remove(&page_id).expect("page exists");
            self.total_size -= page.data.len() as i64;
            if self.last_alloc == Some(page_id) {
                self.last_alloc = None;
            }
        }
        Ok(new_cnt)
    }

    /// Current reference count of a chunk (0 for non-heap handles).
    pub fn ref_cnt(&self, ptr: Ptr) -> i64 {
        self.chunk(ptr).map_or(0, |c| c.ref_cnt)
    }

    /// Handle of the start of the chunk an interior handle points into.
    pub fn chunk_start(&self, ptr: Ptr) -> Option<Ptr> {
        let (page_id, index) = self.locate(ptr)?;
        let page = &self.pages[&page_id];
        Some(Ptr::heap(page_id, (index * page.chunk_size) as u32))
    }

    /// Detaches and returns the chunk's on-free callback, if any. The VM
    /// fires it at the moment the chunk transitions to zero references.
    pub fn take_on_free(&mut self, ptr: Ptr) -> Option<OnFreeId> {
        let (page_id, index) = self.locate(ptr)?;
        let page = self.pages.get_mut(&page_id)?;
        let taken = page.chunk_mut(index)?.on_free.take();
        if taken.is_some() {
            page.num_with_on_free -= 1;
        }
        taken
    }

    /// Resolves a weak handle: the same handle if the referent still has
    /// strong references, null otherwise (page gone or chunk dead).
    pub fn strengthen(&self, weak: Ptr) -> Ptr {
        if weak.region() != PtrRegion::Heap {
            return weak;
        }
        if self.is_live(weak) {
            weak
        } else {
            Ptr::NULL
        }
    }

    /// Total bytes currently held in pages.
    pub fn mem_usage(&self) -> i64 {
        self.total_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Surviving chunks with a positive reference count, in page order.
    pub fn leaks(&self) -> Vec<LeakInfo> {
        let mut result = Vec::new();
        for (&page_id, page) in &self.pages {
            for (index, chunk) in page.chunks.iter().enumerate() {
                if chunk.occupied && chunk.ref_cnt > 0 {
                    result.push(LeakInfo {
                        ptr: Ptr::heap(page_id, (index * page.chunk_size) as u32),
                        size: chunk.size,
                        ip: chunk.ip,
                        on_free: chunk.on_free,
                    });
                }
            }
        }
        result
    }

    /// Verifies the per-page invariant: a page's count equals the sum of
    /// its chunks' counts.
    pub fn check_page_ref_counts(&self) -> bool {
        self.pages
            .values()
            .all(|page| page.ref_cnt == page.chunks.iter().map(|c| c.ref_cnt).sum::<i64>())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_read_write() {
        let mut heap = Heap::new();
        let ptr = heap.alloc(16, None, None, 7).unwrap();
        heap.bytes_mut(ptr).unwrap()[..8].copy_from_slice(&42i64.to_le_bytes());
        let bytes = heap.bytes(ptr).unwrap();
        assert_eq!(i64::from_le_bytes(bytes[..8].try_into().unwrap()), 42);
        assert_eq!(heap.chunk(ptr).unwrap().ip, 7);
    }

    #[test]
    fn test_chunks_share_a_page() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        let b = heap.alloc(8, None, None, 0).unwrap();
        assert_eq!(a.page_id(), b.page_id());
        assert_ne!(a.offset(), b.offset());
        assert_eq!(heap.page_count(), 1);
    }

    #[test]
    fn test_size_classes_get_own_pages() {
        let mut heap = Heap::new();
        let small = heap.alloc(8, None, None, 0).unwrap();
        let large = heap.alloc(100_000, None, None, 0).unwrap();
        assert_ne!(small.page_id(), large.page_id());
    }

    #[test]
    fn test_ref_cnt_and_page_release() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        let b = heap.alloc(8, None, None, 0).unwrap();

        assert!(heap.check_page_ref_counts());
        assert_eq!(heap.change_ref_cnt(a, 1).unwrap(), 2);
        assert_eq!(heap.change_ref_cnt(a, -1).unwrap(), 1);
        assert!(heap.check_page_ref_counts());

        assert_eq!(heap.change_ref_cnt(a, -1).unwrap(), 0);
        assert!(heap.page(a.page_id()).is_some(), "page still holds b");

        assert_eq!(heap.change_ref_cnt(b, -1).unwrap(), 0);
        assert!(heap.page(b.page_id()).is_none(), "empty page is unlinked");
        assert_eq!(heap.mem_usage(), 0);
    }

    #[test]
    fn test_dangling_pointer_detected() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        let _keep = heap.alloc(8, None, None, 0).unwrap();
        heap.change_ref_cnt(a, -1).unwrap();

        assert_eq!(heap.bytes(a).unwrap_err(), HeapError::DanglingPointer(a));
        assert_eq!(heap.change_ref_cnt(a, -1).unwrap_err(), HeapError::WrongRefCount(a));
    }

    #[test]
    fn test_weak_strengthen() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        let _keep = heap.alloc(8, None, None, 0).unwrap();

        // Valid while a strong reference exists
        assert_eq!(heap.strengthen(a), a);

        heap.change_ref_cnt(a, -1).unwrap();
        assert_eq!(heap.strengthen(a), Ptr::NULL);
    }

    #[test]
    fn test_weak_null_after_page_gone() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        heap.change_ref_cnt(a, -1).unwrap();
        assert!(heap.page(a.page_id()).is_none());
        assert_eq!(heap.strengthen(a), Ptr::NULL);
    }

    #[test]
    fn test_page_ids_never_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, None, 0).unwrap();
        let first_id = a.page_id();
        heap.change_ref_cnt(a, -1).unwrap();
        let b = heap.alloc(8, None, None, 0).unwrap();
        assert!(b.page_id() > first_id);
    }

    #[test]
    fn test_on_free_taken_once() {
        let mut heap = Heap::new();
        let a = heap.alloc(8, None, Some(3), 0).unwrap();
        assert_eq!(heap.take_on_free(a), Some(3));
        assert_eq!(heap.take_on_free(a), None);
    }

    #[test]
    fn test_leak_report() {
        let mut heap = Heap::new();
        let a = heap.alloc(24, None, None, 11).unwrap();
        let b = heap.alloc(8, None, None, 22).unwrap();
        heap.change_ref_cnt(b, -1).unwrap();

        let leaks = heap.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].ptr, a);
        assert_eq!(leaks[0].size, 24);
        assert_eq!(leaks[0].ip, 11);
    }

    #[test]
    fn test_interior_pointer_resolves_to_chunk() {
        let mut heap = Heap::new();
        let a = heap.alloc(32, None, None, 0).unwrap();
        let interior = a.add(16);
        assert!(heap.is_live(interior));
        assert_eq!(heap.change_ref_cnt(interior, 1).unwrap(), 2);
        assert_eq!(heap.ref_cnt(a), 2);
    }

    #[test]
    fn test_illegal_size() {
        let mut heap = Heap::new();
        assert!(matches!(heap.alloc(-1, None, None, 0), Err(HeapError::IllegalSize(-1))));
    }
}
