//! A `CacheBackend` over a real file, standing in for the file-shared
//! source kind (§4.G) instead of the synthetic pattern backend
//! `scenarios.rs` uses for S1/S2. Exercises read-through on first touch and
//! write-back on `flush`, round-tripping through an actual file on disk
//! rather than only through the in-memory frame table.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use kcore::arch;
use kcore::config::PAGE_SIZE;
use kcore::error::Result;
use kcore::mm::page;
use kcore::mm::page_cache::{CacheBackend, PageCache};

use kcore_tests::support;

struct FileBackend {
    file: Mutex<File>,
}

impl CacheBackend for FileBackend {
    fn has_read(&self) -> bool {
        true
    }
    fn has_write(&self) -> bool {
        true
    }

    fn read_page(&self, offset: u64, phys: kcore::arch::PhysAddr) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        let virt = arch::arch().direct_map_offset() + phys;
        let buf = unsafe { core::slice::from_raw_parts_mut(virt as *mut u8, PAGE_SIZE) };
        file.seek(SeekFrom::Start(offset)).unwrap();
        let n = file.read(buf).unwrap();
        for b in &mut buf[n..] {
            *b = 0;
        }
        Ok(())
    }

    fn write_page(&self, offset: u64, phys: kcore::arch::PhysAddr) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        let virt = arch::arch().direct_map_offset() + phys;
        let buf = unsafe { core::slice::from_raw_parts(virt as *const u8, PAGE_SIZE) };
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(buf).unwrap();
        Ok(())
    }
}

#[test]
fn flush_writes_modified_pages_through_to_the_backing_file() {
    let _guard = support::serialize();
    support::install();

    let mut tmp = tempfile::tempfile().unwrap();
    let initial = vec![0xABu8; PAGE_SIZE];
    tmp.write_all(&initial).unwrap();
    tmp.flush().unwrap();

    page::range_add(0, 64 * PAGE_SIZE).ok();

    let backend = std::sync::Arc::new(FileBackend { file: Mutex::new(tmp) });
    let cache = PageCache::new(PAGE_SIZE as u64, Some(backend.clone()));

    let mut buf = vec![0u8; PAGE_SIZE];
    let n = cache.io(0, kcore::mm::page_cache::IoOp::Read, &mut buf).unwrap();
    assert_eq!(n, PAGE_SIZE);
    assert!(buf.iter().all(|&b| b == 0xAB), "read-through should surface the file's existing contents");

    let updated = vec![0xCDu8; PAGE_SIZE];
    let n = cache.io(0, kcore::mm::page_cache::IoOp::Write, &updated).unwrap();
    assert_eq!(n, PAGE_SIZE);

    cache.flush().unwrap();

    let mut file = backend.file.lock().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut on_disk = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut on_disk).unwrap();
    assert!(on_disk.iter().all(|&b| b == 0xCD), "flush should have written the modified page back to the file");
}
