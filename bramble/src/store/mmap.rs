//! A file-backed shared mapping of the cell array.

use crate::error::Result;
use std::fs::File;
use std::os::fd::AsRawFd as _;

/// A `MAP_SHARED` read/write mapping over an open file.
///
/// Writes go through the raw pointer, never through a `&mut` reference, so a
/// reader holding a slice of committed cells and the single writer appending
/// past them never alias the same bytes.
pub struct Mmap {
    ptr: *mut u8,
    size: usize,
}

impl Mmap {
    /// Map `size` bytes of `file` read/write. The file must be at least
    /// `size` bytes long.
    pub fn map_file(file: &File, size: usize) -> Result<Self> {
        assert!(size > 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        } as *mut u8;
        if ptr == libc::MAP_FAILED as *mut u8 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Mmap { ptr, size })
    }

    /// The mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `len` bytes at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Write `bytes` at `offset`.
    ///
    /// Only the single writer may call this, and only on bytes no reader
    /// will touch until they are published.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    /// Flush the byte range `offset..offset + len` to the backing file.
    pub fn sync(&self, offset: usize, len: usize) -> Result<()> {
        assert!(offset + len <= self.size);
        // msync wants a page-aligned address.
        let page = page_size();
        let start = offset / page * page;
        let len = len + (offset - start);
        let ret = unsafe {
            libc::msync(
                self.ptr.add(start) as *mut libc::c_void,
                len,
                libc::MS_SYNC,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is plain shared memory; the read/write discipline above is
// what keeps concurrent access sound.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_sync() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        let map = Mmap::map_file(&file, 8192).unwrap();

        map.write(4000, b"hello");
        let mut out = [0u8; 5];
        map.read(4000, &mut out);
        assert_eq!(&out, b"hello");
        map.sync(4000, 5).unwrap();

        // visible through the file after sync.
        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(4000)).unwrap();
        let mut back = [0u8; 5];
        file.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"hello");
    }
}
