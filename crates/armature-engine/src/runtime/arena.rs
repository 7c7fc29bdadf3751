//! Executable code arena
//!
//! One mmap'd region per JIT instance holds the dispatcher stubs and every
//! translated block. Code is appended; bytes are reclaimed only by
//! resetting to the post-stub watermark on a full cache clear. On W^X hosts
//! the mapping toggles between RW and RX around write batches through the
//! `enable_writing`/`disable_writing` pair; on permissive hosts those are
//! no-ops over an RWX mapping.

use crate::JitError;

pub struct CodeArena {
    base: *mut u8,
    size: usize,
    pos: usize,
    w_xor_x: bool,
    writable: bool,
}

// Safety: the arena is owned by a single Core; raw pointers are only
// dereferenced through &mut self or by emitted code while the owning thread
// runs it.
unsafe impl Send for CodeArena {}

impl CodeArena {
    #[cfg(unix)]
    pub fn new(size: usize, w_xor_x: bool) -> Result<CodeArena, JitError> {
        let prot = if w_xor_x {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        };
        // Safety: fresh anonymous mapping, never shared
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(JitError::CodeArena(std::io::Error::last_os_error()));
        }
        Ok(CodeArena {
            base: base as *mut u8,
            size,
            pos: 0,
            w_xor_x,
            writable: true,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_size: usize, _w_xor_x: bool) -> Result<CodeArena, JitError> {
        Err(JitError::UnsupportedHost(
            "executable memory requires a unix host".into(),
        ))
    }

    pub fn base_address(&self) -> u64 {
        self.base as u64
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.size - self.pos
    }

    /// Append `code`, returning its absolute address.
    pub fn append(&mut self, code: &[u8]) -> Result<u64, JitError> {
        assert!(self.writable, "arena is not writable");
        if code.len() > self.remaining() {
            return Err(JitError::CodeArenaFull);
        }
        let addr = self.base_address() + self.pos as u64;
        // Safety: bounds checked above; region is mapped and writable
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.base.add(self.pos), code.len());
        }
        self.pos += code.len();
        Ok(addr)
    }

    /// Overwrite bytes at an absolute address inside the arena.
    pub fn write_at(&mut self, addr: u64, bytes: &[u8]) {
        assert!(self.writable, "arena is not writable");
        let off = (addr - self.base_address()) as usize;
        assert!(off + bytes.len() <= self.pos, "patch outside emitted code");
        // Safety: bounds checked against the emitted region
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), bytes.len());
        }
    }

    /// Roll back to a previous position (cache clear).
    pub fn reset_to(&mut self, watermark: usize) {
        assert!(watermark <= self.pos);
        self.pos = watermark;
    }

    /// Make the region writable (no-op unless W^X).
    pub fn enable_writing(&mut self) {
        if self.w_xor_x && !self.writable {
            self.protect(false);
        }
        self.writable = true;
    }

    /// Make the region executable (no-op unless W^X).
    pub fn disable_writing(&mut self) {
        if self.w_xor_x && self.writable {
            self.protect(true);
        }
        self.writable = !self.w_xor_x;
    }

    #[cfg(unix)]
    fn protect(&mut self, executable: bool) {
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // Safety: protecting our own mapping
        let rc = unsafe { libc::mprotect(self.base as *mut _, self.size, prot) };
        assert_eq!(rc, 0, "mprotect failed on the code arena");
    }

    #[cfg(not(unix))]
    fn protect(&mut self, _executable: bool) {}
}

#[cfg(unix)]
impl Drop for CodeArena {
    fn drop(&mut self) {
        // Safety: unmapping the mapping created in new()
        unsafe {
            libc::munmap(self.base as *mut _, self.size);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_addresses() {
        let mut arena = CodeArena::new(4096, false).unwrap();
        let a = arena.append(&[0xc3]).unwrap();
        let b = arena.append(&[0x90, 0xc3]).unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(arena.position(), 3);
    }

    #[test]
    fn test_write_at_patches() {
        let mut arena = CodeArena::new(4096, false).unwrap();
        let a = arena.append(&[0x90, 0x90, 0x90, 0x90]).unwrap();
        arena.write_at(a + 1, &[0xcc, 0xcc]);
        // Safety: reading back our own mapping
        let bytes = unsafe { std::slice::from_raw_parts(a as *const u8, 4) };
        assert_eq!(bytes, &[0x90, 0xcc, 0xcc, 0x90]);
    }

    #[test]
    fn test_reset_to_watermark() {
        let mut arena = CodeArena::new(4096, false).unwrap();
        arena.append(&[0xc3; 16]).unwrap();
        let mark = arena.position();
        arena.append(&[0x90; 100]).unwrap();
        arena.reset_to(mark);
        assert_eq!(arena.position(), 16);
    }

    #[test]
    fn test_full_arena() {
        let mut arena = CodeArena::new(4096, false).unwrap();
        assert!(arena.append(&[0u8; 4096]).is_ok());
        assert!(matches!(
            arena.append(&[0u8; 1]),
            Err(JitError::CodeArenaFull)
        ));
    }

    #[test]
    fn test_wxe_toggle() {
        let mut arena = CodeArena::new(4096, true).unwrap();
        arena.append(&[0xc3]).unwrap();
        arena.disable_writing();
        arena.enable_writing();
        arena.append(&[0xc3]).unwrap();
        assert_eq!(arena.position(), 2);
    }
}
