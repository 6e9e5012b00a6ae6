//! The sandboxed memory arena of a module instance.
//!
//! Module addresses are plain `i32` offsets into a single byte arena whose
//! size is a power of two. Module code never touches the arena directly:
//! every access first goes through [`SandboxAddr`], which masks the address
//! into the arena and aligns it down to the access width, so no address a
//! module can compute reaches outside of it.
//!
//! All multi-byte values are little-endian regardless of the host.

use crate::error::MemoryAccessError;
use crate::module::Module;
use crate::verify::PROGRAM_STACK_SIZE;

/// An in-bounds, aligned offset into a [`Memory`].
///
/// Invariant: `offset + width <= memory.size()` for the width the address was
/// created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxAddr(u32);

impl SandboxAddr {
    /// Mask `addr` into an arena with the given `mask` (`size - 1`) for an
    /// access of `width` bytes, a power of two no larger than the arena.
    #[inline]
    pub fn new(addr: i32, mask: u32, width: u32) -> SandboxAddr {
        debug_assert!(width.is_power_of_two() && width <= mask.wrapping_add(1));
        SandboxAddr(addr as u32 & mask & !(width - 1))
    }

    /// The offset into the arena.
    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// Size of the arena an instance of `module` gets.
pub(crate) fn arena_size(module: &Module) -> u32 {
    (module.static_data_length() + PROGRAM_STACK_SIZE as u32).next_power_of_two()
}

/// The memory of one module instance: static data followed by bss and the
/// program stack, rounded up to a power of two.
#[derive(Debug, Clone)]
pub struct Memory {
    bytes: Box<[u8]>,
    mask: u32,
}

impl Memory {
    /// Allocate and initialize the memory for an instance of `module`.
    pub fn new(module: &Module) -> Memory {
        let size = arena_size(module);
        let mut memory = Memory::zeroed(size);
        memory.bytes[..module.data().len()].copy_from_slice(module.data());
        log::debug!(
            "{}: allocated {size:#x} bytes of memory",
            module.name()
        );
        memory
    }

    /// A zero-filled arena of `size` bytes, which must be a power of two.
    pub fn zeroed(size: u32) -> Memory {
        assert!(size.is_power_of_two(), "memory size must be a power of two");
        Memory {
            bytes: vec![0; size as usize].into_boxed_slice(),
            mask: size - 1,
        }
    }

    /// Size of the arena in bytes.
    pub fn size(&self) -> u32 {
        self.mask + 1
    }

    /// The mask applied to every module address.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// The whole arena.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// The whole arena, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[inline]
    fn addr(&self, addr: i32, width: u32) -> usize {
        SandboxAddr::new(addr, self.mask, width).get()
    }

    #[inline]
    pub(crate) fn load1(&self, addr: i32) -> i32 {
        i32::from(self.bytes[self.addr(addr, 1)])
    }

    #[inline]
    pub(crate) fn load2(&self, addr: i32) -> i32 {
        let a = self.addr(addr, 2);
        i32::from(u16::from_le_bytes([self.bytes[a], self.bytes[a + 1]]))
    }

    #[inline]
    pub(crate) fn load4(&self, addr: i32) -> i32 {
        let a = self.addr(addr, 4);
        let mut word = [0; 4];
        word.copy_from_slice(&self.bytes[a..a + 4]);
        i32::from_le_bytes(word)
    }

    #[inline]
    pub(crate) fn store1(&mut self, addr: i32, value: i32) {
        let a = self.addr(addr, 1);
        self.bytes[a] = value as u8;
    }

    #[inline]
    pub(crate) fn store2(&mut self, addr: i32, value: i32) {
        let a = self.addr(addr, 2);
        self.bytes[a..a + 2].copy_from_slice(&(value as u16).to_le_bytes());
    }

    #[inline]
    pub(crate) fn store4(&mut self, addr: i32, value: i32) {
        let a = self.addr(addr, 4);
        self.bytes[a..a + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Copy `len` bytes from `src` to `dest`, both masked into the arena.
    ///
    /// A copy running off the end of the arena wraps around to its start. At
    /// most one arena's worth of bytes is copied.
    pub(crate) fn block_copy(&mut self, dest: i32, src: i32, len: i32) {
        let dest = self.addr(dest, 1);
        let src = self.addr(src, 1);
        let len = (len as u32).min(self.size()) as usize;
        let size = self.bytes.len();
        if dest + len <= size && src + len <= size {
            self.bytes.copy_within(src..src + len, dest);
        } else {
            for i in 0..len {
                self.bytes[(dest + i) & self.mask as usize] =
                    self.bytes[(src + i) & self.mask as usize];
            }
        }
    }

    #[cfg(feature = "cranelift")]
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

/// How host code reaches into module memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostAccess {
    /// The start address is masked into the arena before the range check, as
    /// module code would see it.
    Masked,
    /// The address is used as is and only range checked.
    Checked,
}

/// A host view of module memory, handed to syscall handlers.
///
/// Addresses come from module code and are untrusted: every access is range
/// checked against the arena and fails with a [`MemoryAccessError`] instead of
/// panicking.
pub struct MemoryView<'a> {
    memory: &'a mut Memory,
    access: HostAccess,
}

impl<'a> MemoryView<'a> {
    pub(crate) fn new(memory: &'a mut Memory, access: HostAccess) -> MemoryView<'a> {
        MemoryView { memory, access }
    }

    fn range(&self, addr: i32, len: usize) -> Result<core::ops::Range<usize>, MemoryAccessError> {
        let start = match self.access {
            HostAccess::Masked => addr as u32 & self.memory.mask,
            HostAccess::Checked => addr as u32,
        } as usize;
        let error = MemoryAccessError {
            addr: addr as u32,
            len: u32::try_from(len).unwrap_or(u32::MAX),
        };
        match start.checked_add(len) {
            Some(end) if end <= self.memory.bytes.len() => Ok(start..end),
            _ => Err(error),
        }
    }

    /// Size of the arena in bytes.
    pub fn size(&self) -> u32 {
        self.memory.size()
    }

    /// `len` bytes of module memory starting at `addr`.
    pub fn slice(&self, addr: i32, len: usize) -> Result<&[u8], MemoryAccessError> {
        let range = self.range(addr, len)?;
        Ok(&self.memory.bytes[range])
    }

    /// `len` bytes of module memory starting at `addr`, mutably.
    pub fn slice_mut(&mut self, addr: i32, len: usize) -> Result<&mut [u8], MemoryAccessError> {
        let range = self.range(addr, len)?;
        Ok(&mut self.memory.bytes[range])
    }

    /// Copy module memory at `addr` into `buffer`.
    pub fn read(&self, addr: i32, buffer: &mut [u8]) -> Result<(), MemoryAccessError> {
        buffer.copy_from_slice(self.slice(addr, buffer.len())?);
        Ok(())
    }

    /// Copy `buffer` into module memory at `addr`.
    pub fn write(&mut self, addr: i32, buffer: &[u8]) -> Result<(), MemoryAccessError> {
        self.slice_mut(addr, buffer.len())?.copy_from_slice(buffer);
        Ok(())
    }

    /// Read the little-endian word at `addr`.
    pub fn read_i32(&self, addr: i32) -> Result<i32, MemoryAccessError> {
        let mut word = [0; 4];
        self.read(addr, &mut word)?;
        Ok(i32::from_le_bytes(word))
    }

    /// Write a little-endian word at `addr`.
    pub fn write_i32(&mut self, addr: i32, value: i32) -> Result<(), MemoryAccessError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// The NUL-terminated string at `addr`, without its terminator.
    ///
    /// A string running to the end of the arena without a terminator is an
    /// access error.
    pub fn c_str(&self, addr: i32) -> Result<&[u8], MemoryAccessError> {
        let start = self.range(addr, 0)?.start;
        let rest = &self.memory.bytes[start..];
        let len = rest.iter().position(|&b| b == 0).ok_or(MemoryAccessError {
            addr: addr as u32,
            len: rest.len() as u32,
        })?;
        Ok(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_addr_stays_in_bounds() {
        let size = 0x100u32;
        let mask = size - 1;
        let addresses = [
            0,
            1,
            3,
            0xff,
            0x100,
            0x1fe,
            -1,
            -4,
            i32::MIN,
            i32::MAX,
            0x1234_5678,
        ];
        for addr in addresses {
            for width in [1, 2, 4] {
                let a = SandboxAddr::new(addr, mask, width);
                assert!(a.get() as u32 + width <= size, "{addr:#x} width {width}");
                assert_eq!(a.get() as u32 % width, 0);
            }
        }
        assert_eq!(SandboxAddr::new(0x103, mask, 4).get(), 0);
        assert_eq!(SandboxAddr::new(0x1ff, mask, 2).get(), 0xfe);
    }

    #[test]
    fn loads_and_stores() {
        let mut m = Memory::zeroed(64);
        m.store4(8, 0x0403_0201);
        assert_eq!(&m.data()[8..12], &[1, 2, 3, 4]);
        assert_eq!(m.load4(8), 0x0403_0201);
        assert_eq!(m.load2(10), 0x0403);
        assert_eq!(m.load1(11), 4);

        m.store1(64 + 5, -1);
        assert_eq!(m.load1(5), 0xff);
        m.store2(7, 0x1_8001);
        assert_eq!(m.load2(6), 0x8001);
        // Masked and aligned: 66 -> 2, 67 -> 2 (aligned to 4 -> 0).
        m.store4(67, -1);
        assert_eq!(m.load4(0), -1);
    }

    #[test]
    fn block_copy() {
        let mut m = Memory::zeroed(16);
        m.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        m.block_copy(8, 0, 4);
        assert_eq!(&m.data()[8..12], &[1, 2, 3, 4]);

        // Wraps around the end of the arena.
        m.block_copy(14, 0, 4);
        assert_eq!(&m.data()[14..], &[1, 2]);
        assert_eq!(&m.data()[..2], &[3, 4]);

        // Absurd lengths are bounded by the arena size.
        m.block_copy(0, 0, -1);
    }

    #[test]
    fn host_views() {
        let mut m = Memory::zeroed(32);
        m.data_mut()[4..10].copy_from_slice(b"hello\0");

        let view = MemoryView::new(&mut m, HostAccess::Checked);
        assert_eq!(view.c_str(4).unwrap(), b"hello");
        assert!(view.slice(30, 4).is_err());
        assert!(view.slice(36, 1).is_err());
        assert_eq!(
            view.slice(-1, 1).unwrap_err(),
            MemoryAccessError { addr: u32::MAX, len: 1 }
        );

        let mut view = MemoryView::new(&mut m, HostAccess::Masked);
        assert_eq!(view.slice(32 + 4, 5).unwrap(), b"hello");
        assert!(view.slice(30, 4).is_err());
        view.write_i32(16, 7).unwrap();
        assert_eq!(view.read_i32(48).unwrap(), 7);

        let mut m = Memory::zeroed(8);
        m.data_mut().fill(b'x');
        let view = MemoryView::new(&mut m, HostAccess::Masked);
        assert!(view.c_str(2).is_err());
    }
}
