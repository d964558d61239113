use memmap::MmapMut;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};

/// A memory-mapped block of 32-bit peripheral registers.
///
/// This is the only place in the crate which touches mapped device memory. Registers are
/// addressed by word index and every access is bounds-checked against the mapping.
/// Accesses are volatile, so reads observe the hardware and writes are never elided.
///
/// The block is shared between the request loop and the interrupt service thread.
/// Single-word accesses are atomic at the hardware level; read-modify-write sequences
/// (`update`) are not, and callers must make sure only one thread modifies a given word.
#[derive(Debug)]
pub struct RegisterBlock {
    file_handle: Option<File>,
    map: MmapMut,
}

impl RegisterBlock {
    pub(crate) fn new(file_handle: Option<File>, map: MmapMut) -> Self {
        Self { file_handle, map }
    }

    /// Creates a block backed by zeroed anonymous memory instead of a device.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        Ok(Self::new(None, MmapMut::map_anon(len)?))
    }

    /// Whether the block is plain memory rather than a device mapping.
    pub fn is_anonymous(&self) -> bool {
        self.file_handle.is_none()
    }

    /// Number of 32-bit registers in the block.
    pub fn words(&self) -> usize {
        self.map.len() / size_of::<u32>()
    }

    pub fn read(&self, index: usize) -> u32 {
        // SAFETY: word_ptr checks the index against the mapping, which stays alive as long as self.
        unsafe { ptr::read_volatile(self.word_ptr(index).as_ptr()) }
    }

    pub fn write(&self, index: usize, value: u32) {
        // SAFETY: See `read`.
        unsafe { ptr::write_volatile(self.word_ptr(index).as_ptr(), value) }
    }

    pub fn update<F: FnOnce(u32) -> u32>(&self, index: usize, f: F) {
        let value = self.read(index);
        self.write(index, f(value));
    }

    pub fn set_bits(&self, index: usize, mask: u32) {
        self.update(index, |value| value | mask);
    }

    pub fn clear_bits(&self, index: usize, mask: u32) {
        self.update(index, |value| value & !mask);
    }

    /// Acknowledges the bits in `mask` of a write-one-to-clear register.
    ///
    /// Hardware clears the bits written as one and leaves the rest alone. Anonymous memory has
    /// no such logic, so the same effect is applied by hand.
    pub fn write_one_to_clear(&self, index: usize, mask: u32) {
        if self.is_anonymous() {
            self.clear_bits(index, mask);
        } else {
            self.write(index, mask);
        }
    }

    fn word_ptr(&self, index: usize) -> NonNull<u32> {
        assert!(
            index < self.words(),
            "register index {} outside of a {}-word block",
            index,
            self.words()
        );

        let base_addr = self.map.as_ptr() as *mut u32;
        // SAFETY: The mapping is page aligned and the index was checked above.
        unsafe { NonNull::new_unchecked(base_addr.add(index)) }
    }
}
