//! Flash primitives (§4.1).
//!
//! This module is the "host-provided primitives" boundary of §6: the
//! crate never talks to a flash controller directly. Instead the host
//! implements [`NvmBackend`] (modeled on the `embedded-storage`
//! `ReadNorFlash`/`NorFlash` traits the pack's storage crates build on,
//! adapted to the page-oriented, program-block-granular API this
//! specification names: `nvm_addr`, `nvm_page`, `nvm_erase`,
//! `nvm_write`) and [`Nvm`] wraps it with the address/page bookkeeping
//! and the unaligned read-modify-write-verify program sequence.
//!
//! Key constants (erase-state byte, page size, program-block alignment
//! and size, page count, base address) are obtained from the backend
//! at run time rather than baked in as associated constants, since a
//! single build of this crate may mount xipfs over more than one NVM
//! region with different geometry (e.g. internal flash vs. an external
//! QSPI part).

use crate::error::{ErrnoLatch, XipfsError};
use crate::log;

/// Upper bound on a backend's program-block size. Real NOR/NVM parts
/// program in units of 1-32 bytes (word, double-word, or a small ECC
/// line); this bound lets [`Nvm`] keep a stack buffer instead of
/// requiring `alloc`.
pub const MAX_BLOCK_SIZE: usize = 32;

/// The host-provided NVM surface: page addressing, erase, and
/// block-aligned programming with an associated error type.
///
/// Implementors are expected to be thin wrappers around a real flash
/// controller (c.f. the teacher's `FlashExt for FLASH`), or, under the
/// `std` feature, the in-memory [`crate::mock::MockNvm`] used by the
/// host-side test suite.
pub trait NvmBackend {
    /// Backend-specific error type (bus fault, timeout, ...).
    type Error: core::fmt::Debug;

    /// The byte value flash reads back as after an erase.
    fn erase_byte(&self) -> u8;

    /// Size, in bytes, of one erasable page. Must not exceed the
    /// capacity of whatever buffer a caller pairs with this backend
    /// (see [`crate::buffer::MAX_PAGE_SIZE`]).
    fn page_size(&self) -> usize;

    /// Required alignment, in bytes, of a program-block address.
    fn block_align(&self) -> usize;

    /// Size, in bytes, of one program block. Must be `<= MAX_BLOCK_SIZE`.
    fn block_size(&self) -> usize;

    /// Number of pages covered by this backend.
    fn page_count(&self) -> usize;

    /// Flash address of page 0.
    fn base_addr(&self) -> usize;

    /// Byte-granular read. `addr` need not be aligned.
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Erase the given page. Implementations may assume the caller
    /// already checked whether the page is erased; [`Nvm::erase_page`]
    /// performs that check so this method is always a "real" erase.
    fn erase_page(&mut self, page: usize) -> Result<(), Self::Error>;

    /// Program one aligned, block-sized chunk. `addr` must be a
    /// multiple of `block_align()` and `data.len() == block_size()`.
    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), Self::Error>;
}

/// Flash primitives layered over a [`NvmBackend`] (§4.1).
pub struct Nvm<B> {
    backend: B,
}

impl<B: NvmBackend> Nvm<B> {
    /// Wrap a backend. Panics if the backend reports a program-block
    /// size larger than [`MAX_BLOCK_SIZE`] (a programmer error: pick a
    /// different backend or raise the bound), the same way
    /// `FlashLayout::new` panics on a nonsensical const layout.
    pub fn new(backend: B) -> Self {
        assert!(
            backend.block_size() <= MAX_BLOCK_SIZE,
            "NvmBackend::block_size() exceeds MAX_BLOCK_SIZE"
        );
        assert!(backend.block_size() > 0, "block_size() must be nonzero");
        assert!(backend.page_size() > 0, "page_size() must be nonzero");
        Self { backend }
    }

    /// Borrow the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutably borrow the underlying backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Flash address of page 0.
    pub fn base_addr(&self) -> usize {
        self.backend.base_addr()
    }

    /// Flash address immediately past the last byte this backend
    /// covers.
    pub fn end_addr(&self) -> usize {
        self.backend.base_addr() + self.backend.page_count() * self.backend.page_size()
    }

    /// Number of pages covered by this backend.
    pub fn page_count(&self) -> usize {
        self.backend.page_count()
    }

    /// Size, in bytes, of one page.
    pub fn page_size(&self) -> usize {
        self.backend.page_size()
    }

    /// The byte value flash reads back as after an erase.
    pub fn erase_byte(&self) -> u8 {
        self.backend.erase_byte()
    }

    /// Translate a page number into its starting address.
    ///
    /// The given page must be valid; out-of-range pages still compute
    /// an address (no panic) so callers that have already validated
    /// the page number via [`Nvm::page_count`] pay no extra cost, but
    /// the result is meaningless outside flash.
    pub fn addr(&self, page: usize) -> usize {
        self.backend.base_addr() + page * self.backend.page_size()
    }

    /// Translate an address inside a page into that page's number.
    ///
    /// `addr` must be inside the flash window ([`Nvm::in_flash`]).
    pub fn page(&self, addr: usize) -> usize {
        (addr - self.backend.base_addr()) / self.backend.page_size()
    }

    /// Is `addr` inside this backend's flash window?
    pub fn in_flash(&self, addr: usize) -> bool {
        addr >= self.backend.base_addr() && addr < self.end_addr()
    }

    /// Is `addr` aligned to a page boundary?
    pub fn page_aligned(&self, addr: usize) -> bool {
        addr.checked_sub(self.backend.base_addr())
            .map(|off| off % self.backend.page_size() == 0)
            .unwrap_or(false)
    }

    /// Does the `size`-byte span starting at `addr` overflow the
    /// flash window (including address-space wraparound)?
    pub fn overflow(&self, addr: usize, size: usize) -> bool {
        match addr.checked_add(size) {
            None => true,
            Some(end) => addr < self.backend.base_addr() || end > self.end_addr(),
        }
    }

    /// Does the `size`-byte span starting at `addr` cross a page
    /// boundary?
    pub fn page_overflow(&self, addr: usize, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        match addr.checked_add(size - 1) {
            None => true,
            Some(last) => self.page(addr) != self.page(last),
        }
    }

    /// Is the given page fully erased (every byte equal to the
    /// backend's erase byte)?
    pub fn is_erased_page(&mut self, page: usize) -> Result<bool, XipfsError> {
        let addr = self.addr(page);
        let page_size = self.backend.page_size();
        let erase_byte = self.backend.erase_byte();
        let mut buf = [0u8; MAX_BLOCK_SIZE];
        let mut off = 0;
        while off < page_size {
            let n = core::cmp::min(MAX_BLOCK_SIZE, page_size - off);
            self.backend
                .read(addr + off, &mut buf[..n])
                .map_err(|_| XipfsError::FlashProgram)?;
            if buf[..n].iter().any(|&b| b != erase_byte) {
                return Ok(false);
            }
            off += n;
        }
        Ok(true)
    }

    /// Erase a page. A no-op (no hardware erase issued) if the page
    /// already reads as fully erased.
    pub fn erase_page(&mut self, page: usize) -> Result<(), XipfsError> {
        if self.is_erased_page(page)? {
            log::trace!("nvm: page already erased, skipping");
            return Ok(());
        }
        log::debug!("nvm: erasing page");
        self.backend
            .erase_page(page)
            .map_err(|_| XipfsError::FlashProgram)?;
        if !self.is_erased_page(page)? {
            log::error!("nvm: erase verify failed");
            return Err(XipfsError::VerifyMismatch);
        }
        Ok(())
    }

    /// Byte-granular read, via the backend directly (no buffering).
    pub fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), XipfsError> {
        self.backend
            .read(addr, buf)
            .map_err(|_| XipfsError::FlashProgram)
    }

    /// Program one aligned block directly, with read-back verify.
    pub fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), XipfsError> {
        debug_assert_eq!(data.len(), self.backend.block_size());
        self.backend
            .write_block(addr, data)
            .map_err(|_| XipfsError::FlashProgram)?;
        let mut check = [0u8; MAX_BLOCK_SIZE];
        self.backend
            .read(addr, &mut check[..data.len()])
            .map_err(|_| XipfsError::FlashProgram)?;
        if &check[..data.len()] != data {
            log::error!("nvm: write_block verify mismatch");
            return Err(XipfsError::VerifyMismatch);
        }
        Ok(())
    }

    /// Unaligned byte programming (§4.1): for each target byte, read
    /// the enclosing aligned block, splice in the new byte, program
    /// the block, and read back and verify the whole block.
    ///
    /// This is also the "bulk program" primitive: a multi-byte `data`
    /// slice is handled by repeating the single-byte sequence, so
    /// adjacent calls naturally coalesce within a shared block.
    pub fn write_unaligned(&mut self, dest: usize, data: &[u8]) -> Result<(), XipfsError> {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(dest + i, byte)?;
        }
        Ok(())
    }

    fn write_byte(&mut self, addr: usize, byte: u8) -> Result<(), XipfsError> {
        let block = self.backend.block_size();
        let align = self.backend.block_align();
        let rel = addr
            .checked_sub(self.backend.base_addr())
            .ok_or(XipfsError::OutsideNvm)?;
        let block_addr = self.backend.base_addr() + (rel - rel % align);
        let offset = addr - block_addr;

        let mut word = [0u8; MAX_BLOCK_SIZE];
        self.backend
            .read(block_addr, &mut word[..block])
            .map_err(|_| XipfsError::FlashProgram)?;
        word[offset] = byte;
        self.backend
            .write_block(block_addr, &word[..block])
            .map_err(|_| XipfsError::FlashProgram)?;

        let mut check = [0u8; MAX_BLOCK_SIZE];
        self.backend
            .read(block_addr, &mut check[..block])
            .map_err(|_| XipfsError::FlashProgram)?;
        if check[offset] != byte {
            log::error!("nvm: write_unaligned verify mismatch");
            return Err(XipfsError::VerifyMismatch);
        }
        Ok(())
    }
}

/// Report the most recent error from an `Nvm` call into a shared
/// [`ErrnoLatch`], returning it so call sites can `?`-propagate.
pub(crate) fn latch(latch: &ErrnoLatch, err: XipfsError) -> XipfsError {
    latch.set(err)
}
