//! Page buffer (§4.2): a single-page RAM scratch that batches byte
//! writes to one flash page at a time, hiding program-alignment
//! constraints from the higher layers.

use crate::log;
use crate::nvm::{Nvm, NvmBackend};
use crate::error::XipfsError;

/// Upper bound on a backend's page size. Real NVM pages run from a few
/// hundred bytes to a handful of kilobytes; this bound lets
/// [`PageBuffer`] live on the stack (or inside [`crate::driver::Mount`])
/// instead of requiring `alloc`.
pub const MAX_PAGE_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Loaded,
}

/// The single process-wide (per §5: "shared under the operations
/// mutex") page buffer. Owned by [`crate::driver::Mount`] rather than
/// as module-level state (§9).
pub struct PageBuffer {
    data: [u8; MAX_PAGE_SIZE],
    state: State,
    page_number: usize,
    page_address: usize,
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBuffer {
    /// An empty buffer, loading nothing until first use.
    pub const fn new() -> Self {
        Self {
            data: [0; MAX_PAGE_SIZE],
            state: State::Empty,
            page_number: 0,
            page_address: 0,
        }
    }

    /// Flush, then forget the current page, without touching flash
    /// beyond the flush itself. Used by callers (e.g. the allocator's
    /// `remove`) that must guarantee the buffer holds nothing stale
    /// before they start moving pages around directly.
    pub fn flush<B: NvmBackend>(&mut self, nvm: &mut Nvm<B>) -> Result<(), XipfsError> {
        if self.state == State::Empty {
            return Ok(());
        }
        let size = nvm.page_size();
        assert!(size <= MAX_PAGE_SIZE, "page size exceeds MAX_PAGE_SIZE");

        let mut disk = [0u8; MAX_PAGE_SIZE];
        nvm.read(self.page_address, &mut disk[..size])?;
        if disk[..size] == self.data[..size] {
            log::trace!("buffer: flush no-op, ram matches flash");
            self.state = State::Empty;
            return Ok(());
        }

        log::debug!("buffer: flushing dirty page");
        let page = self.page_number;
        let addr = self.page_address;
        let result = nvm
            .erase_page(page)
            .and_then(|()| nvm.write_unaligned(addr, &self.data[..size]));
        // Whatever happens, the buffer no longer holds anything
        // meaningful: on success the page now matches RAM; on failure
        // the page is left erased (or partially programmed) and the
        // RAM copy must not be trusted to still describe it.
        self.state = State::Empty;
        result
    }

    fn ensure_loaded<B: NvmBackend>(
        &mut self,
        nvm: &mut Nvm<B>,
        addr: usize,
    ) -> Result<(), XipfsError> {
        let page = nvm.page(addr);
        if self.state == State::Loaded && page == self.page_number {
            return Ok(());
        }
        self.flush(nvm)?;
        let size = nvm.page_size();
        assert!(size <= MAX_PAGE_SIZE, "page size exceeds MAX_PAGE_SIZE");
        let page_addr = nvm.addr(page);
        nvm.read(page_addr, &mut self.data[..size])?;
        self.page_number = page;
        self.page_address = page_addr;
        self.state = State::Loaded;
        Ok(())
    }

    /// Byte-granular buffered read.
    pub fn read_byte<B: NvmBackend>(
        &mut self,
        nvm: &mut Nvm<B>,
        addr: usize,
    ) -> Result<u8, XipfsError> {
        self.ensure_loaded(nvm, addr)?;
        Ok(self.data[addr - self.page_address])
    }

    /// Byte-granular buffered write. Does not touch flash until a
    /// later transition to a different page, or an explicit
    /// [`PageBuffer::flush`].
    pub fn write_byte<B: NvmBackend>(
        &mut self,
        nvm: &mut Nvm<B>,
        addr: usize,
        byte: u8,
    ) -> Result<(), XipfsError> {
        self.ensure_loaded(nvm, addr)?;
        self.data[addr - self.page_address] = byte;
        Ok(())
    }

    /// Buffered read of a byte run, crossing pages if necessary.
    pub fn read_bytes<B: NvmBackend>(
        &mut self,
        nvm: &mut Nvm<B>,
        addr: usize,
        out: &mut [u8],
    ) -> Result<(), XipfsError> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_byte(nvm, addr + i)?;
        }
        Ok(())
    }

    /// Buffered write of a byte run, crossing pages if necessary.
    pub fn write_bytes<B: NvmBackend>(
        &mut self,
        nvm: &mut Nvm<B>,
        addr: usize,
        data: &[u8],
    ) -> Result<(), XipfsError> {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(nvm, addr + i, byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNvm;

    #[test]
    fn flush_is_noop_when_unchanged() {
        let mut nvm = Nvm::new(MockNvm::new(16, 2, 0));
        let mut buf = PageBuffer::new();
        buf.read_byte(&mut nvm, 0).unwrap();
        assert_eq!(nvm.backend().erase_count(), 0);
        buf.flush(&mut nvm).unwrap();
        assert_eq!(nvm.backend().erase_count(), 0);
    }

    #[test]
    fn write_then_read_roundtrip_across_flush() {
        let mut nvm = Nvm::new(MockNvm::new(16, 2, 0));
        let mut buf = PageBuffer::new();
        buf.write_bytes(&mut nvm, 0, b"hello").unwrap();
        buf.flush(&mut nvm).unwrap();

        let mut out = [0u8; 5];
        buf.read_bytes(&mut nvm, 0, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn crossing_pages_flushes_the_first() {
        let mut nvm = Nvm::new(MockNvm::new(16, 2, 0));
        let mut buf = PageBuffer::new();
        buf.write_byte(&mut nvm, 0, 0xAB).unwrap();
        buf.write_byte(&mut nvm, 16, 0xCD).unwrap(); // second page
        let mut out = [0u8; 1];
        buf.read_bytes(&mut nvm, 0, &mut out).unwrap();
        assert_eq!(out[0], 0xAB, "first page must have been flushed to flash");
    }
}
