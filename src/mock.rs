//! A RAM-backed [`crate::nvm::NvmBackend`] for host-side tests (§E of
//! `SPEC_FULL.md`). Not part of the firmware surface — only compiled
//! under `cfg(test)` or the `std` feature, the same role the teacher's
//! `testsuite` crate plays for hardware, just runnable on the host.

extern crate std;

use std::vec;
use std::vec::Vec;

use crate::nvm::NvmBackend;

/// Simulated NOR flash: erases to `0xFF`, programs can only clear
/// bits, and optionally injects a single verify failure to exercise
/// error paths.
pub struct MockNvm {
    page_size: usize,
    page_count: usize,
    base_addr: usize,
    data: Vec<u8>,
    erase_count: usize,
    fail_verify_next: bool,
}

impl MockNvm {
    /// Build a fresh (fully erased) mock flash.
    pub fn new(page_size: usize, page_count: usize, base_addr: usize) -> Self {
        Self {
            page_size,
            page_count,
            base_addr,
            data: vec![0xFFu8; page_size * page_count],
            erase_count: 0,
            fail_verify_next: false,
        }
    }

    /// Number of real (non-no-op) erases performed so far.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Corrupt the result of the next `write_block` call so the
    /// caller's read-back verify fails. Used to test the `Medium`
    /// error path.
    pub fn fail_verify_next(&mut self) {
        self.fail_verify_next = true;
    }

    fn rel(&self, addr: usize) -> usize {
        addr - self.base_addr
    }
}

impl NvmBackend for MockNvm {
    type Error = ();

    fn erase_byte(&self) -> u8 {
        0xFF
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn block_align(&self) -> usize {
        4
    }

    fn block_size(&self) -> usize {
        4
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn base_addr(&self) -> usize {
        self.base_addr
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        let off = self.rel(addr);
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
        Ok(())
    }

    fn erase_page(&mut self, page: usize) -> Result<(), Self::Error> {
        let start = page * self.page_size;
        let end = start + self.page_size;
        self.data[start..end].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), Self::Error> {
        let off = self.rel(addr);
        for (i, &b) in data.iter().enumerate() {
            self.data[off + i] &= b;
        }
        if self.fail_verify_next {
            self.fail_verify_next = false;
            // Flip a bit that the real write did not intend to set,
            // simulating a failed program cell so read-back verify
            // in `Nvm` catches it.
            self.data[off] ^= 0x01;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_resets_to_erase_byte() {
        let mut nvm = MockNvm::new(16, 2, 0);
        nvm.write_block(4, &[0, 0, 0, 0]).unwrap();
        nvm.erase_page(0).unwrap();
        let mut buf = [0u8; 16];
        nvm.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFFu8; 16]);
    }

    #[test]
    fn write_only_clears_bits() {
        let mut nvm = MockNvm::new(16, 1, 0);
        nvm.write_block(0, &[0b1010_1010, 0xFF, 0xFF, 0xFF])
            .unwrap();
        nvm.write_block(0, &[0b1100_1100, 0xFF, 0xFF, 0xFF])
            .unwrap();
        let mut buf = [0u8; 4];
        nvm.read(0, &mut buf).unwrap();
        // AND of the two patterns.
        assert_eq!(buf[0], 0b1000_1000);
    }
}
