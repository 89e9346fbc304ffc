//! Hardware-in-loop test harness crate.
//!
//! `tests/flash.rs` and `tests/mpu.rs` are `defmt-test` suites that
//! exercise `xipfs` against a real NVM part and a real Cortex-M MPU,
//! which the host-side `cfg(test)` suites in the main crate cannot do.
//! This crate's only code of its own is [`InternalFlash`], the
//! `NvmBackend` implementation both suites mount `xipfs` over.
#![no_std]

use stm32f3xx_hal::pac::FLASH;

const FLASH_KEYR_KEY_1: u32 = 0x45670123;
const FLASH_KEYR_KEY_2: u32 = 0xCDEF89AB;

const PAGE_SIZE: usize = 0x800; // 2 KiB, per RM0316 (STM32F303xC)
const BLOCK_SIZE: usize = 2; // flash programs one half-word at a time
const ERASE_BYTE: u8 = 0xFF;

// Reserve the last 16 KiB of a 256 KiB part for xipfs; everything
// below this address is the firmware's own code and must never be
// touched by erase/program calls issued through this backend.
const MOUNT_BASE: usize = 0x0800_0000 + 256 * 1024 - 16 * 1024;
const MOUNT_PAGES: usize = 16 * 1024 / PAGE_SIZE;

/// `NvmBackend` over the MCU's own internal flash, reserving its last
/// `MOUNT_PAGES` pages for the mount under test. Unlock sequence, page
/// erase, and half-word programming follow the same register steps
/// (`KEYR` unlock, `PER`/`AR`/`STRT`, `PG` + volatile half-word store)
/// used by the rest of this crate's flash access.
pub struct InternalFlash {
    flash: FLASH,
}

impl InternalFlash {
    /// Take ownership of the `FLASH` peripheral. Caller must ensure no
    /// other code erases or programs flash for the lifetime of this
    /// value.
    pub fn new(flash: FLASH) -> Self {
        Self { flash }
    }

    fn unlock(&mut self) {
        if self.flash.cr.read().lock().bit_is_set() {
            self.flash.keyr.write(|w| w.fkeyr().bits(FLASH_KEYR_KEY_1));
            self.flash.keyr.write(|w| w.fkeyr().bits(FLASH_KEYR_KEY_2));
        }
    }

    fn wait_busy(&self) {
        while self.flash.sr.read().bsy().bit_is_set() {
            cortex_m::asm::nop();
        }
    }
}

impl xipfs::nvm::NvmBackend for InternalFlash {
    type Error = ();

    fn erase_byte(&self) -> u8 {
        ERASE_BYTE
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn block_align(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn page_count(&self) -> usize {
        MOUNT_PAGES
    }

    fn base_addr(&self) -> usize {
        MOUNT_BASE
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { core::ptr::read_volatile((addr + i) as *const u8) };
        }
        Ok(())
    }

    fn erase_page(&mut self, page: usize) -> Result<(), Self::Error> {
        let addr = self.base_addr() + page * self.page_size();
        self.wait_busy();
        self.unlock();

        self.flash.cr.modify(|_, w| w.per().set_bit());
        self.flash.ar.write(|w| unsafe { w.bits(addr as u32) });
        self.flash.cr.modify(|_, w| w.strt().set_bit());
        self.wait_busy();

        let ok = self.flash.sr.read().eop().bit_is_set();
        self.flash.sr.modify(|_, w| w.eop().clear_bit());
        self.flash.cr.modify(|_, w| w.per().clear_bit());
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }

    fn write_block(&mut self, addr: usize, data: &[u8]) -> Result<(), Self::Error> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.wait_busy();
        self.unlock();

        self.flash.cr.modify(|_, w| w.pg().set_bit());
        let halfword = u16::from_le_bytes([data[0], data[1]]);
        unsafe {
            core::ptr::write_volatile(addr as *mut u16, halfword);
        }
        self.wait_busy();

        let ok = self.flash.sr.read().eop().bit_is_set();
        self.flash.sr.modify(|_, w| w.eop().clear_bit());
        self.flash.cr.modify(|_, w| w.pg().clear_bit());
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }
}
