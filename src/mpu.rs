//! MPU sandboxing (§4.9, `safe-exec` feature): three ARMv7-M MPU
//! regions — the binary's own code, a writable data window over the
//! same record, and a caller-supplied stack — configured for the
//! duration of one [`crate::exec::Argv`]-driven call and torn down
//! when it returns.
//!
//! Register layout (`MPU_RASR`) follows the ARMv7-M Architecture
//! Reference Manual: bit 0 enables the region, bits `[5:1]` encode
//! `log2(size) - 1`, bits `[26:24]` are the access permission, and bit
//! 28 is execute-never (XN).

use cortex_m::peripheral::MPU;

use crate::error::XipfsError;

const REGION_TEXT: u8 = 4;
const REGION_DATA: u8 = 5;
const REGION_STACK: u8 = 6;

const RASR_ENABLE: u32 = 1;
const RASR_XN: u32 = 1 << 28;
const RBAR_VALID: u32 = 1 << 4;

#[derive(Clone, Copy)]
#[repr(u32)]
enum AccessPermission {
    ReadOnly = 0b110,
    ReadWrite = 0b011,
}

fn size_field(bytes: u32) -> Result<u32, XipfsError> {
    if bytes < 32 || !bytes.is_power_of_two() {
        return Err(XipfsError::TextRegion);
    }
    let log2 = 31 - bytes.leading_zeros();
    Ok(log2 - 1)
}

fn rasr(size: u32, ap: AccessPermission, execute_never: bool) -> u32 {
    let mut v = RASR_ENABLE | (size << 1) | ((ap as u32) << 24);
    if execute_never {
        v |= RASR_XN;
    }
    v
}

fn rbar(region: u8, addr: u32) -> u32 {
    debug_assert_eq!(addr & 0x1f, 0, "MPU region base must be 32-byte aligned");
    (addr & !0x1f) | RBAR_VALID | (region as u32 & 0xf)
}

/// The three regions a sandboxed call needs, already validated.
pub struct Regions {
    text: (u32, u32),
    data: (u32, u32),
    stack: (u32, u32),
}

impl Regions {
    /// Build the region set for running the executable reserved at
    /// `[record_addr, record_addr + reserved)`, with `[ram_addr,
    /// ram_addr + ram_len)` as its free-RAM window (§4.8's execution
    /// context `ram_start..ram_end`) and `[stack_addr, stack_addr +
    /// stack_len)` as its stack. `data` is deliberately a distinct
    /// region from `text`: the ARMv7-M MPU resolves an overlap by
    /// region number, so aliasing `data` onto the same range as `text`
    /// would have its `ReadWrite`+`XN` attributes win over `text`'s
    /// `ReadOnly` there, making the binary's own code execute-never
    /// under its own sandbox.
    pub fn for_execution(
        record_addr: u32,
        reserved: u32,
        ram_addr: u32,
        ram_len: u32,
        stack_addr: u32,
        stack_len: u32,
    ) -> Result<Self, XipfsError> {
        size_field(reserved).map_err(|_| XipfsError::TextRegion)?;
        if ram_addr & 0x1f != 0 {
            return Err(XipfsError::DataRegion);
        }
        size_field(ram_len).map_err(|_| XipfsError::DataRegion)?;
        if stack_addr & 0x1f != 0 {
            return Err(XipfsError::StackRegion);
        }
        size_field(stack_len).map_err(|_| XipfsError::StackRegion)?;
        Ok(Self {
            text: (record_addr, reserved),
            data: (ram_addr, ram_len),
            stack: (stack_addr, stack_len),
        })
    }
}

/// Holds the MPU enabled for as long as it lives; restores the MPU to
/// disabled on drop, the same "unwind always restores hardware state"
/// pattern the teacher's `FlashExt` uses for its unlock/lock pair.
pub struct Guard {
    mpu: MPU,
}

impl Drop for Guard {
    fn drop(&mut self) {
        unsafe {
            self.mpu.ctrl.write(0);
        }
    }
}

/// Program the three regions and enable the MPU. The returned
/// [`Guard`] disables it again when dropped.
pub fn enable(regions: Regions) -> Result<Guard, XipfsError> {
    let mut mpu = unsafe { cortex_m::Peripherals::steal().MPU };

    program_region(
        &mut mpu,
        REGION_TEXT,
        regions.text.0,
        regions.text.1,
        AccessPermission::ReadOnly,
        false,
    )
    .map_err(|_| XipfsError::TextRegion)?;
    program_region(
        &mut mpu,
        REGION_DATA,
        regions.data.0,
        regions.data.1,
        AccessPermission::ReadWrite,
        true,
    )
    .map_err(|_| XipfsError::DataRegion)?;
    program_region(
        &mut mpu,
        REGION_STACK,
        regions.stack.0,
        regions.stack.1,
        AccessPermission::ReadWrite,
        true,
    )
    .map_err(|_| XipfsError::StackRegion)?;

    unsafe {
        // PRIVDEFENA (bit 2) keeps the default background map for
        // privileged code outside the three regions above; ENABLE
        // (bit 0) turns the MPU on.
        mpu.ctrl.write(0b101);
    }

    Ok(Guard { mpu })
}

fn program_region(
    mpu: &mut MPU,
    region: u8,
    addr: u32,
    size: u32,
    ap: AccessPermission,
    execute_never: bool,
) -> Result<(), XipfsError> {
    let field = size_field(size)?;
    unsafe {
        mpu.rnr.write(region as u32);
        mpu.rbar.write(rbar(region, addr));
        mpu.rasr.write(rasr(field, ap, execute_never));
    }
    Ok(())
}
