//! Execution core (§4.8): branching directly into an XIP binary's
//! flash image, and the bounded argument vector and syscall numbering
//! it is called with.
//!
//! An executable file has no loader step: its payload *is* machine
//! code, already resident at its final address, so "running" it is
//! just a function call through a pointer computed from the record's
//! address. [`Mount::execv`] does this unguarded; [`Mount::safe_execv`]
//! (the `safe-exec` feature) wraps the same call with an MPU sandbox
//! from [`crate::mpu`].

use crate::config::ARGC_MAX;
use crate::driver::Mount;
use crate::error::{DriverError, XipfsError};
use crate::nvm::NvmBackend;
use crate::record::{FileRecord, HEADER_SIZE};

/// Syscall numbers an XIP binary requests via `svc #n`. Numbering and
/// names mirror the fixed dispatch table the host firmware exposes to
/// sandboxed code (§6): string/number formatting, board peripherals,
/// and the two file-system shortcuts (`copy_file`, `get_file_size`)
/// that let a binary avoid hand-rolling `open`/`read` for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Syscall {
    Printf = 0,
    GetTemp = 1,
    IsPrint = 2,
    Strtol = 3,
    GetLed = 4,
    SetLed = 5,
    CopyFile = 6,
    GetFileSize = 7,
    Memset = 8,
}

impl Syscall {
    /// One past the highest valid syscall number.
    pub const MAX: u8 = 9;

    /// Decode a raw `svc` immediate into a syscall, if it names one.
    pub fn from_u8(n: u8) -> Option<Self> {
        Some(match n {
            0 => Self::Printf,
            1 => Self::GetTemp,
            2 => Self::IsPrint,
            3 => Self::Strtol,
            4 => Self::GetLed,
            5 => Self::SetLed,
            6 => Self::CopyFile,
            7 => Self::GetFileSize,
            8 => Self::Memset,
            _ => return None,
        })
    }
}

/// A bounded argument vector: each entry is a null-terminated byte
/// string, C-calling-convention style, since an XIP binary's entry
/// point is `extern "C"`. Bounded by `ARGC_MAX` so building one never
/// needs `alloc`.
pub struct Argv<'a> {
    slots: [Option<&'a [u8]>; ARGC_MAX],
    argc: usize,
}

impl<'a> Default for Argv<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Argv<'a> {
    /// An empty argument vector.
    pub fn new() -> Self {
        Self { slots: [None; ARGC_MAX], argc: 0 }
    }

    /// Append one argument. `arg` must end in a `0` byte.
    pub fn push(&mut self, arg: &'a [u8]) -> Result<(), DriverError> {
        if self.argc >= ARGC_MAX {
            return Err(DriverError::Invalid);
        }
        if arg.last() != Some(&0) {
            return Err(DriverError::Invalid);
        }
        self.slots[self.argc] = Some(arg);
        self.argc += 1;
        Ok(())
    }

    /// Number of arguments pushed so far.
    pub fn len(&self) -> usize {
        self.argc
    }

    pub fn is_empty(&self) -> bool {
        self.argc == 0
    }

    fn as_slice(&self) -> &[Option<&'a [u8]>] {
        &self.slots[..self.argc]
    }
}

/// An XIP binary's entry point signature: `int main(int argc, char
/// **argv)`, the same shape the original firmware branches into.
type EntryPoint = unsafe extern "C" fn(argc: i32, argv: *const *const u8) -> i32;

/// Branch into a validated entry point and run it to completion.
///
/// # Safety
/// `entry` must be a valid `extern "C" fn(i32, *const *const u8) ->
/// i32` located at a flash address that passed [`FileRecord::validate`]
/// with `exec == 1`; `argv`/`argc` must describe `argc` valid,
/// null-terminated byte strings.
unsafe fn invoke_xip(entry: EntryPoint, argc: i32, argv: *const *const u8) -> i32 {
    unsafe { entry(argc, argv) }
}

impl<B: NvmBackend> Mount<B> {
    /// Run the executable at `path` directly, with no memory
    /// isolation: equivalent to the original's unguarded `execv`.
    pub fn execv(&mut self, path: &str, args: &Argv) -> Result<i32, DriverError> {
        let record = self.resolve_executable(path)?;
        self.run_entry(record, args)
    }

    /// Run the executable at `path` inside an MPU sandbox restricted
    /// to its own code, a caller-provided free-RAM window, and a
    /// caller-provided stack (§4.9). Shares [`Mount::execv`]'s
    /// path/executable-bit preflight (§F).
    #[cfg(feature = "safe-exec")]
    pub fn safe_execv(
        &mut self,
        path: &str,
        args: &Argv,
        ram: &mut [u8],
        stack: &mut [u8],
    ) -> Result<i32, DriverError> {
        let record = self.resolve_executable(path)?;
        let reserved = record
            .reserved(self.nvm_mut(), self.buf_mut())
            .map_err(|e| self.fail(e))?;
        let regions = crate::mpu::Regions::for_execution(
            record.addr(),
            reserved,
            ram.as_ptr() as u32,
            ram.len() as u32,
            stack.as_ptr() as u32,
            stack.len() as u32,
        )
        .map_err(|e| self.fail(e))?;

        let guard = crate::mpu::enable(regions).map_err(|e| self.fail(e))?;
        let result = self.run_entry(record, args);
        drop(guard);
        result
    }

    fn run_entry(&mut self, record: FileRecord, args: &Argv) -> Result<i32, DriverError> {
        self.lock_execution()?;

        let flush_result = self.buf_mut().flush(self.nvm_mut());
        if let Err(e) = flush_result {
            self.unlock_execution();
            return Err(self.fail(e));
        }
        if record.addr() < self.mount_base()
            || record.addr() >= self.mount_end()
            || !self.nvm_mut().page_aligned(record.addr() as usize)
        {
            self.unlock_execution();
            return Err(self.fail(XipfsError::OutsideNvm));
        }

        let entry_addr = record.addr() as usize + HEADER_SIZE;
        let entry: EntryPoint = unsafe { core::mem::transmute(entry_addr) };

        let mut ptrs: [*const u8; ARGC_MAX + 1] = [core::ptr::null(); ARGC_MAX + 1];
        for (i, slot) in args.as_slice().iter().enumerate() {
            ptrs[i] = slot.expect("Argv never stores holes below argc").as_ptr();
        }

        let result = unsafe { invoke_xip(entry, args.len() as i32, ptrs.as_ptr()) };
        self.unlock_execution();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_rejects_missing_terminator() {
        let mut argv = Argv::new();
        assert_eq!(argv.push(b"not-terminated"), Err(DriverError::Invalid));
    }

    #[test]
    fn argv_accepts_terminated_strings_up_to_argc_max() {
        let mut argv = Argv::new();
        for _ in 0..ARGC_MAX {
            argv.push(b"a\0").unwrap();
        }
        assert_eq!(argv.len(), ARGC_MAX);
        assert_eq!(argv.push(b"x\0"), Err(DriverError::Invalid));
    }

    #[test]
    fn syscall_round_trips_through_u8() {
        for n in 0..Syscall::MAX {
            assert!(Syscall::from_u8(n).is_some());
        }
        assert!(Syscall::from_u8(Syscall::MAX).is_none());
    }

    fn mount() -> Mount<crate::mock::MockNvm> {
        Mount::mount(crate::mock::MockNvm::new(512, 8, 0), 0, 512 * 8).unwrap()
    }

    #[test]
    fn execv_on_missing_path_is_not_found() {
        let mut m = mount();
        assert_eq!(m.execv("/nope", &Argv::new()), Err(DriverError::NotFound));
    }

    #[test]
    fn execv_on_non_executable_file_is_access() {
        let mut m = mount();
        m.new_file("/data.bin", 8, false).unwrap();
        assert_eq!(m.execv("/data.bin", &Argv::new()), Err(DriverError::Access));
    }

    #[test]
    fn execv_on_a_malformed_exec_witness_is_invalid() {
        // Construct a record with `exec` outside {0, 1} directly
        // through the allocator: the driver surface has no way to ask
        // for this, only a corrupted or foreign-written record would.
        let mut m = mount();
        crate::alloc::new_file(
            m.nvm_mut(),
            m.buf_mut(),
            m.mount_base(),
            m.mount_end(),
            &{
                let mut p = [0u8; crate::config::PATH_MAX];
                p[..b"/weird".len()].copy_from_slice(b"/weird");
                p
            },
            8,
            2,
        )
        .unwrap();
        assert_eq!(m.execv("/weird", &Argv::new()), Err(DriverError::Invalid));
    }
}
