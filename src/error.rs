//! Error taxonomy (§7).
//!
//! Two layers, matching the teacher's `Result<(), FlashError>` style in
//! `flash.rs`: a low-level [`XipfsError`] describing exactly what went
//! wrong inside the core, and a POSIX-like [`DriverError`] that every
//! driver-surface entry point (`open`, `read`, `rename`, ...) returns to
//! its caller. [`XipfsError`] maps onto [`DriverError`] via `From`.

use core::cell::Cell;

/// Low-level error taxonomy. One variant group per §7 category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XipfsError {
    // --- Path errors ---
    /// Path pointer/slice was null or empty.
    NullPath,
    /// Path contains a character outside `[A-Za-z0-9._-/]`.
    InvalidChar,
    /// Path is not null-terminated within `PATH_MAX`.
    NotTerminated,
    /// Path, including the trailing null, exceeds `PATH_MAX`.
    NameTooLong,

    // --- Layout errors ---
    /// Record address was null.
    NullRecord,
    /// Record address is not page-aligned.
    Misaligned,
    /// Record address lies outside the mount's NVM window.
    OutsideNvm,
    /// `next` does not point at `self + reserved`, nor at `self`, nor
    /// carry the erased-state pattern.
    BrokenLink,
    /// Requested offset exceeds the record's maximum addressable
    /// position.
    OffsetPastReserved,

    // --- Medium errors ---
    /// A flash program or erase operation failed at the hardware
    /// level.
    FlashProgram,
    /// A post-write read-back did not match the value that was
    /// written.
    VerifyMismatch,

    // --- State errors ---
    /// Mount magic does not match [`crate::config::MAGIC`].
    BadMagic,
    /// Mount's page count or base address is out of range.
    BadPageNumber,
    /// The file system has no remaining free pages.
    Full,
    /// A `new_file` was attempted at a path that already exists.
    DuplicateCreate,
    /// An operation was attempted against a descriptor opened with
    /// incompatible access flags.
    WrongPermission,
    /// Not enough free pages to satisfy a `new_file` request.
    OutOfSpace,

    // --- MPU errors (safe-exec only) ---
    /// Failed to configure the text (code) MPU region.
    TextRegion,
    /// Failed to configure the data MPU region.
    DataRegion,
    /// Failed to configure the stack MPU region.
    StackRegion,
    /// Failed to enable the MPU.
    EnableMpu,
    /// Failed to disable the MPU.
    DisableMpu,
}

/// POSIX-like error codes returned by the driver surface (§6/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    NotFound,
    Exists,
    IsDir,
    NotDir,
    NotEmpty,
    NameTooLong,
    Access,
    BadDesc,
    Fault,
    Invalid,
    NoSpace,
    Quota,
    Busy,
    Io,
}

impl From<XipfsError> for DriverError {
    fn from(e: XipfsError) -> Self {
        use XipfsError::*;
        match e {
            NullPath | NullRecord => DriverError::Fault,
            InvalidChar | NotTerminated => DriverError::Invalid,
            NameTooLong => DriverError::NameTooLong,
            Misaligned | OutsideNvm | BrokenLink | OffsetPastReserved => DriverError::Io,
            FlashProgram | VerifyMismatch => DriverError::Io,
            BadMagic | BadPageNumber => DriverError::Io,
            Full => DriverError::NoSpace,
            DuplicateCreate => DriverError::Exists,
            WrongPermission => DriverError::Access,
            OutOfSpace => DriverError::Quota,
            TextRegion | DataRegion | StackRegion | EnableMpu | DisableMpu => DriverError::Io,
        }
    }
}

/// A process-wide error-code latch, owned per [`crate::driver::Mount`]
/// rather than as module-level state (§9: "prefer owning them inside
/// the mount instance"). Holds the most recent low-level error so a
/// high-level caller that only sees a [`DriverError`] can still recover
/// the underlying cause for diagnostics.
#[derive(Debug, Default)]
pub struct ErrnoLatch {
    last: Cell<Option<XipfsError>>,
}

impl ErrnoLatch {
    /// Create an empty latch.
    pub const fn new() -> Self {
        Self {
            last: Cell::new(None),
        }
    }

    /// Record `err` as the most recent low-level error and return it,
    /// so call sites can `return Err(latch.set(e))`-style propagate.
    pub fn set(&self, err: XipfsError) -> XipfsError {
        self.last.set(Some(err));
        err
    }

    /// The most recently latched low-level error, if any.
    pub fn get(&self) -> Option<XipfsError> {
        self.last.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_full_to_no_space() {
        let d: DriverError = XipfsError::Full.into();
        assert_eq!(d, DriverError::NoSpace);
    }

    #[test]
    fn maps_duplicate_create_to_exists() {
        let d: DriverError = XipfsError::DuplicateCreate.into();
        assert_eq!(d, DriverError::Exists);
    }

    #[test]
    fn latch_remembers_last_error() {
        let latch = ErrnoLatch::new();
        assert!(latch.get().is_none());
        latch.set(XipfsError::Full);
        assert_eq!(latch.get(), Some(XipfsError::Full));
        latch.set(XipfsError::BadMagic);
        assert_eq!(latch.get(), Some(XipfsError::BadMagic));
    }
}
