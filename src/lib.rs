//! `xipfs` — an execute-in-place file system for raw NVM flash.
//!
//! Files live contiguously in flash, page-aligned, as a singly linked
//! chain of records. An executable file is branched to directly from its
//! flash address; it is never copied into RAM. The crate also prepares
//! sandboxed execution contexts for these binaries via an MPU-configured
//! memory isolation layer (the `safe-exec` feature).
//!
//! The surface is organized the way the data flows (§2 of the design
//! spec this crate implements):
//!
//! ```text
//! driver -> path resolver (+ descriptor table) -> allocator -> record -> page buffer -> nvm
//! ```
//!
//! and, for execution:
//!
//! ```text
//! driver -> exec core -> branch to XIP entry -> syscall table / SVC wrappers
//! ```
//!
//! Out of scope, by design: journaling or crash-atomic multi-file
//! transactions, wear leveling beyond append-then-compact, hierarchical
//! directory indexing, symlinks/hard links/permissions beyond an
//! executable bit, and dynamic relocation of loaded binaries.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

mod log {
    //! Internal logging shim. Expands to `defmt` macros when the
    //! `defmt` feature is enabled, and to nothing otherwise, so the
    //! rest of the crate can log unconditionally.
    #[allow(unused_macros)]
    macro_rules! trace {
        ($($arg:tt)*) => {
            #[cfg(feature = "defmt")]
            ::defmt::trace!($($arg)*);
        };
    }
    #[allow(unused_macros)]
    macro_rules! debug {
        ($($arg:tt)*) => {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg)*);
        };
    }
    #[allow(unused_macros)]
    macro_rules! warn {
        ($($arg:tt)*) => {
            #[cfg(feature = "defmt")]
            ::defmt::warn!($($arg)*);
        };
    }
    #[allow(unused_macros)]
    macro_rules! error {
        ($($arg:tt)*) => {
            #[cfg(feature = "defmt")]
            ::defmt::error!($($arg)*);
        };
    }
    pub(crate) use {debug, error, trace, warn};
}

pub mod config;
pub mod error;
pub mod nvm;
pub mod buffer;
pub mod record;
pub mod alloc;
pub mod path;
pub mod desc;
pub mod driver;
pub mod exec;

#[cfg(feature = "safe-exec")]
pub mod mpu;

#[cfg(any(test, feature = "std"))]
pub mod mock;

pub use config::{ARGC_MAX, MAGIC, MAX_OPEN_DESC, PATH_MAX, SLOTS};
pub use driver::{Mount, OpenFlags};
pub use error::{DriverError, XipfsError};
