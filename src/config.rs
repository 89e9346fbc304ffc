//! Compile-time layout constants.
//!
//! Page geometry (page size, page count, base address, program-block
//! size/alignment, erase-state byte) is deliberately *not* here: it is
//! supplied at run time by the host's [`crate::nvm::NvmBackend`]
//! implementation, the "host-provided primitives" boundary. Only the
//! on-flash record layout constants, which are part of the wire format
//! and must agree between any two xipfs implementations reading the
//! same flash chip, live as crate-level constants.

/// Maximum length of an xipfs path, including the trailing null byte.
pub const PATH_MAX: usize = 64;

/// Magic number identifying a mounted xipfs file system, reproduced
/// byte-for-byte in the `.xipfs_infos` virtual file.
pub const MAGIC: u32 = 0xf9d3_b6cb;

/// Number of rotating size slots kept in each file record.
pub const SLOTS: usize = 86;

/// Maximum number of `argv` entries accepted by the execution core.
pub const ARGC_MAX: usize = 64;

/// Maximum number of descriptors (file or directory) tracked at once.
pub const MAX_OPEN_DESC: usize = 16;

/// Default erase-state byte for flash that erases to all-ones. A host
/// whose NVM erases to zero supplies its own value via
/// [`crate::nvm::NvmBackend::ERASE_BYTE`].
pub const DEFAULT_ERASE_BYTE: u8 = 0xFF;

/// The well-known path of the virtual mount-info file.
pub const VIRTUAL_FILE_NAME: &str = ".xipfs_infos";

/// Default stack size, in bytes, reserved for a loaded XIP binary.
pub const DEFAULT_STACK_SIZE: usize = 1024;
