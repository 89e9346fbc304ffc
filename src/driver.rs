//! The VFS driver surface (§4.7): the entry points a caller actually
//! uses — `open`, `read`, `write`, `lseek`, `fsync`, `opendir`,
//! `readdir`, `closedir`, `stat`, `statvfs`, `mkdir`, `rmdir`,
//! `unlink`, `rename`, `format`, `mount`, `umount` — plus the
//! `.xipfs_infos` virtual file (§F of `SPEC_FULL.md`).
//!
//! Every entry point returns [`DriverError`]; [`Mount`] keeps the last
//! low-level [`crate::error::XipfsError`] in its [`ErrnoLatch`] for
//! diagnostics.

use core::cell::Cell;

use crate::alloc;
use crate::buffer::PageBuffer;
use crate::config::{MAGIC, PATH_MAX, VIRTUAL_FILE_NAME};
use crate::desc::{DescKind, DescTable, Handle};
use crate::error::{DriverError, ErrnoLatch, XipfsError};
use crate::log;
use crate::nvm::{Nvm, NvmBackend};
use crate::path::{self, PathClass};
use crate::record::{FileRecord, Next};

/// Flags a file may be opened with. A bitset, not an enum: `READ` and
/// `WRITE` may be combined; `CREATE` additionally allows `open` to
/// behave like `new_file` when the path does not exist yet; `APPEND`
/// seeds the descriptor's position at the current size instead of `0`;
/// `EXCL`, combined with `CREATE`, fails with `Exists` when the path is
/// already a file (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const READ: Self = Self(0b00001);
    pub const WRITE: Self = Self(0b00010);
    pub const CREATE: Self = Self(0b00100);
    pub const APPEND: Self = Self(0b01000);
    pub const EXCL: Self = Self(0b10000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single reentrancy guard: `true` while held. Stands in for the
/// original's `execution_mutex`/`mutex` pair (§5) on a platform with no
/// OS scheduler to block a second caller on — a second attempt to
/// acquire a held lock fails fast with [`DriverError::Busy`] rather
/// than spinning.
#[derive(Default)]
struct Latch {
    held: Cell<bool>,
}

impl Latch {
    fn try_begin(&self) -> Result<(), DriverError> {
        if self.held.replace(true) {
            return Err(DriverError::Busy);
        }
        Ok(())
    }

    fn end(&self) {
        self.held.set(false);
    }
}

/// A directory entry as returned by [`Mount::readdir`].
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub name: [u8; PATH_MAX],
    pub name_len: usize,
    pub is_dir: bool,
}

/// File metadata as returned by [`Mount::stat`] (§4.7: "returns
/// fabricated `inode`/`dev`... size from the size list, block size =
/// page size, blocks = `reserved / page_size`" — there is no real
/// inode table behind any of this, it is synthesized from the record's
/// own address and the mount's).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u32,
    pub reserved: u32,
    pub exec: bool,
    pub is_dir: bool,
    /// Fabricated inode number: the record's flash address.
    pub inode: u32,
    /// Fabricated device id: the mount's base address.
    pub dev: u32,
    pub block_size: u32,
    pub blocks: u32,
}

/// File system-wide usage stats, as returned by [`Mount::statvfs`].
#[derive(Debug, Clone, Copy)]
pub struct Statvfs {
    pub page_size: usize,
    pub page_count: usize,
    pub free_pages: usize,
}

/// A raw snapshot of the mount point, the content behind the
/// `.xipfs_infos` virtual file (§3: "a raw copy of the mount-point
/// structure"; it "has no on-flash record", so the bytes it reads back
/// are produced here rather than walked off flash).
#[derive(Debug, Clone, Copy)]
pub struct MountInfo {
    pub magic: u32,
    pub mount_base: u32,
    pub mount_end: u32,
    pub page_size: u32,
}

impl MountInfo {
    const SIZE: usize = 16;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.mount_base.to_le_bytes());
        out[8..12].copy_from_slice(&self.mount_end.to_le_bytes());
        out[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        out
    }
}

/// An execute-in-place mount over one [`NvmBackend`] (§4.7, §5, §9).
///
/// Owns every piece of process-wide state the original design kept as
/// module statics: the page buffer, the descriptor table, and the
/// error latch (§9: "prefer owning them inside the mount instance").
pub struct Mount<B: NvmBackend> {
    magic: u32,
    nvm: Nvm<B>,
    buf: PageBuffer,
    desc: DescTable,
    errno: ErrnoLatch,
    mount_base: u32,
    mount_end: u32,
    ops_lock: Latch,
    exec_lock: Latch,
}

impl<B: NvmBackend> Mount<B> {
    /// Mount `backend` over `[mount_base, mount_base + size)`.
    ///
    /// Does not format: an unformatted (but erased) region mounts
    /// cleanly as an empty file system. A region whose first page is
    /// neither erased nor a well-formed record fails validation the
    /// first time it is walked.
    pub fn mount(backend: B, mount_base: u32, size: u32) -> Result<Self, DriverError> {
        let nvm = Nvm::new(backend);
        if !nvm.page_aligned(mount_base as usize) || size as usize % nvm.page_size() != 0 {
            return Err(DriverError::Invalid);
        }
        Ok(Self {
            magic: MAGIC,
            nvm,
            buf: PageBuffer::new(),
            desc: DescTable::new(),
            errno: ErrnoLatch::new(),
            mount_base,
            mount_end: mount_base + size,
            ops_lock: Latch::default(),
            exec_lock: Latch::default(),
        })
    }

    /// Flush any buffered page and drop the mount. A no-op beyond
    /// that: there is no on-flash unmount marker to write.
    pub fn umount(mut self) -> Result<(), DriverError> {
        self.buf.flush(&mut self.nvm).map_err(|e| self.fail(e))
    }

    fn check_magic(&self) -> Result<(), DriverError> {
        if self.magic != MAGIC {
            return Err(self.fail(XipfsError::BadMagic));
        }
        Ok(())
    }

    pub(crate) fn fail(&self, e: XipfsError) -> DriverError {
        log::error!("driver: operation failed");
        self.errno.set(e).into()
    }

    /// The most recent low-level error, if any operation has failed.
    pub fn last_error(&self) -> Option<XipfsError> {
        self.errno.get()
    }

    /// Run `f` with the operations lock held, releasing it whether `f`
    /// succeeds or fails. A plain guard struct cannot be used here
    /// (holding a borrow derived from `&self.ops_lock` across further
    /// `&mut self` calls inside `f` would conflict with the borrow
    /// checker); the lock state instead lives entirely in a `Cell`
    /// flipped before and after the call.
    fn with_ops_lock<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        self.ops_lock.try_begin()?;
        let result = f(self);
        self.ops_lock.end();
        result
    }

    fn classify(&mut self, path: &[u8]) -> Result<PathClass, DriverError> {
        let head = alloc::head_cursor(&mut self.nvm, self.mount_base).map_err(|e| self.fail(e))?;
        path::classify(&mut self.nvm, &mut self.buf, head, path).map_err(|e| self.fail(e))
    }

    /// Is `path` the well-known `.xipfs_infos` sentinel?
    fn is_virtual_path(path: &str) -> bool {
        path.len() == VIRTUAL_FILE_NAME.len() + 1
            && path.as_bytes()[0] == b'/'
            && &path[1..] == VIRTUAL_FILE_NAME
    }

    /// A raw snapshot of this mount, as read back through the virtual
    /// file.
    pub fn mount_info(&self) -> MountInfo {
        MountInfo {
            magic: self.magic,
            mount_base: self.mount_base,
            mount_end: self.mount_end,
            page_size: self.nvm.page_size() as u32,
        }
    }

    /// If `child_path`'s parent directory is kept alive only by an
    /// empty-directory marker record, remove that marker: `child_path`
    /// is about to gain a real entry, so the marker's job is done
    /// (§4.7 `mkdir`/`open`: "if an empty-directory-marker witness
    /// lines up with the dirname, remove it first").
    fn remove_parent_marker_if_present(&mut self, child_path: &[u8]) -> Result<(), DriverError> {
        let (dirname, _) = path::split(child_path);
        if dirname.len() == 1 && dirname[0] == b'/' {
            return Ok(());
        }
        if let PathClass::ExistsAsEmptyDir(marker_addr) = self.classify(dirname)? {
            alloc::remove(
                &mut self.nvm,
                &mut self.buf,
                &mut self.desc,
                self.mount_base,
                self.mount_end,
                FileRecord::at(marker_addr),
            )
            .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// If removing `removed_path` left its parent directory with
    /// nothing else in it, and the parent is not the root, create a
    /// fresh empty-directory marker there so the directory itself
    /// keeps existing (§4.7 `rmdir`/`unlink`/`rename`).
    fn restore_parent_marker_if_needed(&mut self, removed_path: &[u8]) -> Result<(), DriverError> {
        let (dirname, _) = path::split(removed_path);
        if dirname.len() == 1 && dirname[0] == b'/' {
            return Ok(());
        }
        if !matches!(self.classify(dirname)?, PathClass::Creatable) {
            return Ok(());
        }
        if dirname.len() + 1 >= PATH_MAX {
            return Err(self.fail(XipfsError::NameTooLong));
        }
        let mut marker_buf = [0u8; PATH_MAX];
        marker_buf[..dirname.len()].copy_from_slice(dirname);
        marker_buf[dirname.len()] = b'/';
        alloc::new_file(
            &mut self.nvm,
            &mut self.buf,
            self.mount_base,
            self.mount_end,
            &marker_buf,
            0,
            0,
        )
        .map(|_| ())
        .map_err(|e| self.fail(e))
    }

    /// Create (and immediately close) an empty file at `path`,
    /// reserving `size` payload bytes, optionally marked executable.
    pub fn new_file(&mut self, path: &str, size: u32, executable: bool) -> Result<(), DriverError> {
        self.check_magic()?;
        if path.as_bytes() == b"/" {
            return Err(DriverError::Invalid);
        }
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        // A trailing `/` names a directory, never a creatable file,
        // even when nothing yet exists at that path (classifies
        // `Creatable` all the same).
        if path.as_bytes().last() == Some(&b'/') {
            return Err(DriverError::IsDir);
        }
        self.with_ops_lock(move |this| {
            match this.classify(&path_buf[..path.len()])? {
                PathClass::Creatable => {}
                PathClass::ExistsAsFile(_) => return Err(this.fail(XipfsError::DuplicateCreate)),
                PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => {
                    return Err(DriverError::Exists)
                }
                PathClass::BlockedByNonDir(_) => return Err(DriverError::NotDir),
                PathClass::ParentMissing => return Err(DriverError::NotFound),
                PathClass::Undefined => return Err(DriverError::Io),
            }
            this.remove_parent_marker_if_present(&path_buf[..path.len()])?;

            alloc::new_file(
                &mut this.nvm,
                &mut this.buf,
                this.mount_base,
                this.mount_end,
                &path_buf,
                size,
                executable as u32,
            )
            .map(|_| ())
            .map_err(|e| this.fail(e))
        })
    }

    /// Open `path`, creating it first if `flags` contains `CREATE` and
    /// it does not already exist. `CREATE | EXCL` against a path that
    /// already exists as a file fails with `Exists` instead of opening
    /// it. `APPEND` seeds the descriptor's position at the file's
    /// current size rather than `0` (§4.7).
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Handle, DriverError> {
        self.check_magic()?;
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;

        if Self::is_virtual_path(path) {
            if flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::CREATE) {
                return Err(self.fail(XipfsError::WrongPermission));
            }
            return self.desc.track(DescKind::Virtual { offset: 0 });
        }

        let class = self.classify(&path_buf[..path.len()])?;

        let record = match class {
            PathClass::ExistsAsFile(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) => {
                return Err(DriverError::Exists)
            }
            PathClass::ExistsAsFile(addr) => FileRecord::at(addr),
            PathClass::Creatable if flags.contains(OpenFlags::CREATE) => {
                self.new_file(path, 0, false)?;
                match self.classify(&path_buf[..path.len()])? {
                    PathClass::ExistsAsFile(addr) => FileRecord::at(addr),
                    _ => return Err(DriverError::Io),
                }
            }
            PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => {
                return Err(DriverError::IsDir)
            }
            _ => return Err(DriverError::NotFound),
        };

        let offset = if flags.contains(OpenFlags::APPEND) {
            record.get_size(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?
        } else {
            0
        };

        self.desc.track(DescKind::File { record, offset, flags })
    }

    /// Close a file, directory, or virtual-file descriptor. If the
    /// position ran past the recorded size, synchronize the size slot
    /// first (§4.7) so a write the caller never explicitly `fsync`ed is
    /// not silently lost.
    pub fn close(&mut self, handle: Handle) -> Result<(), DriverError> {
        if let DescKind::File { record, offset, .. } = *self.desc.get(handle)? {
            let size = record.get_size(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
            if offset > size {
                record
                    .set_size(&mut self.nvm, &mut self.buf, offset)
                    .map_err(|e| self.fail(e))?;
            }
        }
        self.desc.untrack(handle)
    }

    /// Read up to `out.len()` bytes from the descriptor's current
    /// position, advancing it.
    pub fn read(&mut self, handle: Handle, out: &mut [u8]) -> Result<usize, DriverError> {
        if let DescKind::Virtual { offset } = *self.desc.get(handle)? {
            let info = self.mount_info().to_bytes();
            let mut pos = offset as usize;
            let mut n = 0;
            while n < out.len() && pos < info.len() {
                out[n] = info[pos];
                pos += 1;
                n += 1;
            }
            self.desc
                .update(handle, DescKind::Virtual { offset: pos as u32 })?;
            return Ok(n);
        }
        let (record, mut offset, flags) = match *self.desc.get(handle)? {
            DescKind::File { record, offset, flags } => (record, offset, flags),
            DescKind::Dir { .. } | DescKind::Virtual { .. } => return Err(DriverError::IsDir),
        };
        if !flags.contains(OpenFlags::READ) {
            return Err(self.fail(XipfsError::WrongPermission));
        }
        let size = record.get_size(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
        let mut n = 0;
        while n < out.len() && offset < size {
            out[n] = record
                .read_byte(&mut self.nvm, &mut self.buf, offset)
                .map_err(|e| self.fail(e))?;
            offset += 1;
            n += 1;
        }
        self.desc
            .update(handle, DescKind::File { record, offset, flags })?;
        Ok(n)
    }

    /// Write `data` at the descriptor's current position, advancing it
    /// up to the record's reserved capacity. Does not touch the
    /// recorded logical size: that is only rotated by `close`,
    /// `fsync`, or a backward `lseek` across the extension (§4.7).
    pub fn write(&mut self, handle: Handle, data: &[u8]) -> Result<usize, DriverError> {
        let (record, mut offset, flags) = match *self.desc.get(handle)? {
            DescKind::File { record, offset, flags } => (record, offset, flags),
            DescKind::Dir { .. } => return Err(DriverError::IsDir),
            DescKind::Virtual { .. } => return Err(self.fail(XipfsError::WrongPermission)),
        };
        if !flags.contains(OpenFlags::WRITE) {
            return Err(self.fail(XipfsError::WrongPermission));
        }
        let max_pos = record.max_pos(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
        let mut n = 0;
        for &byte in data {
            if offset > max_pos {
                break;
            }
            record
                .write_byte(&mut self.nvm, &mut self.buf, offset, byte)
                .map_err(|e| self.fail(e))?;
            offset += 1;
            n += 1;
        }
        self.desc
            .update(handle, DescKind::File { record, offset, flags })?;
        Ok(n)
    }

    /// Reposition a file descriptor to an absolute offset. Seeking
    /// backward across a write extension that was never synced rotates
    /// a size slot first, so the extension is not silently lost.
    pub fn lseek(&mut self, handle: Handle, offset: u32) -> Result<(), DriverError> {
        let (record, pos, flags) = match *self.desc.get(handle)? {
            DescKind::File { record, offset, flags } => (record, offset, flags),
            DescKind::Dir { .. } => return Err(DriverError::IsDir),
            DescKind::Virtual { .. } => {
                return self.desc.update(handle, DescKind::Virtual { offset });
            }
        };
        let size = record.get_size(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
        if pos > size && offset < pos {
            record
                .set_size(&mut self.nvm, &mut self.buf, pos)
                .map_err(|e| self.fail(e))?;
        }
        self.desc
            .update(handle, DescKind::File { record, offset, flags })
    }

    /// Rotate a new size slot to `pos`, the caller's view of how far
    /// the file now logically extends (§4.7: "rotates a new size slot
    /// with value `pos`"), and flush any buffered page.
    pub fn fsync(&mut self, handle: Handle, pos: u32) -> Result<(), DriverError> {
        let (record, flags) = match *self.desc.get(handle)? {
            DescKind::File { record, flags, .. } => (record, flags),
            DescKind::Dir { .. } => return Err(DriverError::IsDir),
            DescKind::Virtual { .. } => {
                return self.buf.flush(&mut self.nvm).map_err(|e| self.fail(e));
            }
        };
        if !flags.contains(OpenFlags::WRITE) {
            return Err(self.fail(XipfsError::WrongPermission));
        }
        record
            .set_size(&mut self.nvm, &mut self.buf, pos)
            .map_err(|e| self.fail(e))?;
        self.buf.flush(&mut self.nvm).map_err(|e| self.fail(e))
    }

    /// Open a directory for iteration.
    pub fn opendir(&mut self, path: &str) -> Result<Handle, DriverError> {
        self.check_magic()?;
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        // A trailing `/` names the same directory as the slash-free
        // form; drop it so `prefix_len` lines up with the stored paths
        // the same way `classify` already normalizes its own query.
        let trimmed_len = if path.len() > 1 && path.as_bytes().ends_with(b"/") {
            path.len() - 1
        } else {
            path.len()
        };
        match self.classify(&path_buf[..path.len()])? {
            PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir | PathClass::Creatable
                if path.as_bytes() == b"/" =>
            {
                let head = alloc::head_cursor(&mut self.nvm, self.mount_base)
                    .map_err(|e| self.fail(e))?;
                self.desc.track(DescKind::Dir { next: head, prefix_len: 1 })
            }
            PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => {
                let head = alloc::head_cursor(&mut self.nvm, self.mount_base)
                    .map_err(|e| self.fail(e))?;
                self.desc
                    .track(DescKind::Dir { next: head, prefix_len: trimmed_len })
            }
            PathClass::ExistsAsFile(_) => Err(DriverError::NotDir),
            _ => Err(DriverError::NotFound),
        }
    }

    /// Return the next entry directly under the directory's path, or
    /// `Ok(None)` once exhausted. Nested subdirectories are reported
    /// once, as `is_dir` entries; their own contents are not recursed
    /// into (directories are implicit, §4.5).
    pub fn readdir(&mut self, handle: Handle) -> Result<Option<DirEntry>, DriverError> {
        let (mut next, prefix_len) = match *self.desc.get(handle)? {
            DescKind::Dir { next, prefix_len } => (next, prefix_len),
            DescKind::File { .. } | DescKind::Virtual { .. } => return Err(DriverError::NotDir),
        };

        loop {
            let addr = match next {
                Next::Link(addr) => addr,
                _ => {
                    self.desc.update(handle, DescKind::Dir { next, prefix_len })?;
                    return Ok(None);
                }
            };
            let rec = FileRecord::at(addr);
            let mut path_buf = [0u8; PATH_MAX];
            let len = rec
                .path(&mut self.nvm, &mut self.buf, &mut path_buf)
                .map_err(|e| self.fail(e))?;
            next = rec.next(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;

            let under_dir = if prefix_len == 1 {
                len > 1 && path_buf[0] == b'/'
            } else {
                len > prefix_len && path_buf[prefix_len] == b'/'
            };
            if !under_dir {
                continue;
            }
            if prefix_len != 1 && len == prefix_len + 1 {
                // This record is the listed directory's own empty
                // marker (path == dirname + "/"), not a child entry.
                continue;
            }
            let rest = &path_buf[prefix_len..len];
            let rest = if prefix_len == 1 { &path_buf[1..len] } else { &rest[1..] };
            let entry_len = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());
            let is_dir = entry_len < rest.len();

            self.desc.update(handle, DescKind::Dir { next, prefix_len })?;
            let mut name = [0u8; PATH_MAX];
            name[..entry_len].copy_from_slice(&rest[..entry_len]);
            return Ok(Some(DirEntry { name, name_len: entry_len, is_dir }));
        }
    }

    /// Close a directory descriptor.
    pub fn closedir(&mut self, handle: Handle) -> Result<(), DriverError> {
        self.desc.untrack(handle)
    }

    /// File or virtual-file metadata.
    pub fn stat(&mut self, path: &str) -> Result<Stat, DriverError> {
        self.check_magic()?;
        if path.len() == VIRTUAL_FILE_NAME.len() + 1
            && path.as_bytes()[0] == b'/'
            && &path[1..] == VIRTUAL_FILE_NAME
        {
            return Ok(Stat {
                size: MountInfo::SIZE as u32,
                reserved: 0,
                exec: false,
                is_dir: false,
                inode: 0,
                dev: self.mount_base,
                block_size: self.nvm.page_size() as u32,
                blocks: 0,
            });
        }
        let page_size = self.nvm.page_size() as u32;
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        match self.classify(&path_buf[..path.len()])? {
            PathClass::ExistsAsFile(addr) => {
                let rec = FileRecord::at(addr);
                let size = rec.get_size(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
                let reserved = rec.reserved(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
                let exec = rec.exec(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))? != 0;
                Ok(Stat {
                    size,
                    reserved,
                    exec,
                    is_dir: false,
                    inode: addr,
                    dev: self.mount_base,
                    block_size: page_size,
                    blocks: reserved / page_size,
                })
            }
            PathClass::ExistsAsEmptyDir(addr) => Ok(Stat {
                size: 0,
                reserved: 0,
                exec: false,
                is_dir: true,
                inode: addr,
                dev: self.mount_base,
                block_size: page_size,
                blocks: 0,
            }),
            PathClass::ExistsAsNonemptyDir => Ok(Stat {
                size: 0,
                reserved: 0,
                exec: false,
                is_dir: true,
                inode: 0,
                dev: self.mount_base,
                block_size: page_size,
                blocks: 0,
            }),
            _ => Err(DriverError::NotFound),
        }
    }

    /// Free-space summary for the mount.
    pub fn statvfs(&mut self) -> Result<Statvfs, DriverError> {
        self.check_magic()?;
        let free = alloc::free_pages(&mut self.nvm, &mut self.buf, self.mount_base, self.mount_end)
            .map_err(|e| self.fail(e))?;
        Ok(Statvfs {
            page_size: self.nvm.page_size(),
            page_count: alloc::page_count(&self.nvm),
            free_pages: free,
        })
    }

    /// Create an empty-directory marker record at `path` (directories
    /// are otherwise implicit prefixes of file paths, §4.5; the marker
    /// is what keeps an intentionally-empty one alive between `mkdir`
    /// and its first child). A no-op if `path` already names a
    /// directory.
    pub fn mkdir(&mut self, path: &str) -> Result<(), DriverError> {
        self.check_magic()?;
        if path.as_bytes() == b"/" {
            return Ok(());
        }
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        self.with_ops_lock(move |this| {
            match this.classify(&path_buf[..path.len()])? {
                PathClass::Creatable => {}
                PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => return Ok(()),
                PathClass::ExistsAsFile(_) => return Err(DriverError::Exists),
                PathClass::BlockedByNonDir(_) => return Err(DriverError::NotDir),
                PathClass::ParentMissing => return Err(DriverError::NotFound),
                PathClass::Undefined => return Err(DriverError::Io),
            }
            this.remove_parent_marker_if_present(&path_buf[..path.len()])?;

            if path.len() + 1 >= PATH_MAX {
                return Err(this.fail(XipfsError::NameTooLong));
            }
            let mut marker_buf = [0u8; PATH_MAX];
            marker_buf[..path.len()].copy_from_slice(&path_buf[..path.len()]);
            marker_buf[path.len()] = b'/';
            alloc::new_file(
                &mut this.nvm,
                &mut this.buf,
                this.mount_base,
                this.mount_end,
                &marker_buf,
                0,
                0,
            )
            .map(|_| ())
            .map_err(|e| this.fail(e))
        })
    }

    /// Remove an empty directory: its marker record, if one exists.
    pub fn rmdir(&mut self, path: &str) -> Result<(), DriverError> {
        self.check_magic()?;
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        self.with_ops_lock(move |this| {
            let marker = match this.classify(&path_buf[..path.len()])? {
                PathClass::ExistsAsEmptyDir(addr) => addr,
                PathClass::ExistsAsNonemptyDir => return Err(DriverError::NotEmpty),
                PathClass::ExistsAsFile(_) => return Err(DriverError::NotDir),
                _ => return Err(DriverError::NotFound),
            };
            alloc::remove(
                &mut this.nvm,
                &mut this.buf,
                &mut this.desc,
                this.mount_base,
                this.mount_end,
                FileRecord::at(marker),
            )
            .map_err(|e| this.fail(e))?;
            this.restore_parent_marker_if_needed(&path_buf[..path.len()])
        })
    }

    /// Remove a file. If this was the last thing under its parent
    /// directory, restore that directory's empty-marker so it keeps
    /// existing (§4.7).
    pub fn unlink(&mut self, path: &str) -> Result<(), DriverError> {
        self.check_magic()?;
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        self.with_ops_lock(move |this| {
            let record = match this.classify(&path_buf[..path.len()])? {
                PathClass::ExistsAsFile(addr) => FileRecord::at(addr),
                PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => {
                    return Err(DriverError::IsDir)
                }
                _ => return Err(DriverError::NotFound),
            };
            alloc::remove(
                &mut this.nvm,
                &mut this.buf,
                &mut this.desc,
                this.mount_base,
                this.mount_end,
                record,
            )
            .map_err(|e| this.fail(e))?;
            this.restore_parent_marker_if_needed(&path_buf[..path.len()])
        })
    }

    /// Rename a file, or every file under a directory prefix, from
    /// `from` to `to`. Self-rename is a no-op; renaming a path onto
    /// one of its own descendants is rejected (§F).
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), DriverError> {
        self.check_magic()?;
        let from_buf = path::make_path_buf(from).map_err(|e| self.fail(e))?;
        let to_buf = path::make_path_buf(to).map_err(|e| self.fail(e))?;
        if from_buf == to_buf {
            return Ok(());
        }
        if path::is_nested(&from_buf[..from.len()], &to_buf[..to.len()]) {
            return Err(DriverError::Invalid);
        }
        self.with_ops_lock(move |this| {
            let head =
                alloc::head_cursor(&mut this.nvm, this.mount_base).map_err(|e| this.fail(e))?;
            let (from_class, to_class) = path::classify_pair(
                &mut this.nvm,
                &mut this.buf,
                head,
                &from_buf[..from.len()],
                &to_buf[..to.len()],
            )
            .map_err(|e| this.fail(e))?;

            match from_class {
                PathClass::ExistsAsFile(addr) => {
                    if matches!(
                        to_class,
                        PathClass::ExistsAsFile(_)
                            | PathClass::ExistsAsNonemptyDir
                            | PathClass::ExistsAsEmptyDir(_)
                    ) {
                        return Err(DriverError::Exists);
                    }
                    FileRecord::at(addr)
                        .rename(&mut this.nvm, &mut this.buf, &to_buf)
                        .map_err(|e| this.fail(e))?;
                }
                PathClass::ExistsAsEmptyDir(_) | PathClass::ExistsAsNonemptyDir => {
                    alloc::rename_all(
                        &mut this.nvm,
                        &mut this.buf,
                        this.mount_base,
                        &from_buf[..from.len()],
                        &to_buf[..to.len()],
                    )
                    .map_err(|e| this.fail(e))?;
                }
                _ => return Err(DriverError::NotFound),
            }

            let (from_dirname, _) = path::split(&from_buf[..from.len()]);
            let (to_dirname, _) = path::split(&to_buf[..to.len()]);
            if from_dirname != to_dirname {
                this.restore_parent_marker_if_needed(&from_buf[..from.len()])?;
            }
            Ok(())
        })
    }

    /// Erase the entire mount, discarding every file.
    pub fn format(&mut self) -> Result<(), DriverError> {
        self.with_ops_lock(|this| {
            alloc::format(&mut this.nvm, &mut this.buf, this.mount_base, this.mount_end)
                .map_err(|e| this.fail(e))
        })
    }

    /// Acquire the execution lock, preventing a concurrent mutation of
    /// the flash region an XIP binary is currently branched into.
    /// Returns [`DriverError::Busy`] if execution (or another
    /// operation holding it) is already in progress.
    pub(crate) fn lock_execution(&self) -> Result<(), DriverError> {
        self.exec_lock.try_begin()
    }

    pub(crate) fn unlock_execution(&self) {
        self.exec_lock.end();
    }

    pub(crate) fn nvm_mut(&mut self) -> &mut Nvm<B> {
        &mut self.nvm
    }

    pub(crate) fn buf_mut(&mut self) -> &mut PageBuffer {
        &mut self.buf
    }

    pub(crate) fn mount_base(&self) -> u32 {
        self.mount_base
    }

    pub(crate) fn mount_end(&self) -> u32 {
        self.mount_end
    }

    fn classify_for_exec(&mut self, path: &str) -> Result<Option<FileRecord>, DriverError> {
        let path_buf = path::make_path_buf(path).map_err(|e| self.fail(e))?;
        match self.classify(&path_buf[..path.len()])? {
            PathClass::ExistsAsFile(addr) => Ok(Some(FileRecord::at(addr))),
            _ => Ok(None),
        }
    }

    /// Resolve `path` to the record `exec`/`safe_exec` should branch
    /// into, failing with the same checks both entry points share
    /// (§F): the path must name an existing, marked-executable file.
    pub(crate) fn resolve_executable(&mut self, path: &str) -> Result<FileRecord, DriverError> {
        let record = self.classify_for_exec(path)?.ok_or(DriverError::NotFound)?;
        let exec = record.exec(&mut self.nvm, &mut self.buf).map_err(|e| self.fail(e))?;
        match exec {
            1 => Ok(record),
            0 => Err(self.fail(XipfsError::WrongPermission)),
            _ => Err(DriverError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNvm;

    fn mount(page_size: usize, pages: usize) -> Mount<MockNvm> {
        Mount::mount(MockNvm::new(page_size, pages, 0), 0, (page_size * pages) as u32).unwrap()
    }

    #[test]
    fn create_open_write_read_roundtrip() {
        let mut m = mount(512, 8);
        m.new_file("/greeting", 32, false).unwrap();
        let h = m.open("/greeting", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        assert_eq!(m.write(h, b"hello").unwrap(), 5);
        m.lseek(h, 0).unwrap();
        let mut out = [0u8; 5];
        assert_eq!(m.read(h, &mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");
        m.close(h).unwrap();
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        assert_eq!(m.new_file("/a", 10, false), Err(DriverError::Exists));
    }

    #[test]
    fn open_missing_without_create_fails() {
        let mut m = mount(512, 8);
        assert_eq!(
            m.open("/missing", OpenFlags::READ),
            Err(DriverError::NotFound)
        );
    }

    #[test]
    fn unlink_then_reopen_fails() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        m.unlink("/a").unwrap();
        assert_eq!(m.open("/a", OpenFlags::READ), Err(DriverError::NotFound));
    }

    #[test]
    fn readdir_lists_direct_children_only() {
        let mut m = mount(512, 16);
        m.new_file("/bin/app", 10, false).unwrap();
        m.new_file("/bin/sub/tool", 10, false).unwrap();
        m.new_file("/readme", 10, false).unwrap();

        let h = m.opendir("/").unwrap();
        let mut names = std::vec::Vec::new();
        while let Some(entry) = m.readdir(h).unwrap() {
            names.push(std::string::String::from_utf8(entry.name[..entry.name_len].to_vec()).unwrap());
        }
        names.sort();
        assert_eq!(names, std::vec!["bin", "readme"]);
    }

    #[test]
    fn rename_file_moves_it() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        m.rename("/a", "/b").unwrap();
        assert_eq!(m.open("/a", OpenFlags::READ), Err(DriverError::NotFound));
        m.open("/b", OpenFlags::READ).unwrap();
    }

    #[test]
    fn statvfs_reports_free_pages() {
        let mut m = mount(512, 4);
        let before = m.statvfs().unwrap().free_pages;
        m.new_file("/a", 10, false).unwrap();
        let after = m.statvfs().unwrap().free_pages;
        assert_eq!(after, before - 1);
    }

    #[test]
    fn mkdir_then_stat_reports_a_directory() {
        let mut m = mount(512, 8);
        m.mkdir("/d").unwrap();
        let st = m.stat("/d").unwrap();
        assert!(st.is_dir);
    }

    #[test]
    fn stat_reports_fabricated_inode_dev_and_block_counts() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        let st = m.stat("/a").unwrap();
        assert_ne!(st.inode, 0, "a file's inode is its own record address");
        assert_eq!(st.dev, m.mount_base());
        assert_eq!(st.block_size, 512);
        assert_eq!(st.blocks, st.reserved / 512);
    }

    #[test]
    fn mkdir_twice_is_a_no_op() {
        let mut m = mount(512, 8);
        m.mkdir("/d").unwrap();
        m.mkdir("/d").unwrap();
    }

    #[test]
    fn mkdir_rmdir_empty_directory_round_trip() {
        let mut m = mount(512, 8);
        m.mkdir("/d").unwrap();
        m.rmdir("/d").unwrap();
        assert_eq!(m.stat("/d"), Err(DriverError::NotFound));
    }

    #[test]
    fn rmdir_on_a_file_fails_with_notdir() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        assert_eq!(m.rmdir("/a"), Err(DriverError::NotDir));
    }

    // mkdir -> file inside removes the marker -> rmdir blocked -> unlink
    // restores the marker -> rmdir succeeds.
    #[test]
    fn mkdir_file_rmdir_blocked_then_unlink_restores_marker() {
        let mut m = mount(512, 16);
        m.mkdir("/d").unwrap();
        m.new_file("/d/x", 10, false).unwrap();
        assert_eq!(m.rmdir("/d"), Err(DriverError::NotEmpty));
        m.unlink("/d/x").unwrap();
        assert!(m.stat("/d").unwrap().is_dir);
        m.rmdir("/d").unwrap();
        assert_eq!(m.stat("/d"), Err(DriverError::NotFound));
    }

    #[test]
    fn renaming_the_last_file_out_of_a_dir_restores_its_marker() {
        let mut m = mount(512, 16);
        m.mkdir("/d").unwrap();
        m.new_file("/d/x", 10, false).unwrap();
        m.rename("/d/x", "/y").unwrap();
        assert!(m.stat("/d").unwrap().is_dir);
        m.open("/y", OpenFlags::READ).unwrap();
    }

    #[test]
    fn renaming_within_the_same_dir_does_not_spawn_a_marker() {
        let mut m = mount(512, 16);
        m.new_file("/d/x", 10, false).unwrap();
        m.rename("/d/x", "/d/y").unwrap();
        assert!(m.stat("/d").unwrap().is_dir);
        m.open("/d/y", OpenFlags::READ).unwrap();
    }

    #[test]
    fn self_rename_is_a_no_op() {
        let mut m = mount(512, 8);
        m.new_file("/a", 10, false).unwrap();
        m.rename("/a", "/a").unwrap();
        m.open("/a", OpenFlags::READ).unwrap();
    }

    #[test]
    fn renaming_a_dir_into_its_own_descendant_is_rejected() {
        let mut m = mount(512, 16);
        m.new_file("/d/x", 10, false).unwrap();
        assert_eq!(m.rename("/d", "/d/sub"), Err(DriverError::Invalid));
    }

    #[test]
    fn new_file_with_a_trailing_slash_is_rejected_as_isdir() {
        let mut m = mount(512, 8);
        assert_eq!(m.new_file("/d/", 10, false), Err(DriverError::IsDir));
    }

    #[test]
    fn virtual_file_open_write_is_rejected() {
        let mut m = mount(512, 8);
        assert_eq!(
            m.open("/.xipfs_infos", OpenFlags::WRITE),
            Err(DriverError::Access)
        );
        assert_eq!(
            m.open("/.xipfs_infos", OpenFlags::READ | OpenFlags::CREATE),
            Err(DriverError::Access)
        );
    }

    #[test]
    fn virtual_file_reads_the_mount_snapshot() {
        let mut m = mount(512, 8);
        let expected = m.mount_info().to_bytes();

        let h = m.open("/.xipfs_infos", OpenFlags::READ).unwrap();
        assert!(m.stat("/.xipfs_infos").unwrap().size as usize == expected.len());

        let mut out = [0u8; MountInfo::SIZE];
        assert_eq!(m.read(h, &mut out).unwrap(), expected.len());
        assert_eq!(out, expected);
        assert_eq!(m.read(h, &mut out).unwrap(), 0);

        assert_eq!(m.write(h, b"x"), Err(DriverError::Access));
        m.close(h).unwrap();
    }

    #[test]
    fn virtual_file_is_not_a_directory() {
        let mut m = mount(512, 8);
        let h = m.open("/.xipfs_infos", OpenFlags::READ).unwrap();
        assert_eq!(m.readdir(h), Err(DriverError::NotDir));
        m.close(h).unwrap();
    }

    #[test]
    fn write_does_not_extend_size_until_synced() {
        let mut m = mount(512, 8);
        m.new_file("/a", 32, false).unwrap();
        let h = m.open("/a", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        m.write(h, b"hello").unwrap();
        assert_eq!(m.stat("/a").unwrap().size, 0);
        assert_eq!(m.read(h, &mut [0u8; 8]).unwrap(), 0, "cursor sits past the unsynced size");
        m.close(h).unwrap();
    }

    #[test]
    fn seeking_backward_over_an_unsynced_write_syncs_its_size_first() {
        let mut m = mount(512, 8);
        m.new_file("/a", 32, false).unwrap();
        let h = m.open("/a", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        m.write(h, b"hello").unwrap();
        m.lseek(h, 2).unwrap();
        let mut out = [0u8; 3];
        assert_eq!(m.read(h, &mut out).unwrap(), 3);
        assert_eq!(&out, b"llo");
        m.close(h).unwrap();
    }

    #[test]
    fn fsync_rotates_the_size_slot_to_the_given_position() {
        let mut m = mount(512, 8);
        m.new_file("/a", 32, false).unwrap();
        let h = m.open("/a", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        m.write(h, b"hello").unwrap();
        m.fsync(h, 3).unwrap();
        assert_eq!(m.stat("/a").unwrap().size, 3);
    }

    #[test]
    fn close_synchronizes_size_past_the_final_position() {
        let mut m = mount(512, 8);
        m.new_file("/a", 32, false).unwrap();
        let h = m.open("/a", OpenFlags::WRITE).unwrap();
        m.write(h, b"hello").unwrap();
        m.close(h).unwrap();
        assert_eq!(m.stat("/a").unwrap().size, 5);
    }

    #[test]
    fn write_is_capped_at_reserved_capacity() {
        let mut m = mount(512, 8);
        m.new_file("/a", 4, false).unwrap();
        let h = m.open("/a", OpenFlags::WRITE).unwrap();
        assert_eq!(m.write(h, b"abcdef").unwrap(), 4);
        m.close(h).unwrap();
        assert_eq!(m.stat("/a").unwrap().size, 4);
    }

    #[test]
    fn open_create_excl_on_an_existing_file_fails_with_exists() {
        let mut m = mount(512, 8);
        m.new_file("/a", 16, false).unwrap();
        assert_eq!(
            m.open("/a", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL),
            Err(DriverError::Exists)
        );
    }

    #[test]
    fn open_append_seeds_the_position_at_the_current_size() {
        let mut m = mount(512, 8);
        m.new_file("/a", 16, false).unwrap();
        let h = m.open("/a", OpenFlags::WRITE).unwrap();
        m.write(h, b"abc").unwrap();
        m.close(h).unwrap();

        let h = m.open("/a", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
        m.write(h, b"def").unwrap();
        m.close(h).unwrap();

        let h = m.open("/a", OpenFlags::READ).unwrap();
        let mut out = [0u8; 8];
        let n = m.read(h, &mut out).unwrap();
        m.close(h).unwrap();
        assert_eq!(&out[..n], b"abcdef");
    }

    #[test]
    fn opendir_with_a_trailing_slash_finds_an_existing_empty_directory() {
        let mut m = mount(512, 8);
        m.mkdir("/d").unwrap();
        let h = m.opendir("/d/").unwrap();
        assert!(m.readdir(h).unwrap().is_none());
        m.closedir(h).unwrap();
    }

    #[test]
    fn opendir_with_a_trailing_slash_still_lists_only_direct_children() {
        let mut m = mount(512, 8);
        m.new_file("/d/x", 0, false).unwrap();
        m.new_file("/d/y", 0, false).unwrap();
        let h = m.opendir("/d/").unwrap();
        let mut names = std::vec::Vec::new();
        while let Some(entry) = m.readdir(h).unwrap() {
            names.push(std::string::String::from_utf8(entry.name[..entry.name_len].to_vec()).unwrap());
        }
        m.closedir(h).unwrap();
        names.sort();
        assert_eq!(names, std::vec!["x", "y"]);
    }

    #[test]
    fn opendir_cursor_survives_compaction_from_an_unrelated_unlink() {
        // Chain order is /other, /d/a, /d/b, so after the first
        // `readdir` (which returns "a"), the cursor's persisted `next`
        // already equals `/d/b`'s address. Unlinking `/other` (earlier
        // in the chain) compacts both `/d/a` and `/d/b` down by its
        // reservation, so `/d/b`'s address moves: the cursor must be
        // repointed at the new address, not left stale.
        let mut m = mount(512, 8);
        m.new_file("/other", 0, false).unwrap();
        m.new_file("/d/a", 0, false).unwrap();
        m.new_file("/d/b", 0, false).unwrap();

        let h = m.opendir("/d").unwrap();
        let first = m.readdir(h).unwrap().unwrap();
        assert_eq!(&first.name[..first.name_len], b"a");

        m.unlink("/other").unwrap();

        let second = m.readdir(h).unwrap().unwrap();
        assert_eq!(&second.name[..second.name_len], b"b");
        assert!(m.readdir(h).unwrap().is_none());
        m.closedir(h).unwrap();
    }
}
