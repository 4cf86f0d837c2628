#![forbid(unsafe_code)]
//! FUSE adapter for ext2ro.
//!
//! A thin translation layer: kernel FUSE requests arrive via the `fuser`
//! crate, get forwarded to a [`FsOps`] implementation (from `ext2ro-core`),
//! and errors are mapped through [`Ext2Error::to_errno()`].
//!
//! FUSE numbers the root inode 1 while ext2 uses 2 (inode 1 holds the bad
//! block list). The adapter swaps the two at the boundary in both
//! directions; every other inode number passes through unchanged.
//!
//! The mount is always read-only. Every mutating callback replies `EROFS`
//! without touching the volume.

use ext2ro_core::{FileType as Ext2roFileType, FsOps, InodeAttr, VolumeStats};
use ext2ro_error::Ext2Error;
use ext2ro_types::InodeNumber;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// The image never changes under a read-only mount.
const ATTR_TTL: Duration = Duration::from_secs(60);

/// Root inode as numbered by the FUSE protocol.
const FUSE_ROOT_ID: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
///
/// Captures the operation name, inode, optional offset, and the underlying
/// error, so every error reply is logged the same way.
pub struct FuseErrorContext<'a> {
    pub error: &'a Ext2Error,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // Missing names are routine for lookup.
        if errno == libc::ENOENT {
            trace!(
                target: "ext2ro::fuse",
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                target: "ext2ro::fuse",
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Inode numbering ─────────────────────────────────────────────────────────

/// Map a kernel inode number to the ext2 inode it names.
///
/// Numbers that do not fit in 32 bits map to `u32::MAX`, which no volume
/// can hold, so the request fails as `InvalidInode`.
#[must_use]
pub fn to_ext2_ino(fuse_ino: u64) -> InodeNumber {
    match fuse_ino {
        FUSE_ROOT_ID => InodeNumber::ROOT,
        2 => InodeNumber::BAD_BLOCKS,
        other => InodeNumber(u32::try_from(other).unwrap_or(u32::MAX)),
    }
}

/// Map an ext2 inode number to the number reported to the kernel.
#[must_use]
pub fn to_fuse_ino(ino: InodeNumber) -> u64 {
    match ino {
        InodeNumber::ROOT => FUSE_ROOT_ID,
        InodeNumber::BAD_BLOCKS => 2,
        InodeNumber(other) => u64::from(other),
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

/// Convert an `ext2ro_core::FileType` to `fuser::FileType`.
fn to_fuser_file_type(ft: Ext2roFileType) -> FileType {
    match ft {
        Ext2roFileType::RegularFile => FileType::RegularFile,
        Ext2roFileType::Directory => FileType::Directory,
        Ext2roFileType::Symlink => FileType::Symlink,
        Ext2roFileType::BlockDevice => FileType::BlockDevice,
        Ext2roFileType::CharDevice => FileType::CharDevice,
        Ext2roFileType::Fifo => FileType::NamedPipe,
        Ext2roFileType::Socket => FileType::Socket,
    }
}

/// Convert an `ext2ro_core::InodeAttr` to `fuser::FileAttr`.
///
/// ext2 records no creation time; `crtime` reports the change time.
fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: to_fuse_ino(attr.ino),
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Source name shown in the mount table.
    pub fs_name: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
            fs_name: "ext2ro".to_owned(),
        }
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes to avoid false sharing between hot counters
/// updated on different CPU cores.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .finish()
    }
}

/// Point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// One directory entry ready for `ReplyDirectory::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplyDirEntry {
    ino: u64,
    offset: i64,
    kind: FileType,
    name: Vec<u8>,
}

/// FUSE adapter that delegates all operations to a [`FsOps`] implementation.
///
/// Stateless apart from the request counters: file handles are always 0
/// and every request goes straight to `FsOps`.
pub struct Ext2Fuse {
    ops: Arc<dyn FsOps>,
    metrics: Arc<AtomicMetrics>,
}

// Compile-time assertion: Ext2Fuse must be Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Ext2Fuse>;
};

impl std::fmt::Debug for Ext2Fuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fuse")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Ext2Fuse {
    /// Create a new FUSE adapter wrapping the given `FsOps` implementation.
    #[must_use]
    pub fn new(ops: Box<dyn FsOps>) -> Self {
        Self {
            ops: Arc::from(ops),
            metrics: Arc::new(AtomicMetrics::new()),
        }
    }

    /// Request counters for this adapter.
    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.metrics
    }

    /// Run one request against `FsOps` and count its outcome.
    fn dispatch<T>(
        &self,
        f: impl FnOnce(&dyn FsOps) -> ext2ro_error::Result<T>,
    ) -> ext2ro_error::Result<T> {
        let result = f(self.ops.as_ref());
        match &result {
            Ok(_) => self.metrics.record_ok(),
            Err(_) => self.metrics.record_err(),
        }
        result
    }

    fn attr(&self, ino: u64) -> ext2ro_error::Result<FileAttr> {
        self.dispatch(|ops| ops.getattr(to_ext2_ino(ino)))
            .map(|attr| to_file_attr(&attr))
    }

    fn entry(&self, parent: u64, name: &OsStr) -> ext2ro_error::Result<FileAttr> {
        self.dispatch(|ops| ops.lookup(to_ext2_ino(parent), name))
            .map(|attr| to_file_attr(&attr))
    }

    fn data(&self, ino: u64, offset: u64, size: u32) -> ext2ro_error::Result<Vec<u8>> {
        let data = self.dispatch(|ops| ops.read(to_ext2_ino(ino), offset, size))?;
        self.metrics
            .record_bytes_read(u64::try_from(data.len()).unwrap_or(u64::MAX));
        Ok(data)
    }

    fn dir_entries(&self, ino: u64, offset: u64) -> ext2ro_error::Result<Vec<ReplyDirEntry>> {
        let entries = self.dispatch(|ops| ops.readdir(to_ext2_ino(ino), offset))?;
        Ok(entries
            .into_iter()
            .map(|entry| ReplyDirEntry {
                ino: to_fuse_ino(entry.ino),
                offset: i64::try_from(entry.offset).unwrap_or(i64::MAX),
                kind: to_fuser_file_type(entry.kind),
                name: entry.name,
            })
            .collect())
    }

    fn link_target(&self, ino: u64) -> ext2ro_error::Result<Vec<u8>> {
        self.dispatch(|ops| ops.readlink(to_ext2_ino(ino)))
    }

    fn open_file(&self, ino: u64, flags: i32) -> ext2ro_error::Result<()> {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        self.dispatch(|ops| ops.open(to_ext2_ino(ino), write))
    }

    fn open_dir(&self, ino: u64) -> ext2ro_error::Result<()> {
        self.dispatch(|ops| ops.opendir(to_ext2_ino(ino)))
    }

    fn stats(&self) -> ext2ro_error::Result<VolumeStats> {
        self.dispatch(|ops| ops.statfs())
    }

    fn reply_read_only(&self, operation: &'static str, ino: u64) -> c_int {
        self.metrics.record_err();
        FuseErrorContext {
            error: &Ext2Error::ReadOnly,
            operation,
            ino,
            offset: None,
        }
        .log_and_errno()
    }
}

impl Filesystem for Ext2Fuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!(target: "ext2ro::fuse", "FUSE session initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        let s = self.metrics.snapshot();
        debug!(
            target: "ext2ro::fuse",
            requests_total = s.requests_total,
            requests_err = s.requests_err,
            "FUSE session destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.entry(parent, name) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.link_target(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readlink",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_file(ino, flags) {
            // Stateless open: no file handles are tracked.
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.data(ino, byte_offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_dir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "opendir",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let cookie = u64::try_from(offset).unwrap_or(0);
        match self.dir_entries(ino, cookie) {
            Ok(entries) => {
                for entry in &entries {
                    #[cfg(unix)]
                    let name = OsStr::from_bytes(&entry.name);
                    #[cfg(not(unix))]
                    let owned_name = String::from_utf8_lossy(&entry.name).into_owned();
                    #[cfg(not(unix))]
                    let name = OsStr::new(&owned_name);

                    if reply.add(entry.ino, entry.offset, entry.kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(cookie),
                }
                .log_and_errno(),
            ),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.stats() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_available,
                s.files,
                s.files_free,
                s.block_size,
                s.name_max,
                s.block_size,
            ),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "statfs",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    // ── Mutations: always EROFS ──────────────────────────────────────────

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(self.reply_read_only("setattr", ino));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.reply_read_only("mknod", parent));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.reply_read_only("mkdir", parent));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.reply_read_only("unlink", parent));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.reply_read_only("rmdir", parent));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.reply_read_only("symlink", parent));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.reply_read_only("rename", parent));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.reply_read_only("link", ino));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(self.reply_read_only("write", ino));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(self.reply_read_only("create", parent));
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Build a list of `fuser::MountOption` from our `MountOptions`.
fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName(options.fs_name.clone()),
        MountOption::Subtype("ext2ro".to_owned()),
        MountOption::RO,
        MountOption::NoAtime,
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Mount `ops` read-only at `mountpoint` and serve requests.
///
/// Blocks until the filesystem is unmounted, then returns the request
/// counters gathered during the session.
pub fn mount(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<MetricsSnapshot, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = Ext2Fuse::new(ops);
    let metrics = Arc::clone(&fs.metrics);

    info!(
        target: "ext2ro::fuse",
        mountpoint = %mountpoint.display(),
        allow_other = options.allow_other,
        auto_unmount = options.auto_unmount,
        "mounting read-only"
    );
    fuser::mount2(fs, mountpoint, &fuse_opts)?;

    let s = metrics.snapshot();
    info!(
        target: "ext2ro::fuse",
        mountpoint = %mountpoint.display(),
        requests_total = s.requests_total,
        requests_ok = s.requests_ok,
        requests_err = s.requests_err,
        bytes_read = s.bytes_read,
        "unmounted"
    );
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext2ro_core::{DirEntry, OpenOptions, Volume};
    use ext2ro_harness::{Geometry, ImageBuilder};

    /// Minimal FsOps stub for tests that don't need a volume.
    struct StubFs;
    impl FsOps for StubFs {
        fn getattr(&self, _ino: InodeNumber) -> ext2ro_error::Result<InodeAttr> {
            Err(Ext2Error::NotFound("stub".into()))
        }
        fn lookup(&self, _parent: InodeNumber, _name: &OsStr) -> ext2ro_error::Result<InodeAttr> {
            Err(Ext2Error::NotFound("stub".into()))
        }
        fn readdir(&self, _ino: InodeNumber, _offset: u64) -> ext2ro_error::Result<Vec<DirEntry>> {
            Ok(vec![])
        }
        fn read(&self, _ino: InodeNumber, _offset: u64, _size: u32) -> ext2ro_error::Result<Vec<u8>> {
            Ok(vec![])
        }
        fn readlink(&self, _ino: InodeNumber) -> ext2ro_error::Result<Vec<u8>> {
            Err(Ext2Error::NotSymlink)
        }
        fn open(&self, _ino: InodeNumber, _write: bool) -> ext2ro_error::Result<()> {
            Ok(())
        }
        fn opendir(&self, _ino: InodeNumber) -> ext2ro_error::Result<()> {
            Ok(())
        }
        fn statfs(&self) -> ext2ro_error::Result<VolumeStats> {
            Err(Ext2Error::Io(std::io::Error::other("stub")))
        }
    }

    struct Mounted {
        fuse: Ext2Fuse,
        readme: u64,
        docs: u64,
        link: u64,
    }

    fn mounted_volume() -> Mounted {
        let mut builder = ImageBuilder::new(Geometry::new(1024));
        let readme = builder.add_file(InodeNumber::ROOT, "README", b"read me first\n");
        let docs = builder.add_dir(InodeNumber::ROOT, "docs");
        let link = builder.add_symlink(InodeNumber::ROOT, "guide", b"docs/README");
        let vol = Volume::from_device(
            Box::new(builder.build().into_device()),
            &OpenOptions::default(),
        )
        .expect("open");
        Mounted {
            fuse: Ext2Fuse::new(Box::new(vol)),
            readme: u64::from(readme.0),
            docs: u64::from(docs.0),
            link: u64::from(link.0),
        }
    }

    #[test]
    fn root_numbers_swap_both_ways() {
        assert_eq!(to_ext2_ino(1), InodeNumber::ROOT);
        assert_eq!(to_ext2_ino(2), InodeNumber::BAD_BLOCKS);
        assert_eq!(to_ext2_ino(12), InodeNumber(12));
        assert_eq!(to_ext2_ino(u64::MAX), InodeNumber(u32::MAX));
        assert_eq!(to_fuse_ino(InodeNumber::ROOT), 1);
        assert_eq!(to_fuse_ino(InodeNumber::BAD_BLOCKS), 2);
        assert_eq!(to_fuse_ino(InodeNumber(4242)), 4242);
        for ino in [1_u64, 2, 3, 11, 70_000] {
            assert_eq!(to_fuse_ino(to_ext2_ino(ino)), ino);
        }
    }

    #[test]
    fn file_type_conversion() {
        let cases = [
            (Ext2roFileType::RegularFile, FileType::RegularFile),
            (Ext2roFileType::Directory, FileType::Directory),
            (Ext2roFileType::Symlink, FileType::Symlink),
            (Ext2roFileType::BlockDevice, FileType::BlockDevice),
            (Ext2roFileType::CharDevice, FileType::CharDevice),
            (Ext2roFileType::Fifo, FileType::NamedPipe),
            (Ext2roFileType::Socket, FileType::Socket),
        ];
        for (ours, expected) in &cases {
            assert_eq!(to_fuser_file_type(*ours), *expected);
        }
    }

    #[test]
    fn inode_attr_to_file_attr_conversion() {
        let ctime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let iattr = InodeAttr {
            ino: InodeNumber::ROOT,
            size: 1024,
            blocks: 2,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime,
            kind: Ext2roFileType::Directory,
            perm: 0o755,
            nlink: 3,
            uid: 1000,
            gid: 100,
            rdev: 0,
            blksize: 1024,
        };
        let fattr = to_file_attr(&iattr);
        assert_eq!(fattr.ino, 1);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.blocks, 2);
        assert_eq!(fattr.kind, FileType::Directory);
        assert_eq!(fattr.perm, 0o755);
        assert_eq!(fattr.nlink, 3);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.gid, 100);
        assert_eq!(fattr.crtime, ctime);
        assert_eq!(fattr.blksize, 1024);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn mount_options_are_always_read_only() {
        let opts = MountOptions::default();
        assert!(!opts.allow_other);
        assert!(opts.auto_unmount);
        let mount_opts = build_mount_options(&opts);
        assert!(mount_opts.contains(&MountOption::RO));
        assert!(mount_opts.contains(&MountOption::NoAtime));
        assert!(mount_opts.contains(&MountOption::DefaultPermissions));
        assert!(mount_opts.contains(&MountOption::AutoUnmount));
        assert!(mount_opts.contains(&MountOption::FSName("ext2ro".to_owned())));
        assert!(!mount_opts.contains(&MountOption::AllowOther));

        let custom = MountOptions {
            allow_other: true,
            auto_unmount: false,
            fs_name: "/images/disk.img".to_owned(),
        };
        let mount_opts = build_mount_options(&custom);
        assert!(mount_opts.contains(&MountOption::RO));
        assert!(mount_opts.contains(&MountOption::AllowOther));
        assert!(!mount_opts.contains(&MountOption::AutoUnmount));
        assert!(mount_opts.contains(&MountOption::FSName("/images/disk.img".to_owned())));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(Box::new(StubFs), "", &MountOptions::default()).unwrap_err();
        assert!(matches!(err, FuseError::InvalidMountpoint(_)));
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn fuse_error_context_returns_correct_errno() {
        let cases: Vec<(Ext2Error, c_int)> = vec![
            (Ext2Error::NotFound("test".into()), libc::ENOENT),
            (Ext2Error::InvalidInode(99_999), libc::ENOENT),
            (Ext2Error::NotDirectory, libc::ENOTDIR),
            (Ext2Error::IsDirectory, libc::EISDIR),
            (Ext2Error::NotSymlink, libc::EINVAL),
            (Ext2Error::PermissionDenied, libc::EACCES),
            (Ext2Error::ReadOnly, libc::EROFS),
            (Ext2Error::NameTooLong, libc::ENAMETOOLONG),
            (Ext2Error::OutOfRange { logical_block: 1 << 40 }, libc::EFBIG),
            (
                Ext2Error::Corruption {
                    block: 7,
                    detail: "pointer past end".into(),
                },
                libc::EIO,
            ),
            (Ext2Error::Format("bad".into()), libc::EINVAL),
        ];
        for (error, expected) in &cases {
            let ctx = FuseErrorContext {
                error,
                operation: "test_op",
                ino: 42,
                offset: Some(4096),
            };
            assert_eq!(ctx.log_and_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn atomic_metrics_record_ok_and_err() {
        let m = AtomicMetrics::new();
        assert_eq!(m.snapshot().requests_total, 0);
        m.record_ok();
        m.record_ok();
        m.record_err();
        m.record_bytes_read(1024);
        let s = m.snapshot();
        assert_eq!(s.requests_total, 3);
        assert_eq!(s.requests_ok, 2);
        assert_eq!(s.requests_err, 1);
        assert_eq!(s.bytes_read, 1024);
    }

    #[test]
    fn cache_line_padded_alignment() {
        assert_eq!(std::mem::align_of::<CacheLinePadded<AtomicU64>>(), 64);
    }

    #[test]
    fn root_is_served_as_inode_one() {
        let m = mounted_volume();
        let root = m.fuse.attr(FUSE_ROOT_ID).expect("root attr");
        assert_eq!(root.ino, 1);
        assert_eq!(root.kind, FileType::Directory);

        let entries = m.fuse.dir_entries(FUSE_ROOT_ID, 0).expect("readdir");
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![&b"."[..], b"..", b"README", b"docs", b"guide"]);
        assert_eq!(entries[0].ino, 1);
        assert_eq!(entries[1].ino, 1);
        assert_eq!(entries[3].ino, m.docs);
        assert_eq!(entries[3].kind, FileType::Directory);

        let cookie = u64::try_from(entries[2].offset).expect("cookie");
        let tail = m.fuse.dir_entries(FUSE_ROOT_ID, cookie).expect("resume");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].name, b"docs");

        let dotdot = m.fuse.entry(m.docs, OsStr::new("..")).expect("dotdot");
        assert_eq!(dotdot.ino, 1);
    }

    #[test]
    fn reads_count_bytes_and_requests() {
        let m = mounted_volume();
        let attr = m.fuse.entry(FUSE_ROOT_ID, OsStr::new("README")).expect("lookup");
        assert_eq!(attr.ino, m.readme);
        assert_eq!(attr.kind, FileType::RegularFile);

        m.fuse.open_file(m.readme, libc::O_RDONLY).expect("open");
        let data = m.fuse.data(m.readme, 5, 100).expect("read");
        assert_eq!(data, b"me first\n");
        assert_eq!(m.fuse.link_target(m.link).expect("readlink"), b"docs/README");

        let err = m.fuse.entry(FUSE_ROOT_ID, OsStr::new("absent")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);

        let s = m.fuse.metrics().snapshot();
        assert_eq!(s.requests_total, 5);
        assert_eq!(s.requests_ok, 4);
        assert_eq!(s.requests_err, 1);
        assert_eq!(s.bytes_read, 9);
    }

    #[test]
    fn open_rejects_writes_and_directories() {
        let m = mounted_volume();
        for flags in [libc::O_WRONLY, libc::O_RDWR] {
            let err = m.fuse.open_file(m.readme, flags).unwrap_err();
            assert_eq!(err.to_errno(), libc::EACCES);
        }
        assert_eq!(
            m.fuse.open_file(m.docs, libc::O_RDONLY).unwrap_err().to_errno(),
            libc::EISDIR
        );
        m.fuse.open_dir(m.docs).expect("opendir");
        assert_eq!(
            m.fuse.open_dir(m.readme).unwrap_err().to_errno(),
            libc::ENOTDIR
        );
        assert_eq!(m.fuse.attr(999_999).unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn mutations_reply_erofs_and_count_as_errors() {
        let m = mounted_volume();
        assert_eq!(m.fuse.reply_read_only("write", m.readme), libc::EROFS);
        assert_eq!(m.fuse.reply_read_only("mkdir", FUSE_ROOT_ID), libc::EROFS);
        let s = m.fuse.metrics().snapshot();
        assert_eq!(s.requests_err, 2);
        assert_eq!(s.requests_ok, 0);
    }

    #[test]
    fn statfs_passes_through_volume_counters() {
        let m = mounted_volume();
        let s = m.fuse.stats().expect("statfs");
        assert_eq!(s.block_size, 1024);
        assert_eq!(s.name_max, 255);
        assert!(s.blocks_free <= s.blocks);

        let stub = Ext2Fuse::new(Box::new(StubFs));
        assert_eq!(stub.stats().unwrap_err().to_errno(), libc::EIO);
        assert_eq!(stub.metrics().snapshot().requests_err, 1);
    }
}
