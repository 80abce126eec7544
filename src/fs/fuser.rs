//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`objfs::fs::ObjFs`].
//!
//! fuser callbacks are synchronous; each one resolves the inode to a path,
//! blocks on the async core via a runtime handle, and converts the outcome
//! to a reply or an errno.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, instrument};

use objfs::error::{StoreError, StoreResult};
use objfs::fd::OpenHandle;
use objfs::fs::{DirEntry, ObjFs};
use objfs::meta::FileStat;
use objfs::store::ObjectStore;

use super::inode_table::{InodeTable, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// Directory-entry inode shown for children the kernel has not looked up;
/// readdir inode numbers are advisory.
const UNKNOWN_INO: u64 = u64::MAX;

/// Trait abstracting the `.error(errno)` method common to fuser replies.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    ReplyEntry,
    ReplyAttr,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyOpen,
    ReplyWrite,
    ReplyCreate,
);

/// Centralizes error logging and errno replies so each callback only has
/// to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for StoreResult<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(value) => on_ok(value, reply),
            Err(e) => {
                debug!(error = %e, "replying errno");
                reply.error(e.errno());
            }
        }
    }
}

fn to_fuser_attr(ino: u64, stat: &FileStat) -> fuser::FileAttr {
    let kind = match stat.mode & libc::S_IFMT {
        libc::S_IFDIR => fuser::FileType::Directory,
        libc::S_IFLNK => fuser::FileType::Symlink,
        _ => fuser::FileType::RegularFile,
    };
    fuser::FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind,
        perm: (stat.mode & 0o7777) as u16,
        nlink: 1,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn name_str(name: &OsStr) -> StoreResult<&str> {
    name.to_str()
        .ok_or_else(|| StoreError::ClientFatal("non-UTF-8 file name".into()))
}

/// Snapshot of a directory listing, fixed at the first `readdir` call on a
/// handle so offsets stay stable across calls.
enum DirSnapshot {
    Pending,
    Ready(Vec<DirEntry>),
}

/// Bridges the async [`ObjFs`] core to the synchronous fuser callbacks.
pub struct FuseAdapter<S: ObjectStore> {
    fs: Arc<ObjFs<S>>,
    inodes: Arc<InodeTable>,
    open_files: HashMap<u64, OpenHandle>,
    dir_handles: HashMap<u64, DirSnapshot>,
    next_fh: u64,
    runtime: tokio::runtime::Handle,
}

impl<S: ObjectStore> FuseAdapter<S> {
    pub fn new(fs: Arc<ObjFs<S>>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            inodes: Arc::new(InodeTable::new()),
            open_files: HashMap::new(),
            dir_handles: HashMap::new(),
            next_fh: 1,
            runtime,
        }
    }

    fn path_of(&self, ino: u64) -> StoreResult<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| StoreError::LocalIo(std::io::Error::from_raw_os_error(libc::ENOENT)))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> StoreResult<String> {
        let name = name_str(name)?;
        self.inodes
            .child_path(parent, name)
            .ok_or_else(|| StoreError::LocalIo(std::io::Error::from_raw_os_error(libc::ENOENT)))
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn handle_of(&self, fh: u64) -> StoreResult<OpenHandle> {
        self.open_files
            .get(&fh)
            .cloned()
            .ok_or_else(|| StoreError::LocalIo(std::io::Error::from_raw_os_error(libc::EBADF)))
    }
}

impl<S: ObjectStore> fuser::Filesystem for FuseAdapter<S> {
    #[instrument(name = "fuse::lookup", skip(self, _req, reply))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.child_of(parent, name).map(|path| {
            let stat = self.runtime.block_on(self.fs.getattr(&path));
            (path, stat)
        });
        match result {
            Ok((path, Ok(stat))) => {
                let ino = self.inodes.assign(&path);
                reply.entry(&TTL, &to_fuser_attr(ino, &stat), 0);
            }
            Ok((_, Err(e))) => reply.error(e.errno()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "fuse::getattr", skip(self, _req, _fh, reply))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = match self.path_of(ino) {
            Ok(path) => self.runtime.block_on(self.fs.getattr(&path)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |stat, reply| {
            reply.attr(&TTL, &to_fuser_attr(ino, &stat));
        });
    }

    #[expect(clippy::too_many_arguments, reason = "fuser dictates the signature")]
    #[instrument(
        name = "fuse::setattr",
        skip(self, _req, atime, mtime, _ctime, _fh, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = match self.path_of(ino) {
            Ok(path) => self.runtime.block_on(async {
                if let Some(size) = size {
                    self.fs.truncate(&path, size).await?;
                }
                if let Some(mode) = mode {
                    self.fs.chmod(&path, mode).await?;
                }
                if uid.is_some() || gid.is_some() {
                    self.fs.chown(&path, uid, gid).await?;
                }
                if atime.is_some() || mtime.is_some() {
                    self.fs
                        .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))
                        .await?;
                }
                self.fs.getattr(&path).await
            }),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |stat, reply| {
            reply.attr(&TTL, &to_fuser_attr(ino, &stat));
        });
    }

    #[instrument(name = "fuse::mkdir", skip(self, req, reply))]
    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = match self.child_of(parent, name) {
            Ok(path) => self
                .runtime
                .block_on(async {
                    self.fs.mkdir(&path, mode & 0o7777, uid, gid).await?;
                    self.fs.getattr(&path).await
                })
                .map(|stat| (path, stat)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(path, stat), reply| {
            let ino = self.inodes.assign(&path);
            reply.entry(&TTL, &to_fuser_attr(ino, &stat), 0);
        });
    }

    #[instrument(name = "fuse::rmdir", skip(self, _req, reply))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = match self.child_of(parent, name) {
            Ok(path) => self.runtime.block_on(self.fs.rmdir(&path)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "fuse::unlink", skip(self, _req, reply))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = match self.child_of(parent, name) {
            Ok(path) => self.runtime.block_on(self.fs.unlink(&path)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "fuse::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = match (self.child_of(parent, name), self.child_of(newparent, newname)) {
            (Ok(from), Ok(to)) => self
                .runtime
                .block_on(self.fs.rename(&from, &to))
                .map(|()| (from, to)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        result.fuse_reply(reply, |(from, to), reply| {
            self.inodes.rename(&from, &to);
            reply.ok();
        });
    }

    #[instrument(name = "fuse::symlink", skip(self, req, reply))]
    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = match (self.child_of(parent, link_name), target.to_str()) {
            (Ok(path), Some(target)) => self
                .runtime
                .block_on(async {
                    self.fs.symlink(target, &path, uid, gid).await?;
                    self.fs.getattr(&path).await
                })
                .map(|stat| (path, stat)),
            (Err(e), _) => Err(e),
            (_, None) => Err(StoreError::ClientFatal("non-UTF-8 link target".into())),
        };
        result.fuse_reply(reply, |(path, stat), reply| {
            let ino = self.inodes.assign(&path);
            reply.entry(&TTL, &to_fuser_attr(ino, &stat), 0);
        });
    }

    #[instrument(name = "fuse::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = match self.path_of(ino) {
            Ok(path) => self.runtime.block_on(self.fs.readlink(&path)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |target, reply| reply.data(target.as_bytes()));
    }

    #[instrument(name = "fuse::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let truncate = flags & libc::O_TRUNC != 0;
        let result = match self.path_of(ino) {
            Ok(path) => self.runtime.block_on(self.fs.open(&path, truncate)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |handle, reply| {
            let fh = self.alloc_fh();
            self.open_files.insert(fh, handle);
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "fuse::create", skip(self, req, reply))]
    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        let result = match self.child_of(parent, name) {
            Ok(path) => self
                .runtime
                .block_on(async {
                    let handle = self.fs.create(&path, mode & 0o7777, uid, gid).await?;
                    let stat = self.fs.getattr(&path).await?;
                    Ok((handle, stat))
                })
                .map(|ok| (path, ok)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(path, (handle, stat)), reply| {
            let ino = self.inodes.assign(&path);
            let fh = self.alloc_fh();
            self.open_files.insert(fh, handle);
            reply.created(&TTL, &to_fuser_attr(ino, &stat), 0, fh, 0);
        });
    }

    #[expect(clippy::too_many_arguments, reason = "fuser dictates the signature")]
    #[instrument(name = "fuse::read", skip(self, _req, _flags, _lock_owner, reply))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = match self.handle_of(fh) {
            Ok(handle) => self
                .runtime
                .block_on(self.fs.read(&handle, offset.cast_unsigned(), size)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |data, reply| reply.data(&data));
    }

    #[expect(clippy::too_many_arguments, reason = "fuser dictates the signature")]
    #[instrument(
        name = "fuse::write",
        skip(self, _req, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = match self.handle_of(fh) {
            Ok(handle) => self
                .runtime
                .block_on(self.fs.write(&handle, offset.cast_unsigned(), data)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |written, reply| {
            reply.written(u32::try_from(written).unwrap_or(u32::MAX));
        });
    }

    #[instrument(name = "fuse::flush", skip(self, _req, reply))]
    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let result = match self.handle_of(fh) {
            Ok(handle) => self.runtime.block_on(self.fs.flush(&handle)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "fuse::fsync", skip(self, _req, reply))]
    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result = match self.handle_of(fh) {
            Ok(handle) => self.runtime.block_on(self.fs.fsync(&handle)),
            Err(e) => Err(e),
        };
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "fuse::release", skip(self, _req, reply))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = match self.open_files.remove(&fh) {
            Some(handle) => self.runtime.block_on(self.fs.release(&handle)),
            None => Ok(()),
        };
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "fuse::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        let fh = self.alloc_fh();
        self.dir_handles.insert(fh, DirSnapshot::Pending);
        reply.opened(fh, 0);
    }

    #[instrument(name = "fuse::readdir", skip(self, _req, reply))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // Materialize the listing once per handle.
        if matches!(self.dir_handles.get(&fh), Some(DirSnapshot::Pending) | None) {
            let listed = match self.path_of(ino) {
                Ok(path) => self.runtime.block_on(self.fs.readdir(&path)),
                Err(e) => Err(e),
            };
            match listed {
                Ok(entries) => {
                    self.dir_handles.insert(fh, DirSnapshot::Ready(entries));
                }
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            }
        }
        let Some(DirSnapshot::Ready(entries)) = self.dir_handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        // Offsets 0 and 1 are "." and "..".
        let mut cursor = offset.cast_unsigned();
        if cursor == 0 {
            if reply.add(ino, 1, fuser::FileType::Directory, ".") {
                reply.ok();
                return;
            }
            cursor = 1;
        }
        if cursor == 1 {
            let parent_ino = if ino == ROOT_INO { ROOT_INO } else { UNKNOWN_INO };
            if reply.add(parent_ino, 2, fuser::FileType::Directory, "..") {
                reply.ok();
                return;
            }
            cursor = 2;
        }

        for (i, entry) in entries.iter().enumerate().skip((cursor - 2) as usize) {
            let kind = match entry.stat {
                Some(stat) if stat.is_symlink() => fuser::FileType::Symlink,
                _ if entry.is_dir => fuser::FileType::Directory,
                _ => fuser::FileType::RegularFile,
            };
            let next_offset = (i + 3) as i64;
            if reply.add(UNKNOWN_INO, next_offset, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    #[instrument(name = "fuse::releasedir", skip(self, _req, _flags, reply))]
    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // An object store has no meaningful capacity; report plenty.
        let huge = u64::MAX / u64::from(BLOCK_SIZE) / 2;
        reply.statfs(
            huge,
            huge,
            huge,
            self.inodes.len() as u64,
            u64::MAX / 2,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}
