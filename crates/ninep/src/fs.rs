//! High-level server side: the [`FileSystem`] interface and the message
//! handler that maps 9P requests onto it.
//!
//! Implementing a 9P server from raw messages means tracking fids, qids and
//! open files by hand. [`FsHandler`] does that bookkeeping once: it keeps
//! the per-session tables and turns each request into a call on a
//! [`FileSystem`], so implementations only deal in paths, [`DirEntry`]s and
//! [`File`]s.

use crate::fcall::*;
use crate::res;
use crate::serialize::Encodable;
use crate::srv::MessageHandler;
use crate::utils::{self, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// An abstract file hierarchy served over 9P.
///
/// All paths passed to the methods of this trait are absolute, use slashes,
/// and have been lexically cleaned. Methods with default implementations
/// report the operation as unsupported, so a read-only hierarchy only needs
/// [`stat`](FileSystem::stat) and [`open`](FileSystem::open).
///
/// Errors returned from these methods travel to the client as `Rerror`
/// messages carrying the error's display string.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Describe the file at `path`. Besides serving `Tstat`, this is how
    /// the handler learns a file's type when it assigns qids, so it must be
    /// cheap and must fail for paths that do not exist.
    async fn stat(&self, path: &str) -> Result<DirEntry>;

    /// Apply a wstat change set to the file at `path`.
    async fn write_stat(&self, _path: &str, _changes: &StatChanges) -> Result<()> {
        res!("wstat not supported")
    }

    /// Produce an auth file for `uname` to establish credentials on. The
    /// default refuses, which makes `Tauth` fail with a recognizable error.
    async fn auth(&self, _uname: &str, _aname: &str) -> Result<Arc<dyn File>> {
        res!("auth not supported")
    }

    /// Decide whether `uname` may attach to the tree named by `aname`.
    /// `afile` is the auth file established by a preceding `Tauth`, if any.
    /// The default accepts everyone.
    async fn attach(&self, _afile: Option<Arc<dyn File>>, _uname: &str, _aname: &str) -> Result<()> {
        Ok(())
    }

    /// Open the file at `path` in the given mode.
    async fn open(&self, path: &str, mode: u8) -> Result<Arc<dyn File>>;

    /// Create and open the file at `path`. `perm` carries the permission
    /// bits and, via [`FileMode::DIR`], whether a directory is wanted;
    /// interpreting it is entirely up to the implementation.
    async fn create(&self, _path: &str, _perm: FileMode, _mode: u8) -> Result<Arc<dyn File>> {
        res!("create not supported")
    }

    /// Remove the file at `path`.
    async fn remove(&self, _path: &str) -> Result<()> {
        res!("remove not supported")
    }

    /// The I/O size hint advertised in `Ropen`/`Rcreate`. Zero means "no
    /// hint".
    fn iounit(&self) -> u32 {
        0
    }
}

/// An open file being dealt with by a [`FileSystem`].
///
/// Reads and writes are byte-positioned; the handler never assumes a
/// current-offset cursor. Only the restrictions of the 9P protocol apply:
/// in particular a read past the end of the file is a zero count, not an
/// error.
#[async_trait]
pub trait File: Send + Sync {
    /// Read into `buf` starting at `offset`, returning the number of bytes
    /// read. A short (or zero) count signals end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write_at(&self, _data: &[u8], _offset: u64) -> Result<usize> {
        res!("write not supported")
    }

    /// Release the file. Called on clunk, remove, and connection teardown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// List the entries of this file when it is a directory.
    async fn readdir(&self) -> Result<Vec<DirEntry>> {
        res!("not a directory")
    }
}

#[derive(Default)]
struct QidTable {
    qids: HashMap<String, Qid>,
    next_path: u64,
}

impl QidTable {
    /// Look up the cached qid for a key, assigning a fresh path number on
    /// first sight.
    fn assign(&mut self, key: &str, typ: QidType) -> Qid {
        if let Some(qid) = self.qids.get(key) {
            return *qid;
        }

        let qid = Qid {
            typ,
            version: 0,
            path: self.next_path,
        };
        self.next_path += 1;
        self.qids.insert(key.to_owned(), qid);
        qid
    }
}

/// A [`MessageHandler`] that provides a virtual filesystem using the
/// provided [`FileSystem`] implementation.
///
/// One handler serves one connection; all of its tables are per-session.
/// Requests may be dispatched concurrently once the version handshake is
/// done, so every table sits behind its own lock.
pub struct FsHandler<Fs> {
    fs: Arc<Fs>,

    /// Advertised until negotiation, the agreed value afterwards.
    msize: AtomicU32,
    negotiated: AtomicBool,

    /// fid → walked path.
    fids: RwLock<HashMap<u32, String>>,
    /// fid → open file.
    files: RwLock<HashMap<u32, Arc<dyn File>>>,
    /// fid → directory read cursor.
    dirs: Mutex<HashMap<u32, Cursor<Vec<u8>>>>,
    /// path → qid identity, shared by every fid in the session.
    qids: Mutex<QidTable>,
}

impl<Fs: FileSystem> FsHandler<Fs> {
    /// Create a handler for one connection. `msize` is the largest message
    /// the server is willing to speak; the handshake may settle on less.
    pub fn new(fs: Arc<Fs>, msize: u32) -> FsHandler<Fs> {
        FsHandler {
            fs,
            msize: AtomicU32::new(msize),
            negotiated: AtomicBool::new(false),
            fids: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            qids: Mutex::new(QidTable::default()),
        }
    }

    async fn path_of(&self, fid: u32) -> Result<String> {
        match self.fids.read().await.get(&fid) {
            Some(path) => Ok(path.clone()),
            None => res!(format!("unknown fid: {}", fid)),
        }
    }

    async fn file_of(&self, fid: u32) -> Result<Arc<dyn File>> {
        match self.files.read().await.get(&fid) {
            Some(file) => Ok(file.clone()),
            None => res!("file not open"),
        }
    }

    /// Look up or assign the qid for a path. The type comes from the
    /// filesystem's stat, so a missing path fails here.
    async fn qid(&self, path: &str) -> Result<Qid> {
        if let Some(qid) = self.qids.lock().await.qids.get(path) {
            return Ok(*qid);
        }

        let typ = self.fs.stat(path).await?.mode.qid_type();
        Ok(self.qids.lock().await.assign(path, typ))
    }

    /// The per-message payload cap: everything but the read/write header.
    fn max_count(&self) -> usize {
        self.msize.load(Ordering::SeqCst).saturating_sub(IOHDRSZ) as usize
    }

    async fn version(&self, client_msize: u32, version: &str) -> Result<Fcall> {
        if version != P92000 {
            return Ok(Fcall::RVersion {
                msize: client_msize,
                version: VERSION_UNKNOWN.to_owned(),
            });
        }

        if self.negotiated.swap(true, Ordering::SeqCst) {
            return res!("version already negotiated");
        }

        let msize = u32::min(self.msize.load(Ordering::SeqCst), client_msize);
        self.msize.store(msize, Ordering::SeqCst);

        Ok(Fcall::RVersion {
            msize,
            version: P92000.to_owned(),
        })
    }

    async fn auth(&self, afid: u32, uname: &str, aname: &str) -> Result<Fcall> {
        let aname = utils::clean_aname(aname);

        let afile = self.fs.auth(uname, &aname).await?;
        self.files.write().await.insert(afid, afile);

        // The auth file is not part of the tree; its identity is keyed on
        // the user it authenticates.
        let aqid = self.qids.lock().await.assign(uname, QidType::AUTH);
        Ok(Fcall::RAuth { aqid })
    }

    async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Fcall> {
        let aname = utils::clean_aname(aname);

        let afile = match afid {
            NOFID => None,
            afid => Some(self.file_of(afid).await?),
        };
        self.fs.attach(afile, uname, &aname).await?;

        let qid = self.qid(&aname).await?;
        self.fids.write().await.insert(fid, aname);

        Ok(Fcall::RAttach { qid })
    }

    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> Result<Fcall> {
        let mut path = self.path_of(fid).await?;

        let mut wqids = Vec::with_capacity(wnames.len());
        for (i, name) in wnames.iter().enumerate() {
            let next = utils::join(&path, name);

            match self.qid(&next).await {
                Ok(qid) => {
                    wqids.push(qid);
                    path = next;
                }
                // The zeroth step failing is an error; a later step failing
                // reports the partial walk, and the new fid stays
                // uninstalled either way.
                Err(err) if i == 0 => return Err(err),
                Err(_) => return Ok(Fcall::RWalk { wqids }),
            }
        }

        self.fids.write().await.insert(newfid, path);
        Ok(Fcall::RWalk { wqids })
    }

    async fn open(&self, fid: u32, mode: u8) -> Result<Fcall> {
        if self.files.read().await.contains_key(&fid) {
            return res!("file already open");
        }

        let path = self.path_of(fid).await?;
        let file = self.fs.open(&path, mode).await?;
        let qid = self.qid(&path).await?;

        self.files.write().await.insert(fid, file);
        Ok(Fcall::ROpen {
            qid,
            iounit: self.fs.iounit(),
        })
    }

    async fn create(&self, fid: u32, name: &str, perm: FileMode, mode: u8) -> Result<Fcall> {
        if self.files.read().await.contains_key(&fid) {
            return res!("file already open");
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return res!(format!("create: invalid name: {:?}", name));
        }

        let parent = self.path_of(fid).await?;
        let path = utils::join(&parent, name);

        let file = self.fs.create(&path, perm, mode).await?;
        let qid = self.qid(&path).await?;

        // The fid now names the created file, open.
        self.fids.write().await.insert(fid, path);
        self.files.write().await.insert(fid, file);

        Ok(Fcall::RCreate {
            qid,
            iounit: self.fs.iounit(),
        })
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Fcall> {
        let file = self.file_of(fid).await?;
        let count = usize::min(count as usize, self.max_count());

        // A fid without a walked path (an auth file) is never a directory.
        if let Ok(path) = self.path_of(fid).await {
            if self.qid(&path).await?.typ.contains(QidType::DIR) {
                return self.read_dir(fid, &path, file, offset, count).await;
            }
        }

        let mut buf = vec![0u8; count];
        let n = file.read_at(&mut buf, offset).await?;
        buf.truncate(n);

        Ok(Fcall::RRead { data: Data(buf) })
    }

    /// Directory reads consume a per-fid cursor of encoded stats. The
    /// cursor is (re)generated by a read at offset zero and then drained in
    /// order; the offsets of the later reads are implicit.
    async fn read_dir(
        &self,
        fid: u32,
        path: &str,
        file: Arc<dyn File>,
        offset: u64,
        count: usize,
    ) -> Result<Fcall> {
        if offset == 0 {
            let entries = file.readdir().await?;

            let mut buf = Vec::new();
            for entry in &entries {
                let qid = self.qid(&utils::join(path, &entry.name)).await?;
                entry.stat(qid.path).encode(&mut buf)?;
            }

            self.dirs.lock().await.insert(fid, Cursor::new(buf));
        }

        let mut dirs = self.dirs.lock().await;
        let cursor = match dirs.get_mut(&fid) {
            Some(cursor) => cursor,
            None => return res!("directory read with invalid offset"),
        };

        let mut buf = vec![0u8; count];
        let n = cursor.read(&mut buf)?;
        buf.truncate(n);

        Ok(Fcall::RRead { data: Data(buf) })
    }

    async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<Fcall> {
        let file = self.file_of(fid).await?;

        let count = file.write_at(data, offset).await? as u32;
        Ok(Fcall::RWrite { count })
    }

    /// Drop every table entry for a fid, closing its open file if any.
    /// The fid is gone afterwards even if the close fails.
    async fn clunk_fid(&self, fid: u32) -> Result<()> {
        let file = self.files.write().await.remove(&fid);
        self.fids.write().await.remove(&fid);
        self.dirs.lock().await.remove(&fid);

        match file {
            Some(file) => file.close().await,
            None => Ok(()),
        }
    }

    async fn clunk(&self, fid: u32) -> Result<Fcall> {
        self.clunk_fid(fid).await?;
        Ok(Fcall::RClunk)
    }

    async fn remove(&self, fid: u32) -> Result<Fcall> {
        let path = self.path_of(fid).await;

        // Remove always implies clunk, even when it fails.
        let _ = self.clunk_fid(fid).await;

        self.fs.remove(&path?).await?;
        Ok(Fcall::RRemove)
    }

    async fn stat(&self, fid: u32) -> Result<Fcall> {
        let path = self.path_of(fid).await?;

        let entry = self.fs.stat(&path).await?;
        let qid = self.qid(&path).await?;

        Ok(Fcall::RStat {
            stat: entry.stat(qid.path),
        })
    }

    async fn wstat(&self, fid: u32, stat: Stat) -> Result<Fcall> {
        let path = self.path_of(fid).await?;

        let changes = StatChanges::from(stat);
        self.fs.write_stat(&path, &changes).await?;

        Ok(Fcall::RWStat)
    }
}

#[async_trait]
impl<Fs: FileSystem + 'static> MessageHandler for FsHandler<Fs> {
    async fn handle_message(&self, msg: Fcall) -> Fcall {
        let typ = MsgType::from(&msg);

        let response = match msg {
            Fcall::TVersion { msize, ref version } => self.version(msize, version).await,
            Fcall::TAuth {
                afid,
                ref uname,
                ref aname,
            } => self.auth(afid, uname, aname).await,
            Fcall::TAttach {
                fid,
                afid,
                ref uname,
                ref aname,
            } => self.attach(fid, afid, uname, aname).await,
            Fcall::TFlush { .. } => res!("flush not supported"),
            Fcall::TWalk {
                fid,
                newfid,
                ref wnames,
            } => self.walk(fid, newfid, wnames).await,
            Fcall::TOpen { fid, mode } => self.open(fid, mode).await,
            Fcall::TCreate {
                fid,
                ref name,
                perm,
                mode,
            } => self.create(fid, name, perm, mode).await,
            Fcall::TRead { fid, offset, count } => self.read(fid, offset, count).await,
            Fcall::TWrite {
                fid,
                offset,
                ref data,
            } => self.write(fid, offset, &data.0).await,
            Fcall::TClunk { fid } => self.clunk(fid).await,
            Fcall::TRemove { fid } => self.remove(fid).await,
            Fcall::TStat { fid } => self.stat(fid).await,
            Fcall::TWStat { fid, stat } => self.wstat(fid, stat).await,
            _ => res!(format!("unexpected message type: {:?}", typ)),
        };

        response.unwrap_or_else(|err| {
            debug!("{:?}: {}", typ, err);
            Fcall::RError {
                ename: err.to_string(),
            }
        })
    }

    /// Sweep the session: every file still open when the connection ends
    /// gets closed.
    async fn close(&self) {
        let files: Vec<_> = self.files.write().await.drain().collect();
        for (_, file) in files {
            let _ = file.close().await;
        }
    }
}

/// Forwards reads and stats, rejects everything that would change the
/// hierarchy.
pub struct ReadOnly<Fs>(pub Fs);

#[async_trait]
impl<Fs: FileSystem> FileSystem for ReadOnly<Fs> {
    async fn stat(&self, path: &str) -> Result<DirEntry> {
        self.0.stat(path).await
    }

    async fn write_stat(&self, _path: &str, _changes: &StatChanges) -> Result<()> {
        res!("read-only file system")
    }

    async fn auth(&self, uname: &str, aname: &str) -> Result<Arc<dyn File>> {
        self.0.auth(uname, aname).await
    }

    async fn attach(&self, afile: Option<Arc<dyn File>>, uname: &str, aname: &str) -> Result<()> {
        self.0.attach(afile, uname, aname).await
    }

    async fn open(&self, path: &str, mode: u8) -> Result<Arc<dyn File>> {
        match mode & 0x03 {
            om::WRITE | om::RDWR => res!("read-only file system"),
            _ if mode & (om::TRUNC | om::RCLOSE) != 0 => res!("read-only file system"),
            _ => self.0.open(path, mode).await,
        }
    }

    fn iounit(&self) -> u32 {
        self.0.iounit()
    }
}

/// Mints auth files and verifies them at attach time.
///
/// This is the composition hook for authentication: the protocol plumbing
/// (afid handling, auth file lifetime) lives in [`FsHandler`], the actual
/// scheme lives behind this trait.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Produce the auth file a client will converse with.
    async fn auth(&self, uname: &str, aname: &str) -> Result<Arc<dyn File>>;

    /// Decide whether the exchange carried by `afile` authenticates
    /// `uname` for `aname`.
    async fn verify(&self, afile: Arc<dyn File>, uname: &str, aname: &str) -> Result<()>;
}

/// Wraps a [`FileSystem`] with an [`Authenticator`], turning the inner
/// tree into one that demands credentials at attach time.
pub struct Authenticated<Fs, A> {
    fs: Fs,
    authenticator: A,
}

impl<Fs: FileSystem, A: Authenticator> Authenticated<Fs, A> {
    pub fn new(fs: Fs, authenticator: A) -> Self {
        Authenticated { fs, authenticator }
    }
}

#[async_trait]
impl<Fs: FileSystem, A: Authenticator> FileSystem for Authenticated<Fs, A> {
    async fn stat(&self, path: &str) -> Result<DirEntry> {
        self.fs.stat(path).await
    }

    async fn write_stat(&self, path: &str, changes: &StatChanges) -> Result<()> {
        self.fs.write_stat(path, changes).await
    }

    async fn auth(&self, uname: &str, aname: &str) -> Result<Arc<dyn File>> {
        self.authenticator.auth(uname, aname).await
    }

    async fn attach(&self, afile: Option<Arc<dyn File>>, uname: &str, aname: &str) -> Result<()> {
        match afile {
            Some(afile) => self.authenticator.verify(afile, uname, aname).await,
            None => res!("authentication required"),
        }
    }

    async fn open(&self, path: &str, mode: u8) -> Result<Arc<dyn File>> {
        self.fs.open(path, mode).await
    }

    async fn create(&self, path: &str, perm: FileMode, mode: u8) -> Result<Arc<dyn File>> {
        self.fs.create(path, perm, mode).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.fs.remove(path).await
    }

    fn iounit(&self) -> u32 {
        self.fs.iounit()
    }
}
