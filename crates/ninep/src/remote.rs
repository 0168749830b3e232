//! A file-like interface for performing operations on files presented by a
//! 9P server.

use crate::client::Client;
use crate::fcall::*;
use crate::res;
use crate::serialize::Decodable;
use crate::utils::{self, Result};
use std::io::{Cursor, SeekFrom};
use tokio::sync::Mutex;

/// A handle to a file on a 9P server.
///
/// A `Remote` binds a client, a fid, the fid's qid, and a locally tracked
/// file position. 9P requires clients to track their own positions, so
/// [`read`](Remote::read) and [`write`](Remote::write) advance the position
/// locally and [`seek`](Remote::seek) is a local operation except for
/// `SeekFrom::End`.
pub struct Remote {
    client: Client,
    fid: u32,
    qid: Qid,
    pos: Mutex<u64>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("fid", &self.fid)
            .field("qid", &self.qid)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Request an auth file from the server. The returned handle carries
    /// the authentication exchange and can then be passed to
    /// [`attach`](Client::attach).
    pub async fn auth(&self, user: &str, aname: &str) -> Result<Remote> {
        let afid = self.next_fid().await?;

        match self
            .send(Fcall::TAuth {
                afid,
                uname: user.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            Fcall::RAuth { aqid } => Ok(Remote {
                client: self.clone(),
                fid: afid,
                qid: aqid,
                pos: Mutex::new(0),
            }),
            rsp => unexpected(rsp),
        }
    }

    /// Attach to a file tree provided by the connected server. If no
    /// authentication has been done, `afile` may be `None`. The returned
    /// handle represents the root of the attached tree.
    pub async fn attach(&self, afile: Option<&Remote>, user: &str, aname: &str) -> Result<Remote> {
        let fid = self.next_fid().await?;

        match self
            .send(Fcall::TAttach {
                fid,
                afid: afile.map_or(NOFID, |afile| afile.fid),
                uname: user.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            Fcall::RAttach { qid } => Ok(Remote {
                client: self.clone(),
                fid,
                qid,
                pos: Mutex::new(0),
            }),
            rsp => unexpected(rsp),
        }
    }
}

impl Remote {
    /// The qid the server handed out for this file.
    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// The type of the file represented by this handle.
    pub fn typ(&self) -> QidType {
        self.qid.typ
    }

    /// Walk to `path`, producing a new fid. The walk is all-or-nothing:
    /// a reply with fewer qids than path components means the walk failed
    /// and no new fid was installed on the server.
    async fn walk(&self, path: &str) -> Result<Remote> {
        let newfid = self.client.next_fid().await?;

        let cleaned = utils::clean(path);
        let wnames: Vec<String> = match cleaned.as_str() {
            "/" | "." => Vec::new(),
            cleaned => cleaned
                .trim_start_matches('/')
                .split('/')
                .map(str::to_owned)
                .collect(),
        };
        let requested = wnames.len();

        match self
            .client
            .send(Fcall::TWalk {
                fid: self.fid,
                newfid,
                wnames,
            })
            .await?
        {
            Fcall::RWalk { wqids } => {
                if wqids.len() < requested {
                    return res!(format!("{}: no such file or directory", path));
                }

                Ok(Remote {
                    client: self.client.clone(),
                    fid: newfid,
                    qid: wqids.last().copied().unwrap_or(self.qid),
                    pos: Mutex::new(0),
                })
            }
            rsp => unexpected(rsp),
        }
    }

    /// Open a file relative to this one. In many cases this will be
    /// relative to the tree root:
    ///
    /// ```no_run
    /// # async fn example(client: ninep::Client) -> ninep::Result<()> {
    /// let root = client.attach(None, "anyone", "/").await?;
    /// let file = root.open("some/file/or/another", ninep::om::READ).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(&self, path: &str, mode: u8) -> Result<Remote> {
        let file = self.walk(path).await?;

        let rsp = self
            .client
            .send(Fcall::TOpen {
                fid: file.fid,
                mode,
            })
            .await;

        match rsp {
            Ok(Fcall::ROpen { qid, .. }) => Ok(Remote { qid, ..file }),
            Ok(rsp) => {
                let _ = file.close().await;
                unexpected(rsp)
            }
            Err(err) => {
                // The walked fid must not leak.
                let _ = file.close().await;
                Err(err)
            }
        }
    }

    /// Create a file relative to this one. The parent directory of `path`
    /// is walked to, and the final component is created inside it. The
    /// returned handle is open in `mode`.
    pub async fn create(&self, path: &str, perm: FileMode, mode: u8) -> Result<Remote> {
        let cleaned = utils::clean(path);
        let (dir, name) = match cleaned.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => (".", cleaned.as_str()),
        };
        if name.is_empty() || name == "." || name == ".." {
            return res!(format!("create: invalid name: {:?}", name));
        }

        let file = self.walk(dir).await?;

        let rsp = self
            .client
            .send(Fcall::TCreate {
                fid: file.fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await;

        match rsp {
            Ok(Fcall::RCreate { qid, .. }) => Ok(Remote { qid, ..file }),
            Ok(rsp) => {
                let _ = file.close().await;
                unexpected(rsp)
            }
            Err(err) => {
                let _ = file.close().await;
                Err(err)
            }
        }
    }

    /// Reposition the local file offset. `SeekFrom::Start` and
    /// `SeekFrom::Current` are purely local; `SeekFrom::End` stats the file
    /// to learn its length. Offsets that would land before the start of the
    /// file are rejected.
    pub async fn seek(&self, whence: SeekFrom) -> Result<u64> {
        let mut pos = self.pos.lock().await;

        let new = match whence {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let new = *pos as i64 + delta;
                if new < 0 {
                    return res!("negative offset");
                }
                new as u64
            }
            SeekFrom::End(delta) => {
                let stat = self.stat().await?;
                let new = stat.length as i64 + delta;
                if new < 0 {
                    return res!("negative offset");
                }
                new as u64
            }
        };

        *pos = new;
        Ok(new)
    }

    fn max_payload(&self) -> Result<usize> {
        match self.client.msize().saturating_sub(IOHDRSZ) {
            0 => res!("msize too small for payloads"),
            max => Ok(max as usize),
        }
    }

    async fn read_part(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self
            .client
            .send(Fcall::TRead {
                fid: self.fid,
                offset,
                count: buf.len() as u32,
            })
            .await?
        {
            Fcall::RRead { data } => {
                let n = usize::min(data.0.len(), buf.len());
                buf[..n].copy_from_slice(&data.0[..n]);
                Ok(n)
            }
            rsp => unexpected(rsp),
        }
    }

    /// Read from the file at the given offset into `buf`, without touching
    /// the local position.
    ///
    /// Requests larger than the negotiated message size allows are split
    /// into multiple `Tread`s at increasing offsets. Returns the number of
    /// bytes read; a count shorter than `buf` (or zero) means the server
    /// reached the end of the file.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let chunk = self.max_payload()?;

        let mut total = 0;
        while total < buf.len() {
            let end = usize::min(total + chunk, buf.len());
            let want = end - total;

            let n = self.read_part(&mut buf[total..end], offset + total as u64).await?;
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    /// Read from the file at the locally tracked offset, advancing it by
    /// the number of bytes read. See [`read_at`](Remote::read_at).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock().await;
        let n = self.read_at(buf, *pos).await?;
        *pos += n as u64;
        Ok(n)
    }

    async fn write_part(&self, data: &[u8], offset: u64) -> Result<usize> {
        match self
            .client
            .send(Fcall::TWrite {
                fid: self.fid,
                offset,
                data: Data(data.to_vec()),
            })
            .await?
        {
            Fcall::RWrite { count } => Ok(count as usize),
            rsp => unexpected(rsp),
        }
    }

    /// Write `data` to the file at the given offset, without touching the
    /// local position.
    ///
    /// Buffers larger than the negotiated message size allows are split
    /// into multiple `Twrite`s at increasing offsets. Returns the number of
    /// bytes the server accepted; a short count stops the sequence there.
    pub async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let chunk = self.max_payload()?;

        let mut total = 0;
        while total < data.len() {
            let end = usize::min(total + chunk, data.len());
            let want = end - total;

            let n = self.write_part(&data[total..end], offset + total as u64).await?;
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    /// Write to the file at the locally tracked offset, advancing it by
    /// the number of bytes written. See [`write_at`](Remote::write_at).
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock().await;
        let n = self.write_at(data, *pos).await?;
        *pos += n as u64;
        Ok(n)
    }

    /// Fetch the file's metadata.
    pub async fn stat(&self) -> Result<DirEntry> {
        match self.client.send(Fcall::TStat { fid: self.fid }).await? {
            Fcall::RStat { stat } => Ok(stat.dir_entry()),
            rsp => unexpected(rsp),
        }
    }

    /// Read the file as a directory, returning the entries the server
    /// produced.
    ///
    /// The whole remaining directory is read, so the full list is returned
    /// in one call. To read the list again, seek back to the beginning
    /// first.
    pub async fn readdir(&self) -> Result<Vec<DirEntry>> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; self.max_payload()?];
        loop {
            match self.read(&mut buf).await? {
                0 => break,
                n => data.extend_from_slice(&buf[..n]),
            }
        }

        let len = data.len() as u64;
        let mut cursor = Cursor::new(data);

        let mut entries = Vec::new();
        while cursor.position() < len {
            entries.push(Stat::decode(&mut cursor)?.dir_entry());
        }
        Ok(entries)
    }

    /// Remove the file from the server. The fid is released whether or not
    /// the removal succeeds.
    pub async fn remove(self) -> Result<()> {
        match self.client.send(Fcall::TRemove { fid: self.fid }).await? {
            Fcall::RRemove => Ok(()),
            rsp => unexpected(rsp),
        }
    }

    /// Release the fid on the server. Further usage of the handle will
    /// produce errors.
    pub async fn close(&self) -> Result<()> {
        match self.client.send(Fcall::TClunk { fid: self.fid }).await? {
            Fcall::RClunk => Ok(()),
            rsp => unexpected(rsp),
        }
    }
}

fn unexpected<T>(rsp: Fcall) -> Result<T> {
    res!(format!("unexpected response: {:?}", MsgType::from(&rsp)))
}
