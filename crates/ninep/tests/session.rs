//! End-to-end client/server sessions over an in-process pipe.

use async_trait::async_trait;
use ninep::serialize::Decodable;
use ninep::srv::serve_conn;
use ninep::{
    om, Authenticated, Authenticator, Client, DirEntry, Fcall, File, FileMode, FileSystem,
    FsHandler, Qid, QidType, Result, Stat, NOFID,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
enum MemNode {
    Dir,
    File(Arc<MemFile>),
}

#[derive(Default)]
struct MemFile {
    data: std::sync::Mutex<Vec<u8>>,
    reads: std::sync::Mutex<Vec<(u64, usize)>>,
    writes: std::sync::Mutex<Vec<(u64, usize)>>,
}

impl MemFile {
    fn with_data(data: &[u8]) -> Arc<MemFile> {
        Arc::new(MemFile {
            data: std::sync::Mutex::new(data.to_vec()),
            ..MemFile::default()
        })
    }
}

/// A tiny in-memory hierarchy: a flat map from paths to nodes.
#[derive(Clone, Default)]
struct MemFs {
    nodes: Arc<Mutex<HashMap<String, MemNode>>>,
}

impl MemFs {
    /// The tree used by most tests: `/` containing one file.
    async fn test_tree() -> MemFs {
        let fs = MemFs::default();
        {
            let mut nodes = fs.nodes.lock().await;
            nodes.insert("/".to_owned(), MemNode::Dir);
            nodes.insert(
                "/test".to_owned(),
                MemNode::File(MemFile::with_data(b"This is a test.\n")),
            );
        }
        fs
    }

    async fn file(&self, path: &str) -> Arc<MemFile> {
        match self.nodes.lock().await.get(path) {
            Some(MemNode::File(file)) => file.clone(),
            _ => panic!("no file at {}", path),
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn entry_for(path: &str, node: &MemNode) -> DirEntry {
    match node {
        MemNode::Dir => DirEntry {
            mode: FileMode::DIR | 0o755,
            name: basename(path).to_owned(),
            ..DirEntry::default()
        },
        MemNode::File(file) => DirEntry {
            mode: FileMode(0o644),
            length: file.data.lock().unwrap().len() as u64,
            name: basename(path).to_owned(),
            ..DirEntry::default()
        },
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn stat(&self, path: &str) -> Result<DirEntry> {
        match self.nodes.lock().await.get(path) {
            Some(node) => Ok(entry_for(path, node)),
            None => Err("no such file".into()),
        }
    }

    async fn open(&self, path: &str, _mode: u8) -> Result<Arc<dyn File>> {
        match self.nodes.lock().await.get(path) {
            Some(MemNode::File(file)) => Ok(Arc::new(MemFileHandle(file.clone()))),
            Some(MemNode::Dir) => Ok(Arc::new(MemDirHandle {
                fs: self.clone(),
                path: path.to_owned(),
            })),
            None => Err("no such file".into()),
        }
    }

    async fn create(&self, path: &str, perm: FileMode, _mode: u8) -> Result<Arc<dyn File>> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(path) {
            return Err("file exists".into());
        }

        if perm.is_dir() {
            nodes.insert(path.to_owned(), MemNode::Dir);
            return Ok(Arc::new(MemDirHandle {
                fs: self.clone(),
                path: path.to_owned(),
            }));
        }

        let file = MemFile::with_data(b"");
        nodes.insert(path.to_owned(), MemNode::File(file.clone()));
        Ok(Arc::new(MemFileHandle(file)))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match self.nodes.lock().await.remove(path) {
            Some(_) => Ok(()),
            None => Err("no such file".into()),
        }
    }
}

struct MemFileHandle(Arc<MemFile>);

#[async_trait]
impl File for MemFileHandle {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.0.reads.lock().unwrap().push((offset, buf.len()));

        let data = self.0.data.lock().unwrap();
        if offset >= data.len() as u64 {
            return Ok(0);
        }

        let n = usize::min(buf.len(), data.len() - offset as usize);
        buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.0.writes.lock().unwrap().push((offset, data.len()));

        let mut stored = self.0.data.lock().unwrap();
        let end = offset as usize + data.len();
        if stored.len() < end {
            stored.resize(end, 0);
        }
        stored[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }
}

struct MemDirHandle {
    fs: MemFs,
    path: String,
}

#[async_trait]
impl File for MemDirHandle {
    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err("is a directory".into())
    }

    async fn readdir(&self) -> Result<Vec<DirEntry>> {
        let children: Vec<String> = {
            let nodes = self.fs.nodes.lock().await;
            nodes
                .keys()
                .filter(|path| {
                    path.as_str() != self.path
                        && path.strip_prefix(&self.path).is_some_and(|rest| {
                            let rest = rest.trim_start_matches('/');
                            !rest.is_empty() && !rest.contains('/')
                        })
                })
                .cloned()
                .collect()
        };

        let mut entries = Vec::new();
        for path in children {
            entries.push(self.fs.stat(&path).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Wire a client to a fresh single-connection server over an in-process
/// duplex pipe. `msize` is what the server advertises.
async fn serve_pair(fs: MemFs, msize: u32) -> Client {
    let (client_side, server_side) = tokio::io::duplex(1 << 16);

    let handler = Arc::new(FsHandler::new(Arc::new(fs), msize));
    tokio::spawn(async move {
        let _ = serve_conn(server_side, handler).await;
    });

    Client::new(client_side)
}

#[tokio::test]
async fn handshake_settles_on_the_smaller_msize() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;

    assert_eq!(client.handshake(8192).await.unwrap(), 4096);
    assert_eq!(client.msize(), 4096);
}

#[tokio::test]
async fn handshake_cannot_be_repeated() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;

    client.handshake(8192).await.unwrap();
    let err = client.handshake(8192).await.unwrap_err();
    assert_eq!(err.to_string(), "version already negotiated");
}

#[tokio::test]
async fn unknown_version_is_answered_with_unknown() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;

    let rsp = client
        .send(Fcall::TVersion {
            msize: 8192,
            version: "9P2042".to_owned(),
        })
        .await
        .unwrap();
    match rsp {
        Fcall::RVersion { version, .. } => assert_eq!(version, "unknown"),
        rsp => panic!("unexpected response: {:?}", rsp),
    }

    // The refusal must not have burned the negotiation.
    assert_eq!(client.handshake(8192).await.unwrap(), 4096);
}

#[tokio::test]
async fn attach_and_read_a_file() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();
    assert_eq!(root.typ(), QidType::DIR);

    let file = root.open("test", om::READ).await.unwrap();
    let mut buf = [0u8; 4085];
    let n = file.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"This is a test.\n");

    file.close().await.unwrap();
}

#[tokio::test]
async fn directory_read_yields_stats_then_eof() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    client
        .send(Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "anyone".to_owned(),
            aname: "/".to_owned(),
        })
        .await
        .unwrap();

    // An empty walk duplicates the fid and returns no qids.
    match client
        .send(Fcall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: Vec::new(),
        })
        .await
        .unwrap()
    {
        Fcall::RWalk { wqids } => assert!(wqids.is_empty()),
        rsp => panic!("unexpected response: {:?}", rsp),
    }

    client
        .send(Fcall::TOpen {
            fid: 1,
            mode: om::READ,
        })
        .await
        .unwrap();

    let data = match client
        .send(Fcall::TRead {
            fid: 1,
            offset: 0,
            count: 4085,
        })
        .await
        .unwrap()
    {
        Fcall::RRead { data } => data.0,
        rsp => panic!("unexpected response: {:?}", rsp),
    };

    // One entry: the encoded stat for "test", size field plus its body.
    let stat = Stat::decode(&mut Cursor::new(&data)).unwrap();
    assert_eq!(stat.name, "test");
    assert_eq!(stat.length, 16);
    assert_eq!(data.len(), 2 + stat.size() as usize);

    let data = match client
        .send(Fcall::TRead {
            fid: 1,
            offset: data.len() as u64,
            count: 4085,
        })
        .await
        .unwrap()
    {
        Fcall::RRead { data } => data.0,
        rsp => panic!("unexpected response: {:?}", rsp),
    };
    assert!(data.is_empty());
}

#[tokio::test]
async fn walk_partial_failure_installs_no_fid() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    client
        .send(Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "anyone".to_owned(),
            aname: "/".to_owned(),
        })
        .await
        .unwrap();

    // Failure at the zeroth step is an outright error.
    let err = client
        .send(Fcall::TWalk {
            fid: 0,
            newfid: 2,
            wnames: vec!["nonexistent".to_owned(), "x".to_owned()],
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no such file");

    // Failure later returns the partial qid list.
    match client
        .send(Fcall::TWalk {
            fid: 0,
            newfid: 2,
            wnames: vec!["test".to_owned(), "x".to_owned()],
        })
        .await
        .unwrap()
    {
        Fcall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
        rsp => panic!("unexpected response: {:?}", rsp),
    }

    // Either way fid 2 must not exist.
    let err = client
        .send(Fcall::TOpen {
            fid: 2,
            mode: om::READ,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown fid: 2");
}

#[tokio::test]
async fn chunked_write_decomposes_at_msize() {
    let fs = MemFs::test_tree().await;
    let client = serve_pair(fs.clone(), 128).await;

    assert_eq!(client.handshake(8192).await.unwrap(), 128);

    let root = client.attach(None, "anyone", "/").await.unwrap();
    let file = root
        .create("big", FileMode(0o644), om::WRITE)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let written = file.write_at(&payload, 0).await.unwrap();
    assert_eq!(written, 300);

    // msize 128 leaves 117 bytes of payload per message.
    let big = fs.file("/big").await;
    assert_eq!(
        *big.writes.lock().unwrap(),
        vec![(0, 117), (117, 117), (234, 66)]
    );
    assert_eq!(*big.data.lock().unwrap(), payload);
}

#[tokio::test]
async fn chunked_read_decomposes_at_msize() {
    let fs = MemFs::test_tree().await;
    {
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut nodes = fs.nodes.lock().await;
        nodes.insert(
            "/big".to_owned(),
            MemNode::File(MemFile::with_data(&payload)),
        );
    }

    let client = serve_pair(fs.clone(), 128).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();
    let file = root.open("big", om::READ).await.unwrap();

    let mut buf = vec![0u8; 300];
    let n = file.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(n, 300);
    assert_eq!(buf[299], 43); // 299 % 256

    let big = fs.file("/big").await;
    assert_eq!(
        *big.reads.lock().unwrap(),
        vec![(0, 117), (117, 117), (234, 66)]
    );
}

#[tokio::test]
async fn error_strings_survive_the_wire() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();
    let err = root.open("nonexistent", om::READ).await.unwrap_err();
    assert_eq!(err.to_string(), "no such file");
}

#[tokio::test]
async fn write_then_read_observes_the_bytes() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();

    let writer = root
        .create("notes", FileMode(0o644), om::RDWR)
        .await
        .unwrap();
    writer.write_at(b"hello, 9p", 0).await.unwrap();

    let reader = root.open("notes", om::READ).await.unwrap();
    let mut buf = [0u8; 32];
    let n = reader.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"hello, 9p");

    writer.close().await.unwrap();
    reader.close().await.unwrap();
}

#[tokio::test]
async fn remove_implicitly_clunks() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();

    let file = root
        .create("doomed", FileMode(0o644), om::WRITE)
        .await
        .unwrap();
    file.remove().await.unwrap();

    let err = root.open("doomed", om::READ).await.unwrap_err();
    assert_eq!(err.to_string(), "no such file");
}

#[tokio::test]
async fn readdir_and_seek() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();
    let dir = root.open("/", om::READ).await.unwrap();

    let names: Vec<_> = dir
        .readdir()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["test".to_owned()]);

    // Seek back to re-read the directory from the top.
    dir.seek(std::io::SeekFrom::Start(0)).await.unwrap();
    assert_eq!(dir.readdir().await.unwrap().len(), 1);

    let file = root.open("test", om::READ).await.unwrap();
    let end = file.seek(std::io::SeekFrom::End(-5)).await.unwrap();
    assert_eq!(end, 11);
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"est.\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sends_each_get_their_own_reply() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = Arc::new(client.attach(None, "anyone", "/").await.unwrap());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let root = root.clone();
        tasks.spawn(async move {
            let file = root.open("test", om::READ).await.unwrap();

            let mut buf = [0u8; 64];
            let n = file.read_at(&mut buf, 0).await.unwrap();
            assert_eq!(&buf[..n], b"This is a test.\n");

            let stat = file.stat().await.unwrap();
            assert_eq!(stat.name, "test");

            file.close().await.unwrap();
        });
    }

    while let Some(task) = tasks.join_next().await {
        task.unwrap();
    }
}

/// A toy authenticator: the auth file accepts the magic word.
struct MagicWord {
    accepted: Arc<AtomicBool>,
}

struct MagicWordFile {
    accepted: Arc<AtomicBool>,
}

#[async_trait]
impl File for MagicWordFile {
    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Ok(0)
    }

    async fn write_at(&self, data: &[u8], _offset: u64) -> Result<usize> {
        if data == b"xyzzy" {
            self.accepted.store(true, Ordering::SeqCst);
        }
        Ok(data.len())
    }
}

#[async_trait]
impl Authenticator for MagicWord {
    async fn auth(&self, _uname: &str, _aname: &str) -> Result<Arc<dyn File>> {
        Ok(Arc::new(MagicWordFile {
            accepted: self.accepted.clone(),
        }))
    }

    async fn verify(&self, _afile: Arc<dyn File>, _uname: &str, _aname: &str) -> Result<()> {
        match self.accepted.load(Ordering::SeqCst) {
            true => Ok(()),
            false => Err("authentication failed".into()),
        }
    }
}

#[tokio::test]
async fn auth_plumbing_carries_the_exchange() {
    let fs = Authenticated::new(
        MemFs::test_tree().await,
        MagicWord {
            accepted: Arc::new(AtomicBool::new(false)),
        },
    );

    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let handler = Arc::new(FsHandler::new(Arc::new(fs), 4096));
    tokio::spawn(async move {
        let _ = serve_conn(server_side, handler).await;
    });
    let client = Client::new(client_side);

    client.handshake(8192).await.unwrap();

    // No credentials, no tree.
    let err = client.attach(None, "glenda", "/").await.unwrap_err();
    assert_eq!(err.to_string(), "authentication required");

    let afile = client.auth("glenda", "/").await.unwrap();
    assert_eq!(afile.typ(), QidType::AUTH);

    // Wrong word first, then the right one.
    afile.write_at(b"plugh", 0).await.unwrap();
    let err = client.attach(Some(&afile), "glenda", "/").await.unwrap_err();
    assert_eq!(err.to_string(), "authentication failed");

    afile.write_at(b"xyzzy", 0).await.unwrap();
    let root = client.attach(Some(&afile), "glenda", "/").await.unwrap();
    assert_eq!(root.typ(), QidType::DIR);
}

#[tokio::test]
async fn auth_is_refused_by_plain_filesystems() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let err = client.auth("glenda", "/").await.unwrap_err();
    assert_eq!(err.to_string(), "auth not supported");
}

#[tokio::test]
async fn qids_are_stable_within_a_session() {
    let client = serve_pair(MemFs::test_tree().await, 4096).await;
    client.handshake(8192).await.unwrap();

    let root = client.attach(None, "anyone", "/").await.unwrap();

    let first: Qid = root.open("test", om::READ).await.unwrap().qid();
    let second: Qid = root.open("test", om::READ).await.unwrap().qid();
    assert_eq!(first.path, second.path);
    assert_ne!(first.path, root.qid().path);
}
