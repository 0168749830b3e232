//! A [`FileSystem`] backed by a local directory tree.

use crate::fcall::*;
use crate::fs::{File, FileSystem};
use crate::res;
use crate::utils::Result;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

/// Exports the tree below a base directory.
///
/// The paths handed in by the handler are absolute within the export and
/// already cleaned, so joining them under the base cannot escape it. 9P
/// open modes are translated to host open flags; [`FileMode::DIR`] on
/// create means "make a directory".
#[derive(Clone, Debug)]
pub struct Dir {
    root: PathBuf,
}

impl Dir {
    pub fn new(root: impl Into<PathBuf>) -> Dir {
        Dir { root: root.into() }
    }

    fn real_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl FileSystem for Dir {
    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let real = self.real_path(path);
        let attr = fs::metadata(&real).await?;
        Ok(entry_from_metadata(basename(path), &attr))
    }

    async fn write_stat(&self, path: &str, changes: &StatChanges) -> Result<()> {
        let real = self.real_path(path);

        if let Some(mode) = changes.mode() {
            let perm = std::os::unix::fs::PermissionsExt::from_mode(mode.perm());
            fs::set_permissions(&real, perm).await?;
        }

        if let Some(length) = changes.length() {
            fs::OpenOptions::new()
                .write(true)
                .open(&real)
                .await?
                .set_len(length)
                .await?;
        }

        if changes.atime().is_some() || changes.mtime().is_some() {
            let attr = fs::metadata(&real).await?;
            let atime = match changes.atime() {
                Some(sec) => filetime::FileTime::from_unix_time(sec as i64, 0),
                None => filetime::FileTime::from_last_access_time(&attr),
            };
            let mtime = match changes.mtime() {
                Some(sec) => filetime::FileTime::from_unix_time(sec as i64, 0),
                None => filetime::FileTime::from_last_modification_time(&attr),
            };

            let target = real.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(target, atime, mtime))
                .await
                .map_err(|err| crate::error::Error::Message(err.to_string()))??;
        }

        if let Some(name) = changes.name() {
            if name.contains('/') {
                return res!(format!("wstat: invalid name: {:?}", name));
            }
            let renamed = match real.parent() {
                Some(parent) => parent.join(name),
                None => return res!("cannot rename the export root"),
            };
            fs::rename(&real, renamed).await?;
        }

        Ok(())
    }

    async fn open(&self, path: &str, mode: u8) -> Result<Arc<dyn File>> {
        let real = self.real_path(path);

        let attr = fs::metadata(&real).await?;
        if attr.is_dir() {
            return Ok(Arc::new(DirFile::directory(real)));
        }

        let file = open_options(mode, false).open(&real).await?;
        Ok(Arc::new(DirFile::regular(real, file)))
    }

    async fn create(&self, path: &str, perm: FileMode, mode: u8) -> Result<Arc<dyn File>> {
        let real = self.real_path(path);

        if perm.is_dir() {
            fs::DirBuilder::new()
                .mode(perm.perm())
                .create(&real)
                .await?;
            return Ok(Arc::new(DirFile::directory(real)));
        }

        let mut options = open_options(mode, true);
        options.mode(perm.perm());

        let file = options.open(&real).await?;
        Ok(Arc::new(DirFile::regular(real, file)))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let real = self.real_path(path);

        if fs::metadata(&real).await?.is_dir() {
            fs::remove_dir(&real).await?;
        } else {
            fs::remove_file(&real).await?;
        }
        Ok(())
    }
}

/// An open file or directory below a [`Dir`] export.
pub struct DirFile {
    path: PathBuf,
    file: Option<Mutex<fs::File>>,
}

impl DirFile {
    fn regular(path: PathBuf, file: fs::File) -> DirFile {
        DirFile {
            path,
            file: Some(Mutex::new(file)),
        }
    }

    fn directory(path: PathBuf) -> DirFile {
        DirFile { path, file: None }
    }

    async fn locked(&self) -> Result<tokio::sync::MutexGuard<'_, fs::File>> {
        match &self.file {
            Some(file) => Ok(file.lock().await),
            None => res!("is a directory"),
        }
    }
}

#[async_trait]
impl File for DirFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.locked().await?;

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.read(buf).await?)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut file = self.locked().await?;

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.write(data).await?)
    }

    async fn close(&self) -> Result<()> {
        if let Some(file) = &self.file {
            file.lock().await.flush().await?;
        }
        Ok(())
    }

    async fn readdir(&self) -> Result<Vec<DirEntry>> {
        let mut stream = ReadDirStream::new(fs::read_dir(&self.path).await?);

        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            let attr = entry.metadata().await?;
            entries.push(entry_from_metadata(
                &entry.file_name().to_string_lossy(),
                &attr,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn basename(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, "")) | None => path,
        Some((_, name)) => name,
    }
}

fn entry_from_metadata(name: &str, attr: &std::fs::Metadata) -> DirEntry {
    use std::os::unix::fs::MetadataExt;

    let mut mode = FileMode(attr.mode() & 0o777);
    if attr.is_dir() {
        mode = mode | FileMode::DIR;
    }
    if attr.file_type().is_symlink() {
        mode = mode | FileMode::SYMLINK;
    }

    DirEntry {
        mode,
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.len() },
        name: name.to_owned(),
        // Owner names are host-specific glue; left to the caller.
        uid: String::new(),
        gid: String::new(),
        muid: String::new(),
    }
}

fn open_options(mode: u8, create: bool) -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();

    match mode & 0x03 {
        om::WRITE => options.write(true),
        om::RDWR => options.read(true).write(true),
        // OEXEC is "read but check execute permission"; the permission
        // check happened against the mode bits already.
        _ => options.read(true),
    };

    if mode & om::TRUNC != 0 {
        options.write(true).truncate(true);
    }
    if create {
        options.write(true).create(true);
    }

    options
}

impl Dir {
    /// The directory this export is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basenames() {
        assert_eq!(basename("/"), "/");
        assert_eq!(basename("/test"), "test");
        assert_eq!(basename("/a/b/c"), "c");
    }

    #[tokio::test]
    async fn export_round_trip() {
        let root = std::env::temp_dir().join(format!("ninep-dir-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("hello"), b"hello, world\n")
            .await
            .unwrap();

        let dir = Dir::new(&root);

        let entry = dir.stat("/hello").await.unwrap();
        assert_eq!(entry.name, "hello");
        assert_eq!(entry.length, 13);
        assert!(!entry.mode.is_dir());

        let file = dir.open("/hello", om::READ).await.unwrap();
        let mut buf = [0u8; 32];
        let n = file.read_at(&mut buf, 7).await.unwrap();
        assert_eq!(&buf[..n], b"world\n");

        let root_entry = dir.stat("/").await.unwrap();
        assert!(root_entry.mode.is_dir());

        let dirfile = dir.open("/", om::READ).await.unwrap();
        let names: Vec<_> = dirfile
            .readdir()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["hello".to_owned()]);

        let created = dir
            .create("/made", FileMode(0o644), om::RDWR)
            .await
            .unwrap();
        created.write_at(b"data", 0).await.unwrap();
        created.close().await.unwrap();
        assert_eq!(tokio::fs::read(root.join("made")).await.unwrap(), b"data");

        dir.remove("/made").await.unwrap();
        assert!(dir.stat("/made").await.is_err());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
