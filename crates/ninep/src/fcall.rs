//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::fmt;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with `RVersion` when the server does not
/// understand the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message
/// should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Per-message overhead of a read or write payload
///
/// size\[4\] type\[1\] tag\[2\] count\[4\]
pub const IOHDRSZ: u32 = 11;

/// Standard 9P port
pub const STD_PORT: u16 = 564;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 0x40;
}

bitflags! {
    /// Bits in `Qid.typ`
    ///
    /// The high byte of a file's [`FileMode`] must carry the same bits.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bit for symbolic links"]
        const SYMLINK   = 0x02;
        #[doc = "Type bit for hard links"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed. Two qids
/// with the same `path` on the same server name the same file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time
    /// the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Wire size of a qid: type(1) + version(4) + path(8).
    pub fn size(&self) -> u32 {
        1 + 4 + 8
    }
}

/// A 32-bit file mode: the low 9 bits are Unix-style permissions, the high
/// byte mirrors the [`QidType`] bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Mode bit for directories
    pub const DIR: FileMode = FileMode(0x8000_0000);
    /// Mode bit for append only files
    pub const APPEND: FileMode = FileMode(0x4000_0000);
    /// Mode bit for exclusive use files
    pub const EXCL: FileMode = FileMode(0x2000_0000);
    /// Mode bit for mounted channel
    pub const MOUNT: FileMode = FileMode(0x1000_0000);
    /// Mode bit for authentication file
    pub const AUTH: FileMode = FileMode(0x0800_0000);
    /// Mode bit for non-backed-up files
    pub const TMP: FileMode = FileMode(0x0400_0000);
    /// Mode bit for symbolic links
    pub const SYMLINK: FileMode = FileMode(0x0200_0000);

    /// The qid type bits carried in the high byte.
    pub fn qid_type(self) -> QidType {
        QidType::from_bits_truncate((self.0 >> 24) as u8)
    }

    /// The Unix-style permission bits.
    pub fn perm(self) -> u32 {
        self.0 & 0o777
    }

    pub fn contains(self, other: FileMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_dir(self) -> bool {
        self.contains(FileMode::DIR)
    }
}

impl std::ops::BitOr for FileMode {
    type Output = FileMode;
    fn bitor(self, rhs: FileMode) -> FileMode {
        FileMode(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<u32> for FileMode {
    type Output = FileMode;
    fn bitor(self, rhs: u32) -> FileMode {
        FileMode(self.0 | rhs)
    }
}

impl fmt::Display for FileMode {
    /// Renders `ls`-style mode strings such as `drwxr-xr-x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [b'-'; 10];

        const TYPES: &[u8] = b"dalMATS";
        for (i, &t) in TYPES.iter().enumerate() {
            if self.0 & (1 << (31 - i)) != 0 {
                buf[0] = t;
            }
        }

        const PERMS: &[u8] = b"rwx";
        for i in 1..buf.len() {
            if self.0 & (1 << (buf.len() - 1 - i)) != 0 {
                buf[i] = PERMS[(i - 1) % PERMS.len()];
            }
        }

        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

/// Plan 9 namespace metadata (somewhat like a Unix fstat)
///
/// Every stat on the wire is preceded by a 16-bit size of the bytes that
/// follow it, excluding the size field itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions
    pub mode: FileMode,
    /// Last read time, Unix seconds
    pub atime: u32,
    /// Last write time, Unix seconds
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Stat {
    /// The value of the stat's leading size field: everything that follows
    /// it, including the four string length prefixes.
    pub fn size(&self) -> u16 {
        (2 + 4
            + self.qid.size() as usize
            + 4
            + 4
            + 4
            + 8
            + (std::mem::size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    /// Project the stat onto its protocol-agnostic form.
    pub fn dir_entry(&self) -> DirEntry {
        DirEntry {
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.length,
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
        }
    }
}

/// A smaller version of [`Stat`] that eliminates unnecessary or duplicate
/// fields. This is what the [`FileSystem`] interface traffics in; a
/// `DirEntry` plus a qid path yields a full `Stat`.
///
/// [`FileSystem`]: crate::fs::FileSystem
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub mode: FileMode,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl DirEntry {
    /// Build the on-wire stat for this entry with the given qid path. The
    /// qid type and the stat's server type field are both derived from the
    /// mode's high bits.
    pub fn stat(&self, path: u64) -> Stat {
        Stat {
            typ: (self.mode.0 >> 16) as u16,
            dev: 0,
            qid: Qid {
                typ: self.mode.qid_type(),
                version: 0,
                path,
            },
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.length,
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
        }
    }
}

/// The change set carried by a `TWStat` request.
///
/// Fields equal to their sentinel value ("don't touch") read back as `None`:
/// all-ones mode and length, times whose seconds are -1, empty strings.
#[derive(Clone, Debug)]
pub struct StatChanges(DirEntry);

impl From<Stat> for StatChanges {
    fn from(stat: Stat) -> Self {
        StatChanges(stat.dir_entry())
    }
}

impl StatChanges {
    pub fn mode(&self) -> Option<FileMode> {
        (self.0.mode.0 != !0).then_some(self.0.mode)
    }

    pub fn atime(&self) -> Option<u32> {
        (self.0.atime != !0).then_some(self.0.atime)
    }

    pub fn mtime(&self) -> Option<u32> {
        (self.0.mtime != !0).then_some(self.0.mtime)
    }

    pub fn length(&self) -> Option<u64> {
        (self.0.length != !0).then_some(self.0.length)
    }

    pub fn name(&self) -> Option<&str> {
        (!self.0.name.is_empty()).then_some(self.0.name.as_str())
    }

    pub fn uid(&self) -> Option<&str> {
        (!self.0.uid.is_empty()).then_some(self.0.uid.as_str())
    }

    pub fn gid(&self) -> Option<&str> {
        (!self.0.gid.is_empty()).then_some(self.0.gid.as_str())
    }

    pub fn muid(&self) -> Option<&str> {
        (!self.0.muid.is_empty()).then_some(self.0.muid.as_str())
    }

    /// True when every field carries its sentinel.
    pub fn is_empty(&self) -> bool {
        self.mode().is_none()
            && self.atime().is_none()
            && self.mtime().is_none()
            && self.length().is_none()
            && self.name().is_none()
            && self.uid().is_none()
            && self.gid().is_none()
            && self.muid().is_none()
    }
}

/// Data type used in `RRead` and `TWrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        //TError        = 106,  // Illegal, never used
        RError          = 107,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            RVersion
                | RAuth
                | RAttach
                | RError
                | RFlush
                | RWalk
                | ROpen
                | RCreate
                | RRead
                | RWrite
                | RClunk
                | RRemove
                | RStat
                | RWStat
        )
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::TVersion { .. } => MsgType::TVersion,
            Fcall::RVersion { .. } => MsgType::RVersion,
            Fcall::TAuth { .. } => MsgType::TAuth,
            Fcall::RAuth { .. } => MsgType::RAuth,
            Fcall::TAttach { .. } => MsgType::TAttach,
            Fcall::RAttach { .. } => MsgType::RAttach,
            Fcall::RError { .. } => MsgType::RError,
            Fcall::TFlush { .. } => MsgType::TFlush,
            Fcall::RFlush => MsgType::RFlush,
            Fcall::TWalk { .. } => MsgType::TWalk,
            Fcall::RWalk { .. } => MsgType::RWalk,
            Fcall::TOpen { .. } => MsgType::TOpen,
            Fcall::ROpen { .. } => MsgType::ROpen,
            Fcall::TCreate { .. } => MsgType::TCreate,
            Fcall::RCreate { .. } => MsgType::RCreate,
            Fcall::TRead { .. } => MsgType::TRead,
            Fcall::RRead { .. } => MsgType::RRead,
            Fcall::TWrite { .. } => MsgType::TWrite,
            Fcall::RWrite { .. } => MsgType::RWrite,
            Fcall::TClunk { .. } => MsgType::TClunk,
            Fcall::RClunk => MsgType::RClunk,
            Fcall::TRemove { .. } => MsgType::TRemove,
            Fcall::RRemove => MsgType::RRemove,
            Fcall::TStat { .. } => MsgType::TStat,
            Fcall::RStat { .. } => MsgType::RStat,
            Fcall::TWStat { .. } => MsgType::TWStat,
            Fcall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: Qid,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: Qid,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<Qid>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: Qid,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: FileMode,
        mode: u8,
    },
    RCreate {
        qid: Qid,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid_type_mirrors_mode_high_byte() {
        let mode = FileMode::DIR | 0o755;
        assert_eq!(mode.qid_type(), QidType::DIR);
        assert_eq!(mode.perm(), 0o755);

        let mode = FileMode::APPEND | FileMode::EXCL | 0o600;
        assert_eq!(mode.qid_type(), QidType::APPEND | QidType::EXCL);

        assert_eq!(FileMode(0o644).qid_type(), QidType::FILE);
    }

    #[test]
    fn mode_rendering() {
        assert_eq!((FileMode::DIR | 0o755).to_string(), "drwxr-xr-x");
        assert_eq!(FileMode(0o644).to_string(), "-rw-r--r--");
        assert_eq!((FileMode::APPEND | 0o222).to_string(), "a-w--w--w-");
    }

    #[test]
    fn stat_size_counts_strings() {
        let stat = Stat {
            name: "test".to_owned(),
            uid: "glenda".to_owned(),
            ..Stat::default()
        };
        assert_eq!(stat.size(), 47 + 4 + 6);
    }

    #[test]
    fn stat_changes_sentinels() {
        let unchanged = Stat {
            mode: FileMode(!0),
            atime: !0,
            mtime: !0,
            length: !0,
            ..Stat::default()
        };
        let changes = StatChanges::from(unchanged);
        assert!(changes.is_empty());

        let touched = Stat {
            mode: FileMode(0o640),
            atime: !0,
            mtime: 1234,
            length: !0,
            name: "renamed".to_owned(),
            ..Stat::default()
        };
        let changes = StatChanges::from(touched);
        assert_eq!(changes.mode(), Some(FileMode(0o640)));
        assert_eq!(changes.atime(), None);
        assert_eq!(changes.mtime(), Some(1234));
        assert_eq!(changes.length(), None);
        assert_eq!(changes.name(), Some("renamed"));
        assert_eq!(changes.uid(), None);
    }

    #[test]
    fn dir_entry_stat_agrees_with_mode() {
        let entry = DirEntry {
            mode: FileMode::DIR | 0o750,
            name: "sub".to_owned(),
            ..DirEntry::default()
        };
        let stat = entry.stat(42);
        assert_eq!(stat.qid.typ, QidType::DIR);
        assert_eq!(stat.qid.path, 42);
        assert_eq!(stat.mode, entry.mode);
    }
}
