//! Serialize/deserialize 9P messages into/from binary.

use crate::error::Error;
use crate::fcall::*;
use crate::io_err;
use crate::utils::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Cursor};
use std::mem;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: io::Read + ?Sized>(r: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(crate::utils::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> std::ops::Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> std::ops::Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> std::ops::Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> std::ops::Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        w.write_all(self.as_bytes())?;
        bytes += self.len();
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for FileMode {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.encode(w)
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << stat,
            TWStat { ref fid, ref stat } => buf << fid << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u8()?)
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u16::<LittleEndian>()?)
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u32::<LittleEndian>()?)
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(r.read_u64::<LittleEndian>()?)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| Error::Io(io_err!(Other, "Invalid UTF-8 sequence")))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for FileMode {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(FileMode(Decodable::decode(r)?))
    }
}

impl Decodable for Stat {
    /// The stat's leading size field bounds the decode: a stat whose fields
    /// run past it, or whose declared size runs past the enclosing message,
    /// fails with [`Error::StatTooLarge`].
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let body = read_exact(r, size as usize).map_err(|_| Error::StatTooLarge)?;

        match decode_stat_body(&mut Cursor::new(body)) {
            Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::StatTooLarge)
            }
            other => other,
        }
    }
}

fn decode_stat_body<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    Ok(Stat {
        typ: decode!(*r),
        dev: decode!(*r),
        qid: decode!(*r),
        mode: decode!(*r),
        atime: decode!(*r),
        mtime: decode!(*r),
        length: decode!(*r),
        name: decode!(*r),
        uid: decode!(*r),
        gid: decode!(*r),
        muid: decode!(*r),
    })
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let typ: u8 = decode!(buf);
        let msg_type = MsgType::from_u8(typ).ok_or(Error::InvalidMessageType(typ))?;
        let tag = decode!(buf);
        let body = match msg_type {
            TVersion => Fcall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            RVersion => Fcall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            TAuth => Fcall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            RAuth => Fcall::RAuth { aqid: decode!(buf) },
            TAttach => Fcall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            RAttach => Fcall::RAttach { qid: decode!(buf) },
            RError => Fcall::RError {
                ename: decode!(buf),
            },
            TFlush => Fcall::TFlush {
                oldtag: decode!(buf),
            },
            RFlush => Fcall::RFlush,
            TWalk => Fcall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            RWalk => Fcall::RWalk {
                wqids: decode!(buf),
            },
            TOpen => Fcall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            ROpen => Fcall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            TCreate => Fcall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            RCreate => Fcall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            TRead => Fcall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            RRead => Fcall::RRead {
                data: decode!(buf),
            },
            TWrite => Fcall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            RWrite => Fcall::RWrite {
                count: decode!(buf),
            },
            TClunk => Fcall::TClunk { fid: decode!(buf) },
            RClunk => Fcall::RClunk,
            TRemove => Fcall::TRemove { fid: decode!(buf) },
            RRemove => Fcall::RRemove,
            TStat => Fcall::TStat { fid: decode!(buf) },
            RStat => Fcall::RStat {
                stat: decode!(buf),
            },
            TWStat => Fcall::TWStat {
                fid: decode!(buf),
                stat: decode!(buf),
            },
            RWStat => Fcall::RWStat,
        };

        Ok(Msg { tag, body })
    }
}

/// Count the encoded size of a value without writing any bytes.
pub fn size_of<T: Encodable>(v: &T) -> Result<u32> {
    Ok(v.encode(&mut io::sink())? as u32)
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
fn sample_stat() -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid: Qid {
            typ: QidType::FILE,
            version: 0,
            path: 7,
        },
        mode: FileMode(0o644),
        atime: 1_600_000_000,
        mtime: 1_600_000_001,
        length: 16,
        name: "test".to_owned(),
        uid: "glenda".to_owned(),
        gid: "glenda".to_owned(),
        muid: "glenda".to_owned(),
    }
}

#[cfg(test)]
fn sample_msgs() -> Vec<Msg> {
    let qid = Qid {
        typ: QidType::DIR,
        version: 3,
        path: 12,
    };

    let bodies = vec![
        Fcall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        Fcall::RVersion {
            msize: 4096,
            version: P92000.to_owned(),
        },
        Fcall::TAuth {
            afid: 1,
            uname: "glenda".to_owned(),
            aname: "/".to_owned(),
        },
        Fcall::RAuth {
            aqid: Qid {
                typ: QidType::AUTH,
                version: 0,
                path: 99,
            },
        },
        Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: "/".to_owned(),
        },
        Fcall::RAttach { qid },
        Fcall::RError {
            ename: "no such file".to_owned(),
        },
        Fcall::TFlush { oldtag: 9 },
        Fcall::RFlush,
        Fcall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
        Fcall::RWalk {
            wqids: vec![qid, qid],
        },
        Fcall::TOpen {
            fid: 1,
            mode: om::READ,
        },
        Fcall::ROpen { qid, iounit: 0 },
        Fcall::TCreate {
            fid: 1,
            name: "file".to_owned(),
            perm: FileMode(0o644),
            mode: om::RDWR,
        },
        Fcall::RCreate { qid, iounit: 0 },
        Fcall::TRead {
            fid: 1,
            offset: 128,
            count: 4085,
        },
        Fcall::RRead {
            data: Data(b"hello".to_vec()),
        },
        Fcall::TWrite {
            fid: 1,
            offset: 0,
            data: Data(vec![0xAB; 300]),
        },
        Fcall::RWrite { count: 300 },
        Fcall::TClunk { fid: 1 },
        Fcall::RClunk,
        Fcall::TRemove { fid: 1 },
        Fcall::RRemove,
        Fcall::TStat { fid: 1 },
        Fcall::RStat {
            stat: sample_stat(),
        },
        Fcall::TWStat {
            fid: 1,
            stat: sample_stat(),
        },
        Fcall::RWStat,
    ];

    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| Msg {
            tag: i as u16,
            body,
        })
        .collect()
}

#[test]
fn every_kind_round_trips() {
    for expected in sample_msgs() {
        let mut buf = Vec::new();
        let written = expected.encode(&mut buf).unwrap();
        assert_eq!(written, buf.len());

        let actual = read_msg(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(expected, actual, "{:?}", MsgType::from(&expected.body));

        let mut again = Vec::new();
        actual.encode(&mut again).unwrap();
        assert_eq!(buf, again, "{:?}", MsgType::from(&expected.body));
    }
}

#[test]
fn size_of_matches_bytes_written() {
    for msg in sample_msgs() {
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        assert_eq!(size_of(&msg).unwrap() as usize, buf.len());
    }
}

#[test]
fn stat_size_matches_wire() {
    let stat = sample_stat();
    let mut buf = Vec::new();
    let written = stat.encode(&mut buf).unwrap();
    assert_eq!(written, buf.len());
    assert_eq!(stat.size() as usize, written - 2);
}

#[test]
fn stat_decode_rejects_lying_size() {
    let mut buf = Vec::new();
    sample_stat().encode(&mut buf).unwrap();

    // Shrink the declared size so the strings run past it.
    buf[0] = 39;
    buf[1] = 0;
    match Stat::decode(&mut Cursor::new(&buf)) {
        Err(Error::StatTooLarge) => {}
        other => panic!("expected StatTooLarge, got {:?}", other),
    }

    // Grow the declared size past the end of the buffer.
    buf[0] = 0xFF;
    buf[1] = 0xFF;
    match Stat::decode(&mut Cursor::new(&buf)) {
        Err(Error::StatTooLarge) => {}
        other => panic!("expected StatTooLarge, got {:?}", other),
    }
}

#[test]
fn unknown_type_code_is_rejected() {
    let buf = [106u8, 0, 0];
    match read_msg(&mut Cursor::new(&buf)) {
        Err(Error::InvalidMessageType(106)) => {}
        other => panic!("expected InvalidMessageType, got {:?}", other),
    }
}
