#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the 9P2000 file
//! service protocol: the wire codec, a multiplexing client, and a server
//! whose requests are resolved against an abstract [`FileSystem`].
//!
//! # Overview
//!
//! 9P is the file protocol of the Plan 9 distributed operating system. It
//! is synchronous and tagged: a client navigates a remote file tree using
//! per-session handles (fids) and issues reads and writes against them,
//! with every request carrying a tag that its reply echoes, so one
//! connection can serve many concurrent callers.
//!
//! # Client
//!
//! A [`Client`] owns a connection and hands out [`Remote`] handles, which
//! behave much like files:
//!
//! ```no_run
//! use ninep::{om, Client, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::dial("localhost:9999").await?;
//!     client.handshake(8192).await?;
//!
//!     let root = client.attach(None, "anyone", "/").await?;
//!     let file = root.open("some/file", om::READ).await?;
//!
//!     let mut buf = vec![0; file.stat().await?.length as usize];
//!     file.read(&mut buf).await?;
//!
//!     file.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Reads and writes larger than the negotiated message size are split
//! into chunks transparently.
//!
//! # Server
//!
//! To serve a file hierarchy, implement [`FileSystem`] (or use the
//! local-directory adaptor [`Dir`]) and hand it to [`srv::srv_async`]:
//!
//! ```no_run
//! use ninep::{srv::srv_async, Dir, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(Dir::new("/srv/export"), "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! The per-session bookkeeping — fid tables, qid identities, open files,
//! directory read cursors — is handled by [`FsHandler`]; servers with
//! needs beyond a [`FileSystem`] can implement
//! [`srv::MessageHandler`] directly.
//!
//! # Protocol details
//!
//! 1. **Version negotiation**: the client sends `Tversion`, the server
//!    answers with the agreed maximum message size. Nothing else may be
//!    exchanged first, and the msize cannot be renegotiated.
//! 2. **Authentication** (optional): `Tauth` establishes an auth file to
//!    converse with; this library plumbs the handles but imposes no
//!    scheme (see [`Authenticated`]).
//! 3. **Attach**: `Tattach` binds a fid to the root of a named tree.
//! 4. **Operations**: walk, open, create, read, write, stat, wstat,
//!    remove.
//! 5. **Cleanup**: fids are released with `Tclunk`.
//!
//! `Tflush` is answered with an error by the bundled handler; it has no
//! way to cancel an in-flight operation on a [`File`].

pub mod client;
pub mod dir;
pub mod error;
pub mod fcall;
pub mod fs;
pub mod proto;
pub mod remote;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::client::Client;
pub use crate::dir::Dir;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fs::{Authenticated, Authenticator, File, FileSystem, FsHandler, ReadOnly};
pub use crate::remote::Remote;
pub use crate::utils::Result;
