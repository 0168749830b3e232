//! Asynchronous server side 9P library.
//!
//! The dispatch loop applies the 9P session rules: the version handshake
//! runs strictly in order, and once an `Rversion` has been sent every
//! later request is handled on its own task — replies are correlated by
//! tag, so their order on the wire does not matter.

use crate::error::Error;
use crate::fcall::{Fcall, Msg, MsgType, P92000};
use crate::fs::{FileSystem, FsHandler};
use crate::proto;
use crate::utils::{self, Result};
use crate::{io_err, res};
use async_trait::async_trait;
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;

/// The largest message size a server built by [`srv_async`] offers during
/// version negotiation.
pub const DEFAULT_MSIZE: u32 = 64 * 1024;

/// A client that caps its payloads at `msize - 11` bytes produces `Twrite`
/// frames of up to `msize + 12` bytes, since the write header is 23 bytes
/// (size, type, tag, fid, offset, count), not 11. The read pump allows for
/// that difference rather than rejecting maximal writes.
const TWRITE_SLACK: u32 = 12;

/// Turns one 9P request into its reply.
///
/// One handler instance serves one connection; its state is the session
/// state. After version negotiation, `handle_message` is invoked from
/// concurrently running tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the reply for `msg`. Failures must be reported as
    /// `Rerror`, not by panicking.
    async fn handle_message(&self, msg: Fcall) -> Fcall;

    /// Called once when the connection goes away, ordinarily or not.
    async fn close(&self) {}
}

/// Run a handler invocation on its own task so that a panicking handler
/// poisons neither the connection loop nor its peers.
async fn dispatch<H>(handler: Arc<H>, msg: Fcall) -> Fcall
where
    H: MessageHandler + 'static,
{
    let typ = MsgType::from(&msg);

    match tokio::spawn(async move { handler.handle_message(msg).await }).await {
        Ok(reply) => reply,
        Err(err) => {
            error!("handler for {:?} failed: {}", typ, err);
            Fcall::RError {
                ename: "internal server error".to_owned(),
            }
        }
    }
}

/// Serve one connection with the given handler.
///
/// Until version negotiation completes, requests are handled one at a
/// time and any declared frame size is accepted (the `Tversion` has to
/// be readable before an msize exists). Once the `Rversion` reply is on
/// the wire, the negotiated msize bounds every later frame and requests
/// are dispatched concurrently. The mode switch never regresses.
pub async fn serve_conn<S, H>(stream: S, handler: Arc<H>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: MessageHandler + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    let mut msize: u32 = 0;
    let mut concurrent = false;

    let result = loop {
        let limit = match msize {
            0 => 0,
            msize => msize.saturating_add(TWRITE_SLACK),
        };
        let msg = match proto::receive(&mut reader, limit).await {
            Ok(msg) => msg,
            Err(err) if err.is_eof() => break Ok(()),
            Err(err @ Error::Io(_)) | Err(err @ Error::MessageTooLarge) => break Err(err),
            Err(err) => {
                // The frame was consumed whole; drop it and keep going.
                debug!("dropping frame: {}", err);
                continue;
            }
        };
        debug!("← {:?}", MsgType::from(&msg.body));

        if concurrent {
            let handler = handler.clone();
            let writer = writer.clone();

            tokio::spawn(async move {
                let reply = Msg {
                    tag: msg.tag,
                    body: dispatch(handler, msg.body).await,
                };
                debug!("→ {:?}", MsgType::from(&reply.body));

                if let Err(err) = proto::send(&mut *writer.lock().await, &reply).await {
                    error!("failed to send reply for tag {}: {}", reply.tag, err);
                }
            });
            continue;
        }

        let reply = Msg {
            tag: msg.tag,
            body: dispatch(handler.clone(), msg.body).await,
        };
        debug!("→ {:?}", MsgType::from(&reply.body));

        if let Err(err) = proto::send(&mut *writer.lock().await, &reply).await {
            break Err(err);
        }

        if let Fcall::RVersion {
            msize: negotiated,
            ref version,
        } = reply.body
        {
            if version == P92000 {
                msize = negotiated;
                concurrent = true;
                debug!("negotiated msize {}, going concurrent", negotiated);
            }
        }
    };

    handler.close().await;
    let _ = writer.lock().await.shutdown().await;

    result
}

/// Accept connections from `listener` forever, creating a fresh handler
/// per connection from `factory` and serving each on its own task.
pub async fn serve_tcp<F, H>(listener: TcpListener, factory: F) -> Result<()>
where
    F: Fn() -> H,
    H: MessageHandler + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let handler = Arc::new(factory());
        tokio::spawn(async move {
            if let Err(err) = serve_conn(stream, handler).await {
                error!("connection error: {}", err);
            }
        });
    }
}

/// Unix-socket flavor of [`serve_tcp`]. The socket file is removed when
/// the listener is dropped.
pub async fn serve_unix<F, H>(listener: DeleteOnDrop, factory: F) -> Result<()>
where
    F: Fn() -> H,
    H: MessageHandler + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let handler = Arc::new(factory());
        tokio::spawn(async move {
            if let Err(err) = serve_conn(stream, handler).await {
                error!("connection error: {}", err);
            }
        });
    }
}

/// A `UnixListener` that removes its socket file on drop.
pub struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    pub fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: failed to remove socket file {:?}: {}",
                self.path, err
            );
        }
    }
}

/// Serve `filesystem` at `addr`, which uses the `proto!address!port` form
/// (e.g. `tcp!0.0.0.0!564` or `unix!/tmp/ninep.sock`). Each connection
/// gets its own [`FsHandler`] session over the shared filesystem.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: FileSystem + 'static,
{
    let fs = Arc::new(filesystem);

    match utils::parse_proto(addr) {
        Some(("tcp", addr)) => {
            let listener = TcpListener::bind(&addr).await?;
            serve_tcp(listener, move || FsHandler::new(fs.clone(), DEFAULT_MSIZE)).await
        }
        Some(("unix", path)) => {
            let listener = DeleteOnDrop::bind(&path)?;
            serve_unix(listener, move || FsHandler::new(fs.clone(), DEFAULT_MSIZE)).await
        }
        _ => res!(io_err!(InvalidInput, "Invalid protocol or address")),
    }
}
