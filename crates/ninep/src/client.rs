//! Asynchronous 9P2000 client multiplexer.
//!
//! A [`Client`] owns one connection and shares it between any number of
//! concurrent callers. Two tasks cooperate behind the scenes: a reader that
//! pulls framed messages off the transport, and a coordinator that owns the
//! tag table and the tag/fid generators. Callers never touch those tables;
//! they ask the coordinator for a tag, register a reply slot under it, and
//! block on the slot until the reader delivers the matching response.

use crate::error::Error;
use crate::fcall::*;
use crate::proto;
use crate::res;
use crate::utils::{self, Addr, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// The msize assumed until the version handshake has settled on one.
const PRE_NEGOTIATION_MSIZE: u32 = 1024;

type ReplySlot = oneshot::Sender<Fcall>;

/// Events serviced by the coordinator task.
enum Event {
    /// A sender claims the next free tag.
    NextTag(oneshot::Sender<u16>),
    /// A sender claims the next free fid.
    NextFid(oneshot::Sender<u32>),
    /// A sender registers the reply slot for an in-flight tag.
    Register(u16, ReplySlot),
    /// The reader delivers a response.
    Deliver(Msg),
}

struct Shared {
    events: mpsc::Sender<Event>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    msize: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A 9P2000 client.
///
/// `Client` is cheap to clone; all clones share the same connection.
/// Requests may be sent from any number of tasks concurrently — replies are
/// correlated by tag, not by ordering. Dropping the last clone (or calling
/// [`Client::close`]) cancels the background tasks and fails any requests
/// that are still waiting.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Take ownership of `stream` and start the reader and coordinator
    /// tasks for it.
    pub fn new<S>(stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        let (events, queue) = mpsc::channel(64);
        let msize = Arc::new(AtomicU32::new(PRE_NEGOTIATION_MSIZE));
        let cancel = CancellationToken::new();

        tokio::spawn(read_loop(
            Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>,
            events.clone(),
            msize.clone(),
            cancel.clone(),
        ));
        tokio::spawn(coordinate(queue, cancel.clone()));

        Client {
            shared: Arc::new(Shared {
                events,
                writer: Mutex::new(Box::new(writer)),
                msize,
                cancel,
            }),
        }
    }

    /// Connect to `addr` and create a client for the connection. See
    /// [`utils::parse_addr`] for the accepted address forms.
    pub async fn dial(addr: &str) -> Result<Client> {
        match utils::parse_addr(addr)? {
            Addr::Tcp(addr) => Ok(Client::new(TcpStream::connect(addr).await?)),
            Addr::Unix(path) => Ok(Client::new(UnixStream::connect(path).await?)),
        }
    }

    /// Cancel the background tasks. Requests that have not yet received
    /// their reply fail with [`Error::ClientClosed`].
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// The maximum message size currently in effect.
    pub fn msize(&self) -> u32 {
        self.shared.msize.load(Ordering::SeqCst)
    }

    /// Perform the initial version handshake, establishing the maximum
    /// allowed message size. A handshake must be performed before any other
    /// request is sent.
    pub async fn handshake(&self, msize: u32) -> Result<u32> {
        match self
            .send(Fcall::TVersion {
                msize,
                version: P92000.to_owned(),
            })
            .await?
        {
            Fcall::RVersion { msize, version } if version == P92000 => Ok(msize),
            Fcall::RVersion { .. } => Err(Error::UnsupportedVersion),
            rsp => res!(format!("unexpected response: {:?}", MsgType::from(&rsp))),
        }
    }

    /// Send a request to the server, blocking until its response arrives.
    ///
    /// Safe to call from many tasks at once; replies may come back in any
    /// order and are matched to callers by tag. An `Rerror` response is
    /// surfaced as [`Error::Message`] carrying the `ename` string.
    pub async fn send(&self, body: Fcall) -> Result<Fcall> {
        debug!("-> {:?}", MsgType::from(&body));

        let tag = match body {
            Fcall::TVersion { .. } => NOTAG,
            _ => self.next_tag().await?,
        };

        let (slot, reply) = oneshot::channel();
        self.shared
            .events
            .send(Event::Register(tag, slot))
            .await
            .map_err(|_| Error::ClientClosed)?;

        {
            let mut writer = self.shared.writer.lock().await;
            proto::send(&mut *writer, &Msg { tag, body }).await?;
        }

        let rsp = reply.await.map_err(|_| Error::ClientClosed)?;
        debug!("<- {:?}", MsgType::from(&rsp));

        match rsp {
            Fcall::RError { ename } => Err(Error::Message(ename)),
            rsp => Ok(rsp),
        }
    }

    async fn next_tag(&self) -> Result<u16> {
        let (slot, tag) = oneshot::channel();
        self.shared
            .events
            .send(Event::NextTag(slot))
            .await
            .map_err(|_| Error::ClientClosed)?;
        tag.await.map_err(|_| Error::ClientClosed)
    }

    pub(crate) async fn next_fid(&self) -> Result<u32> {
        let (slot, fid) = oneshot::channel();
        self.shared
            .events
            .send(Event::NextFid(slot))
            .await
            .map_err(|_| Error::ClientClosed)?;
        fid.await.map_err(|_| Error::ClientClosed)
    }
}

/// Reader half: pulls framed messages off the transport and hands them to
/// the coordinator. Cancellation wakes the idle read immediately; a read
/// abandoned that way may lose partial bytes, but only on the way out.
async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    events: mpsc::Sender<Event>,
    msize: Arc<AtomicU32>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = proto::receive(&mut reader, msize.load(Ordering::SeqCst)) => received,
        };

        let msg = match received {
            Ok(msg) => msg,
            Err(err) if err.is_eof() => return,
            Err(Error::Io(err)) => {
                warn!("read: {}", err);
                return;
            }
            Err(Error::MessageTooLarge) => {
                // The frame body was never consumed; the stream can no
                // longer be trusted to be aligned on a frame boundary.
                warn!("read: oversized frame, closing");
                return;
            }
            Err(err) => {
                // The frame was fully consumed but failed to decode;
                // framing is still coherent, so drop it and carry on.
                warn!("read: dropping frame: {}", err);
                continue;
            }
        };

        // The negotiated msize must be visible to this loop before the
        // reply reaches the caller that performed the handshake.
        if let Fcall::RVersion { msize: m, .. } = &msg.body {
            msize.store(*m, Ordering::SeqCst);
        }

        if events.send(Event::Deliver(msg)).await.is_err() {
            return;
        }
    }
}

/// Coordinator half: the single owner of the tag table and the tag/fid
/// generators.
async fn coordinate(mut queue: mpsc::Receiver<Event>, cancel: CancellationToken) {
    let mut slots: HashMap<u16, ReplySlot> = HashMap::new();
    let mut next_tag: u16 = 0;
    let mut next_fid: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = queue.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            Event::NextTag(slot) => {
                // Skip tags still in flight, and the NOTAG sentinel.
                while next_tag == NOTAG || slots.contains_key(&next_tag) {
                    next_tag = next_tag.wrapping_add(1);
                }
                let _ = slot.send(next_tag);
                next_tag = next_tag.wrapping_add(1);
            }

            Event::NextFid(slot) => {
                if next_fid == NOFID {
                    next_fid = next_fid.wrapping_add(1);
                }
                let _ = slot.send(next_fid);
                next_fid = next_fid.wrapping_add(1);
            }

            Event::Register(tag, slot) => {
                slots.insert(tag, slot);
            }

            Event::Deliver(msg) => match slots.remove(&msg.tag) {
                // A dropped receiver just means the sender gave up.
                Some(slot) => {
                    let _ = slot.send(msg.body);
                }
                None => debug!("dropping reply with unknown tag {}", msg.tag),
            },
        }
    }
}
