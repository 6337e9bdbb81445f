use crossbeam_channel::{Receiver, Sender, bounded};
use std::io::{self, BufRead, BufReader, BufWriter, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::codec::{DELIMITER, MAX_FRAME_LEN, decode_frame, handshake, write_frame};
use crate::{Message, NetError};

/// Bounds on how often the reader wakes to check the idle clock.
const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(250);

/// Per-connection settings shared by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// How long the connection may go without a successful read or write in
    /// either direction before it is dropped. Zero disables the deadline.
    pub idle_timeout: Duration,
    /// Capacity of the inbound and outbound queues. Full queues block.
    pub queue_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            queue_capacity: 100,
        }
    }
}

impl TunnelConfig {
    fn deadline(&self) -> Option<Duration> {
        (!self.idle_timeout.is_zero()).then_some(self.idle_timeout)
    }
}

/// Time of the last successful I/O on a connection, in either direction.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_ms.fetch_max(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}

/// One framed connection to a peer.
///
/// The core only reads [`incoming`](Self::incoming), writes
/// [`outgoing`](Self::outgoing) and watches [`closed`](Self::closed).
/// Dropping the tunnel shuts the socket down, which ends both I/O threads.
#[derive(Debug)]
pub struct Tunnel {
    peer_id: Uuid,
    peer_addr: Option<SocketAddr>,
    incoming: Receiver<Message>,
    outgoing: Sender<Message>,
    closed: Receiver<()>,
    stream: TcpStream,
}

impl Tunnel {
    /// Handshake over a connected stream and start the I/O threads.
    pub fn open(mut stream: TcpStream, own_id: Uuid, config: TunnelConfig) -> Result<Self, NetError> {
        let deadline = config.deadline();
        stream.set_read_timeout(deadline)?;
        stream.set_write_timeout(deadline)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();

        let peer_id = handshake(&mut stream, own_id)?;

        // The reader wakes periodically to compare the shared idle clock
        // against the deadline; a single stalled write still fails on its own.
        stream.set_read_timeout(deadline.map(|d| (d / 4).clamp(MIN_POLL, MAX_POLL)))?;
        let activity = Arc::new(Activity::new());

        let capacity = config.queue_capacity.max(1);
        let (in_tx, incoming) = bounded(capacity);
        let (outgoing, out_rx) = bounded(capacity);
        // Room for both threads to signal without blocking.
        let (closed_tx, closed) = bounded(2);

        let reader = Reader {
            stream: stream.try_clone()?,
            peer: peer_id,
            deadline,
            activity: Arc::clone(&activity),
        };
        let writer = stream.try_clone()?;
        let reader_closed = closed_tx.clone();
        thread::Builder::new()
            .name(format!("tunnel-rx-{peer_id}"))
            .spawn(move || reader.run(in_tx, reader_closed))?;
        thread::Builder::new()
            .name(format!("tunnel-tx-{peer_id}"))
            .spawn(move || transmit(writer, peer_id, activity, out_rx, closed_tx))?;

        tracing::info!(peer = %peer_id, addr = ?peer_addr, "tunnel open");
        Ok(Self {
            peer_id,
            peer_addr,
            incoming,
            outgoing,
            closed,
            stream,
        })
    }

    /// Identity the peer announced during the handshake.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Decoded frames from the peer. Disconnects when the reader stops.
    pub fn incoming(&self) -> &Receiver<Message> {
        &self.incoming
    }

    /// Frames queued for the peer, written in order.
    pub fn outgoing(&self) -> &Sender<Message> {
        &self.outgoing
    }

    /// Receives once per I/O thread that stopped.
    pub fn closed(&self) -> &Receiver<()> {
        &self.closed
    }

    /// Queue a message, blocking while the outbound queue is full.
    pub fn send(&self, message: Message) -> Result<(), NetError> {
        self.outgoing.send(message).map_err(|_| NetError::Closed)
    }

    /// Shut the socket down in both directions. Idempotent.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer_id, error = %e, "shutdown on closed socket");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

struct Reader {
    stream: TcpStream,
    peer: Uuid,
    deadline: Option<Duration>,
    activity: Arc<Activity>,
}

impl Reader {
    fn run(self, incoming: Sender<Message>, closed: Sender<()>) {
        let Reader {
            stream,
            peer,
            deadline,
            activity,
        } = self;
        let mut reader = BufReader::new(stream);
        // Survives poll timeouts, so a frame may arrive across several reads.
        let mut frame = Vec::new();
        loop {
            let before = frame.len();
            let room = (MAX_FRAME_LEN - before) as u64;
            let read = reader.by_ref().take(room).read_until(DELIMITER, &mut frame);
            if frame.len() > before {
                activity.touch();
            }
            match read {
                Ok(0) => {
                    tracing::debug!(%peer, "peer hung up");
                    break;
                }
                Ok(_) => {}
                Err(e) if is_poll_timeout(&e) => {
                    if deadline.is_some_and(|d| activity.idle_for() >= d) {
                        tracing::debug!(%peer, "idle timeout");
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "read failed");
                    break;
                }
            }

            if frame.last() != Some(&DELIMITER) {
                if frame.len() >= MAX_FRAME_LEN {
                    tracing::warn!(%peer, limit = MAX_FRAME_LEN, "frame too long, disconnecting");
                    break;
                }
                // End of stream mid-frame; the next read reports it.
                continue;
            }
            if frame != [DELIMITER] {
                match decode_frame(&frame) {
                    Ok(message) => {
                        if incoming.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "skipping malformed frame"),
                }
            }
            frame.clear();
        }
        let _ = reader.get_ref().shutdown(Shutdown::Both);
        let _ = closed.try_send(());
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn transmit(
    stream: TcpStream,
    peer: Uuid,
    activity: Arc<Activity>,
    outgoing: Receiver<Message>,
    closed: Sender<()>,
) {
    let mut writer = BufWriter::new(stream);
    for message in outgoing.iter() {
        if let Err(e) = write_frame(&mut writer, &message) {
            tracing::debug!(%peer, error = %e, "write failed");
            break;
        }
        activity.touch();
        tracing::trace!(%peer, content_type = %message.content_type, "sent");
    }
    let _ = writer.get_ref().shutdown(Shutdown::Both);
    let _ = closed.try_send(());
}

/// Accepts connections and turns each into a [`Tunnel`].
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    server_id: Uuid,
    config: TunnelConfig,
}

impl Listener {
    pub fn bind(
        addr: impl ToSocketAddrs,
        server_id: Uuid,
        config: TunnelConfig,
    ) -> Result<Self, NetError> {
        let inner = TcpListener::bind(addr)?;
        Ok(Self {
            inner,
            server_id,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept and handshake a single connection on the calling thread.
    pub fn accept(&self) -> Result<Tunnel, NetError> {
        let (stream, _) = self.inner.accept()?;
        Tunnel::open(stream, self.server_id, self.config)
    }

    /// Accept forever on a background thread.
    ///
    /// Each handshake runs on its own thread so a stalled peer cannot hold
    /// up the others. Failed handshakes are logged and dropped. Once a
    /// finished tunnel finds the returned receiver gone, the thread exits
    /// at its next accept.
    pub fn spawn(self) -> Result<Receiver<Tunnel>, NetError> {
        let (tx, rx) = bounded(self.config.queue_capacity.max(1));
        let addr = self.local_addr()?;
        let consumer_gone = Arc::new(AtomicBool::new(false));
        thread::Builder::new()
            .name("tunnel-accept".into())
            .spawn(move || {
                tracing::info!(%addr, "accepting tunnels");
                for stream in self.inner.incoming() {
                    if consumer_gone.load(Ordering::Acquire) {
                        tracing::info!(%addr, "tunnel consumer gone, no longer accepting");
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let tx = tx.clone();
                    let gone = Arc::clone(&consumer_gone);
                    let (server_id, config) = (self.server_id, self.config);
                    let spawned = thread::Builder::new().name("tunnel-handshake".into()).spawn(
                        move || match Tunnel::open(stream, server_id, config) {
                            Ok(tunnel) => {
                                if tx.send(tunnel).is_err() {
                                    gone.store(true, Ordering::Release);
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "handshake failed"),
                        },
                    );
                    if let Err(e) = spawned {
                        tracing::warn!(error = %e, "could not start handshake thread");
                    }
                }
            })?;
        Ok(rx)
    }
}

/// Connect to a server and handshake as `client_id`.
pub fn dial(addr: impl ToSocketAddrs, client_id: Uuid, config: TunnelConfig) -> Result<Tunnel, NetError> {
    let stream = TcpStream::connect(addr)?;
    Tunnel::open(stream, client_id, config)
}
