use std::collections::{hash_map::Entry, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, io::prelude::*, thread, thread::JoinHandle};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use log::{debug, error, info, warn};

use crate::error::Error;
use super::{backoff::{ExponentialBackoff, Retry}, comm::Communicator, util};

const CXN_R_TIMEOUT_MS: Duration = Duration::from_millis(250);
const CXN_W_TIMEOUT_MS: Duration = Duration::from_millis(5000);
const ACK_TIMEOUT_MS: Duration = Duration::from_millis(5000);
const ACCEPT_POLL_MS: Duration = Duration::from_millis(10);
const RETRY_WAIT_MS: Duration = Duration::from_millis(50);
const RETRY_MAX_WAIT_MS: Duration = Duration::from_millis(2000);
const SEND_ATTEMPTS: usize = 24;
const MAX_FRAME_BYTES: usize = 1 << 30;

type Sender = crossbeam_channel::Sender<(usize, Vec<u8>)>;
type Receiver = crossbeam_channel::Receiver<Vec<u8>>;
type Failure = Arc<Mutex<Option<String>>>;

/// A communicator for ranks in separate processes (or threads) that reach
/// each other over TCP. Each rank listens on its own address in `peers`.
///
/// Outgoing messages are queued and written by a single background thread,
/// one at a time: each one is prefixed with its length, and the receiver
/// acknowledges it by echoing that length. A message that is not
/// acknowledged is resent on a fresh connection, with exponential backoff
/// between attempts. When the attempts run out, the failure is reported by
/// the next call to `send` or `try_recv`.
///
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: Option<Sender>,
    recv_src: Receiver,
    failure: Failure,
    shutdown: Arc<AtomicBool>,
    send_thread: Option<JoinHandle<()>>,
    listen_thread: Option<JoinHandle<()>>,
}

impl TcpCommunicator {
    /// Bind this rank's address in `peers` and start the background
    /// threads.
    ///
    pub fn connect(rank: usize, peers: Vec<SocketAddr>) -> Result<Self, Error> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| Error::Transport(format!("rank {} has no address among {} peers", rank, peers.len())))?;
        let listener = TcpListener::bind(addr)?;
        Self::from_listener(rank, listener, peers)
    }

    /// Start the background threads, using a listener that is already bound
    /// to this rank's address. Binding first lets a caller pick free ports
    /// (by binding to port 0) before the peer list is known.
    ///
    pub fn from_listener(rank: usize, listener: TcpListener, peers: Vec<SocketAddr>) -> Result<Self, Error> {
        if rank >= peers.len() {
            return Err(Error::Transport(format!("rank {} has no address among {} peers", rank, peers.len())))
        }
        listener.set_nonblocking(true)?;
        info!("rank {} listening on {}", rank, listener.local_addr()?);

        let failure = Failure::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let num_peers = peers.len();

        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(peers, send_src, failure.clone());
        let listen_thread = Self::start_listener(listener, recv_sink, shutdown.clone());

        Ok(Self {
            rank,
            num_peers,
            send_sink: Some(send_sink),
            recv_src,
            failure,
            shutdown,
            send_thread: Some(send_thread),
            listen_thread: Some(listen_thread),
        })
    }

    fn check_failure(&self) -> Result<(), Error> {
        match self.failure.lock() {
            Ok(failure) => match failure.as_ref() {
                Some(msg) => Err(Error::Transport(msg.clone())),
                None => Ok(()),
            },
            Err(_) => Err(Error::Transport("sender thread panicked".to_string())),
        }
    }

    fn start_serial_sender(
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>,
        failure: Failure,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                if let Err(e) = Self::deliver(&mut table, rank, peers[rank], &message) {
                    error!("failed to send {} bytes to rank {} at {}: {}", message.len(), rank, peers[rank], e);

                    if let Ok(mut failure) = failure.lock() {
                        *failure = Some(format!("could not reach rank {} at {}: {}", rank, peers[rank], e))
                    }
                    break;
                }
            }
        })
    }

    fn deliver(table: &mut HashMap<usize, TcpStream>, rank: usize, addr: SocketAddr, message: &[u8]) -> io::Result<()> {
        let mut attempts = ExponentialBackoff::new(RETRY_WAIT_MS, RETRY_MAX_WAIT_MS, 2).take(SEND_ATTEMPTS);

        attempts
            .retry(
                || {
                    let result = match table.entry(rank) {
                        Entry::Occupied(entry) => Self::write_message(entry.into_mut(), message),
                        Entry::Vacant(entry) => Self::write_message(entry.insert(Self::open(addr)?), message),
                    };
                    if result.is_err() {
                        table.remove(&rank);
                    }
                    result
                },
                |e, delay| {
                    warn!("send to {} failed ({}), retrying in {:?}", addr, e, delay);
                    thread::sleep(delay)
                })
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Other, "no send attempts were made")))
    }

    fn open(addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(ACK_TIMEOUT_MS))?;
        stream.set_write_timeout(Some(CXN_W_TIMEOUT_MS))?;
        stream.set_nodelay(true)?;
        debug!("connected to {}", addr);
        Ok(stream)
    }

    fn write_message(client: &mut TcpStream, message: &[u8]) -> io::Result<()> {
        let msg_sz = message.len();
        client.write_all(&msg_sz.to_le_bytes())?;
        client.write_all(message)?;

        let ack = util::read_usize(client)?;

        if ack != msg_sz {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("sent {} bytes but the receiver acknowledged {}", msg_sz, ack)))
        }
        Ok(())
    }

    fn start_listener(
        listener: TcpListener,
        recv_sink: crossbeam_channel::Sender<Vec<u8>>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut readers = Vec::new();

            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, remote)) => {
                        match Self::handle_connection(stream, remote, recv_sink.clone(), shutdown.clone()) {
                            Ok(reader) => readers.push(reader),
                            Err(e) => error!("could not accept connection from {}: {}", remote, e),
                        }
                    }
                    Err(e) if util::is_timeout(&e) => thread::sleep(ACCEPT_POLL_MS),
                    Err(e) => {
                        error!("listener failed: {}", e);
                        break;
                    }
                }
            }
            for reader in readers {
                let _ = reader.join();
            }
        })
    }

    fn handle_connection(
        mut stream: TcpStream,
        remote: SocketAddr,
        recv_sink: crossbeam_channel::Sender<Vec<u8>>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        debug!("receiving connection from {}", remote);
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(CXN_R_TIMEOUT_MS))?;
        stream.set_write_timeout(Some(CXN_W_TIMEOUT_MS))?;

        Ok(thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let result = util::read_usize(&mut stream)
                    .and_then(|size| {
                        if size > MAX_FRAME_BYTES {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("frame of {} bytes exceeds the limit of {}", size, MAX_FRAME_BYTES)))
                        }
                        util::read_payload(&mut stream, size, || !shutdown.load(Ordering::Relaxed))
                    })
                    .and_then(|bytes| {
                        let num_bytes = bytes.len();
                        recv_sink
                            .send(bytes)
                            .map(|()| num_bytes)
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
                    })
                    .and_then(|size| stream.write_all(&size.to_le_bytes()));

                match result {
                    Ok(()) => {}
                    Err(e) if util::is_timeout(&e) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!("connection from {} closed", remote);
                        break;
                    }
                    Err(e) => {
                        error!("connection from {} failed: {}", remote, e);
                        break;
                    }
                }
            }
        }))
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<(), Error> {
        self.check_failure()?;

        if rank >= self.num_peers {
            return Err(Error::Transport(format!("no rank {} among {} peers", rank, self.num_peers)))
        }
        match self.send_sink.as_ref() {
            Some(sink) => sink
                .send((rank, message))
                .map_err(|_| Error::Transport("sender thread has exited".to_string())),
            None => Err(Error::Transport("communicator is shutting down".to_string())),
        }
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, Error> {
        self.check_failure()?;

        match self.recv_src.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Transport("listener has exited".to_string())),
        }
    }

    fn recv(&self) -> Result<Vec<u8>, Error> {
        loop {
            self.check_failure()?;

            match self.recv_src.recv_timeout(CXN_R_TIMEOUT_MS) {
                Ok(message) => return Ok(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Transport("listener has exited".to_string())),
            }
        }
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take();

        if let Some(thread) = self.send_thread.take() {
            let _ = thread.join();
        }
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(thread) = self.listen_thread.take() {
            let _ = thread.join();
        }
    }
}
