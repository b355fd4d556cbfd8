//! The dispatcher (§4.5): owns the main listening socket and the map from
//! peer tuple to ephemeral sub-server, and drives every in-flight
//! [`Transfer`] from socket readiness and retransmission deadlines via a
//! single [`mio::Poll`].
//!
//! This collapses the source's per-transfer listener threads into one
//! cooperative event loop (§5): every transfer gets its own ephemeral UDP
//! socket (preserving the RFC 1350 TID contract) but no OS thread.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use nobodd_tftp::error_codes::{
    ERR_ACCESS_VIOLATION, ERR_FILE_NOT_FOUND, ERR_ILLEGAL_OPERATION, ERR_UNDEFINED,
    ERR_UNKNOWN_TID,
};
use nobodd_tftp::{Mode, NetasciiEncoder, Packet, StepResult, Transfer};

use crate::bootserver::BootServer;
use crate::error::ResolutionError;

const MAIN_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const FIRST_TRANSFER_TOKEN: usize = 2;

/// A TFTP datagram can be at most a 2-byte opcode plus a 64KB-ish UDP
/// payload; 65535 (max UDP payload) plus slack comfortably covers any
/// negotiated `blksize` up to the RFC 2347 ceiling of 65464.
const MAX_DATAGRAM: usize = 65535;

struct Active {
    socket: UdpSocket,
    peer: SocketAddr,
    transfer: Transfer,
}

/// The outcome of one iteration of the event loop, surfaced to `main` so it
/// can act on process-level concerns (config reload, shutdown) that the
/// dispatcher itself has no business deciding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Reload,
    /// Carries the signal that triggered shutdown so `main` can pick the
    /// right exit code (128+signal, conventionally 130 for `SIGINT`).
    Shutdown(i32),
}

pub struct Dispatcher {
    poll: Poll,
    events: Events,
    main_socket: UdpSocket,
    bind_ip: std::net::IpAddr,
    boot_server: Rc<BootServer>,
    transfers: HashMap<Token, Active>,
    peer_index: HashMap<SocketAddr, Token>,
    next_token: usize,
}

fn send_packet(socket: &UdpSocket, peer: SocketAddr, packet: &Packet) {
    let bytes = packet.encode();
    if let Err(e) = socket.send_to(&bytes, peer) {
        warn!("failed to send {} bytes to {peer}: {e}", bytes.len());
    }
}

fn send_error(socket: &UdpSocket, peer: SocketAddr, code: u16, message: &str) {
    send_packet(
        socket,
        peer,
        &Packet::Error {
            code,
            message: message.to_string(),
        },
    );
}

impl Dispatcher {
    /// Build a dispatcher around an already-bound main socket (the caller
    /// resolves `--listen`/`--port`, including the `stdin`/`systemd` fd
    /// inheritance forms, before constructing one of these).
    pub fn new(mut main_socket: UdpSocket, boot_server: Rc<BootServer>) -> io::Result<Dispatcher> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut main_socket, MAIN_TOKEN, Interest::READABLE)?;
        let bind_ip = main_socket.local_addr()?.ip();
        Ok(Dispatcher {
            poll,
            events: Events::with_capacity(128),
            main_socket,
            bind_ip,
            boot_server,
            transfers: HashMap::new(),
            peer_index: HashMap::new(),
            next_token: FIRST_TRANSFER_TOKEN,
        })
    }

    /// Install the self-pipe `signal_hook` uses to make `SIGTERM`/`SIGINT`/
    /// `SIGHUP` safe to observe from inside the poll loop.
    pub fn watch_signals() -> io::Result<Signals> {
        Signals::new([SIGTERM, SIGINT, SIGHUP])
    }

    pub fn register_signals(&mut self, signals: &mut Signals) -> io::Result<()> {
        self.poll
            .registry()
            .register(signals, SIGNAL_TOKEN, Interest::READABLE)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Run one iteration: block on readiness up to the nearest retransmit
    /// deadline (or 1s, whichever is sooner, so a stalled poll never
    /// silently delays shutdown handling), service whatever fired, then
    /// sweep every transfer whose deadline has now passed.
    pub fn tick(&mut self, signals: &mut Signals) -> io::Result<Tick> {
        let timeout = self
            .next_deadline()
            .unwrap_or(Duration::from_secs(1))
            .min(Duration::from_secs(1));
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Tick::Continue),
            Err(e) => return Err(e),
        }

        let mut outcome = Tick::Continue;
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            match token {
                MAIN_TOKEN => self.drain_main_socket(),
                SIGNAL_TOKEN => {
                    for signal in signals.pending() {
                        match signal {
                            SIGTERM | SIGINT => outcome = Tick::Shutdown(signal),
                            SIGHUP if !matches!(outcome, Tick::Shutdown(_)) => {
                                outcome = Tick::Reload
                            }
                            _ => {}
                        }
                    }
                }
                other => self.handle_transfer_readable(other),
            }
        }
        self.process_timeouts();
        Ok(outcome)
    }

    /// Drain outstanding transfers for up to `grace` before the caller force
    /// -closes everything (§5 cancellation, shutdown case). New RRQs on the
    /// main socket are ignored during drain.
    pub fn drain(&mut self, grace: Duration) -> io::Result<()> {
        let deadline = Instant::now() + grace;
        while !self.transfers.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let timeout = self.next_deadline().unwrap_or(remaining).min(remaining);
            self.poll.poll(&mut self.events, Some(timeout))?;
            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token != MAIN_TOKEN && token != SIGNAL_TOKEN {
                    self.handle_transfer_readable(token);
                }
            }
            self.process_timeouts();
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.transfers
            .values()
            .map(|a| a.transfer.deadline.saturating_duration_since(now))
            .min()
    }

    fn drain_main_socket(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.main_socket.recv_from(&mut buf) {
                Ok((n, peer)) => self.handle_main_datagram(&buf[..n], peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("recv error on main socket: {e}");
                    break;
                }
            }
        }
    }

    fn handle_main_datagram(&mut self, buf: &[u8], peer: SocketAddr) {
        // A peer that is already mid-transfer but (mis)sends to the main
        // port instead of its ephemeral one is still forwarded to its
        // sub-server, per §4.5 -- this is a peer-tuple redirect, not an
        // unknown-TID violation (that check is socket-local, see
        // `handle_transfer_readable`).
        if let Some(&token) = self.peer_index.get(&peer) {
            self.apply_inbound(token, buf);
            return;
        }

        let packet = match Packet::decode(buf) {
            Ok(p) => p,
            Err(e) => {
                debug!("malformed datagram from {peer}: {e}");
                send_error(&self.main_socket, peer, ERR_ILLEGAL_OPERATION, "malformed packet");
                return;
            }
        };

        match packet {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => self.handle_rrq(peer, filename, mode, options),
            Packet::Wrq => {
                send_error(&self.main_socket, peer, ERR_ILLEGAL_OPERATION, "write not supported");
            }
            other => {
                debug!("unexpected {other:?} from {peer} on main socket");
                send_error(
                    &self.main_socket,
                    peer,
                    ERR_ILLEGAL_OPERATION,
                    "expected a read request",
                );
            }
        }
    }

    fn handle_rrq(&mut self, peer: SocketAddr, filename: String, mode: Mode, options: Vec<(String, String)>) {
        let resolved = match self.boot_server.resolve(&filename, peer) {
            Ok(r) => r,
            Err(e) => {
                warn!("RRQ \"{filename}\" from {peer} rejected: {e}");
                send_error(&self.main_socket, peer, resolution_error_code(&e), &e.to_string());
                return;
            }
        };

        let mut reader: Box<dyn Read + Send> = match resolved.fs.open_file(&resolved.path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                error!("{filename}: failed to open resolved path: {e}");
                send_error(&self.main_socket, peer, ERR_UNDEFINED, "filesystem error");
                return;
            }
        };

        let mut size = resolved.size;
        if mode == Mode::NetAscii {
            let tsize_requested = options
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("tsize"));
            if tsize_requested {
                match resolved
                    .fs
                    .open_file(&resolved.path)
                    .map_err(io::Error::other)
                    .and_then(nobodd_tftp::netascii_encoded_length)
                {
                    Ok(n) => size = n,
                    Err(e) => warn!("{filename}: failed to precompute netascii tsize: {e}"),
                }
            }
            reader = Box::new(NetasciiEncoder::new(reader));
        }

        let mut socket = match UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to bind ephemeral socket for {peer}: {e}");
                send_error(&self.main_socket, peer, ERR_UNDEFINED, "server resource exhausted");
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)
        {
            error!("failed to register ephemeral socket for {peer}: {e}");
            return;
        }

        let (transfer, first) = Transfer::start(reader, size, &options);
        info!("RRQ \"{filename}\" from {peer}: {size} bytes, blksize={}", transfer.options().blksize);
        if let Err(e) = socket.send_to(&first, peer) {
            warn!("failed to send initial packet to {peer}: {e}");
        }

        self.transfers.insert(
            token,
            Active {
                socket,
                peer,
                transfer,
            },
        );
        self.peer_index.insert(peer, token);
    }

    fn handle_transfer_readable(&mut self, token: Token) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut finished = false;
        if let Some(active) = self.transfers.get_mut(&token) {
            loop {
                match active.socket.recv_from(&mut buf) {
                    Ok((n, src)) => {
                        if src != active.peer {
                            warn!(
                                "unknown TID: datagram from {src} on transfer bound to {}",
                                active.peer
                            );
                            send_error(&active.socket, src, ERR_UNKNOWN_TID, "unknown transfer ID");
                            continue;
                        }
                        if apply_to_transfer(active, &buf[..n]) {
                            finished = true;
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("recv error on ephemeral socket for {}: {e}", active.peer);
                        break;
                    }
                }
            }
        }
        if finished {
            self.remove_transfer(token);
        }
    }

    /// Like `handle_transfer_readable`'s inner step, but for a datagram that
    /// arrived on the *main* socket from a peer already registered
    /// elsewhere (the redirect path in `handle_main_datagram`).
    fn apply_inbound(&mut self, token: Token, buf: &[u8]) {
        let finished = self
            .transfers
            .get_mut(&token)
            .map(|active| apply_to_transfer(active, buf))
            .unwrap_or(false);
        if finished {
            self.remove_transfer(token);
        }
    }

    fn process_timeouts(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (token, active) in self.transfers.iter_mut() {
            if active.transfer.deadline > now {
                continue;
            }
            match active.transfer.on_timeout() {
                StepResult::Next(pkt) => {
                    if let Err(e) = active.socket.send_to(&pkt, active.peer) {
                        warn!("retransmit to {} failed: {e}", active.peer);
                    }
                }
                StepResult::Fatal(pkt) => {
                    let _ = active.socket.send_to(&pkt, active.peer);
                    warn!("transfer to {} abandoned after retry exhaustion", active.peer);
                    finished.push(*token);
                }
                StepResult::Done => finished.push(*token),
                StepResult::Duplicate => {}
            }
        }
        for token in finished {
            self.remove_transfer(token);
        }
    }

    fn remove_transfer(&mut self, token: Token) {
        if let Some(mut active) = self.transfers.remove(&token) {
            let _ = self.poll.registry().deregister(&mut active.socket);
            self.peer_index.remove(&active.peer);
        }
    }
}

/// Feed one decoded datagram into `active`'s state machine, sending
/// whatever reply results. Returns `true` if the transfer is now finished
/// and should be torn down.
fn apply_to_transfer(active: &mut Active, buf: &[u8]) -> bool {
    match Packet::decode(buf) {
        Ok(Packet::Ack { block }) => match active.transfer.on_ack(block) {
            StepResult::Next(pkt) => {
                let _ = active.socket.send_to(&pkt, active.peer);
                false
            }
            StepResult::Duplicate => false,
            StepResult::Done => true,
            StepResult::Fatal(pkt) => {
                let _ = active.socket.send_to(&pkt, active.peer);
                true
            }
        },
        Ok(Packet::Error { code, message }) => {
            info!("{} aborted transfer: ERROR {code} {message:?}", active.peer);
            active.transfer.abort();
            true
        }
        Ok(other) => {
            debug!("ignoring unexpected {other:?} from {}", active.peer);
            false
        }
        Err(e) => {
            debug!("malformed datagram from {}: {e}", active.peer);
            false
        }
    }
}

fn resolution_error_code(e: &ResolutionError) -> u16 {
    match e {
        ResolutionError::UnknownSerial(_) => ERR_FILE_NOT_FOUND,
        ResolutionError::IpAclMismatch { .. } => ERR_ACCESS_VIOLATION,
        ResolutionError::Fat(nobodd_fat::Error::NotFound(_)) => ERR_FILE_NOT_FOUND,
        ResolutionError::Fat(nobodd_fat::Error::NotADirectory(_)) => ERR_FILE_NOT_FOUND,
        ResolutionError::Fat(_) | ResolutionError::Partition(_) | ResolutionError::Damaged(_) => {
            ERR_UNDEFINED
        }
    }
}
