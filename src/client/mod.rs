use crate::packet::ChannelType;
use crate::packet::Packet;
use crate::seq;
use crate::seq::Seq;
use crate::session::SessionSummary;
use crate::Config;
use crate::Error;
use crate::SendMode;
use crate::MAX_DATAGRAM_SIZE;
use crate::MAX_PAYLOAD_SIZE;
use crate::POLL_INTERVAL;

use log::{debug, error, trace, warn};
use rand::Rng;

use std::collections::VecDeque;
use std::io;
use std::net;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

mod send_window;

use send_window::{SendWindow, TimerEvent};

/// How many times the session summary is sent before the client gives up waiting for
/// its acknowledgement.
const SUMMARY_ATTEMPTS: u32 = 3;

struct Queued {
    payload: Box<[u8]>,
    mode: SendMode,
}

struct State {
    queue: VecDeque<Queued>,
    window: SendWindow,
    next_seq: Seq,
    reliable_sent: u64,
    unreliable_sent: u64,
    summary_acked: bool,
    shutdown: bool,
    fault: Option<io::Error>,
}

struct Shared {
    config: Config,
    state: Mutex<State>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// The client endpoint of a `duolane` link. Owns one UDP socket aimed at a single
/// server, a background dispatcher feeding the send window, and a background reader
/// reaping acknowledgements.
pub struct Client {
    shared: Arc<Shared>,
    socket: Arc<net::UdpSocket>,
    server_addr: net::SocketAddr,
    dispatcher: Option<thread::JoinHandle<()>>,
    ack_reader: Option<thread::JoinHandle<()>>,
    closed: bool,
}

impl Client {
    /// Opens a non-blocking UDP socket bound to `local_addr`, aims it at `server_addr`,
    /// and starts the background send machinery. Any errors resulting from socket
    /// initialization are forwarded to the caller.
    pub fn connect<A: net::ToSocketAddrs, B: net::ToSocketAddrs>(
        local_addr: A,
        server_addr: B,
        config: Config,
    ) -> Result<Self, Error> {
        assert!(config.is_valid(), "invalid endpoint config");

        let socket = net::UdpSocket::bind(local_addr)?;
        socket.set_nonblocking(true)?;
        let socket = Arc::new(socket);

        let server_addr = server_addr
            .to_socket_addrs()?
            .next()
            .expect("no useful socket addresses");

        let window = SendWindow::new(
            config.window_size,
            config.resend_timeout,
            config.max_resend_count(),
        );

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                window,
                next_seq: rand::thread_rng().gen_range(1..=u16::MAX),
                reliable_sent: 0,
                unreliable_sent: 0,
                summary_acked: false,
                shutdown: false,
                fault: None,
            }),
            signal: Condvar::new(),
        });

        let dispatcher = {
            let shared = shared.clone();
            let socket = socket.clone();
            thread::Builder::new()
                .name("duolane-dispatch".to_owned())
                .spawn(move || run_dispatcher(&shared, &socket, server_addr))?
        };

        let ack_reader = {
            let shared = shared.clone();
            let socket = socket.clone();
            thread::Builder::new()
                .name("duolane-ack".to_owned())
                .spawn(move || run_ack_reader(&shared, &socket))?
        };

        Ok(Self {
            shared,
            socket,
            server_addr,
            dispatcher: Some(dispatcher),
            ack_reader: Some(ack_reader),
            closed: false,
        })
    }

    /// Enqueues a payload for transmission and returns immediately. The admission queue
    /// is unbounded; reliable payloads enter the send window as slots free up.
    ///
    /// Delivery of reliable payloads is not guaranteed: once the retransmit budget is
    /// exhausted the packet is dropped, which is visible only in the server's delivery
    /// ratio.
    pub fn send(&self, payload: Box<[u8]>, mode: SendMode) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(payload.len()));
        }

        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(Error::Closed);
        }

        state.queue.push_back(Queued { payload, mode });
        self.shared.signal.notify_all();

        Ok(())
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Closes the client: drains in-flight traffic within a bounded budget, performs the
    /// session summary exchange (resending until acknowledged or the retry budget runs
    /// out), cancels every outstanding retransmit timer, and stops the background
    /// threads.
    ///
    /// A missing summary acknowledgement is logged as a warning, not reported as an
    /// error. A socket fault recorded by the background threads is returned here.
    pub fn close(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.drain();
        self.exchange_summary();

        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.window.clear();
            state.queue.clear();
            self.shared.signal.notify_all();
        }

        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.ack_reader.take() {
            let _ = handle.join();
        }

        match self.shared.lock().fault.take() {
            Some(err) => Err(Error::Io(err)),
            None => Ok(()),
        }
    }

    /// Waits for the admission queue and send window to empty, so that the session
    /// summary covers everything handed to [`send`](Self::send). The wait is bounded;
    /// traffic that cannot resolve within one full retransmit budget is abandoned.
    fn drain(&self) {
        let deadline = Instant::now()
            + self.shared.config.stop_threshold * 2
            + self.shared.config.resend_timeout;

        let mut state = self.shared.lock();
        while !state.queue.is_empty() || !state.window.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "closing with {} queued and {} unacknowledged packets",
                    state.queue.len(),
                    state.window.len()
                );
                break;
            }

            state = self.shared.signal.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    fn exchange_summary(&self) {
        let summary = {
            let state = self.shared.lock();
            SessionSummary::new(state.reliable_sent, state.unreliable_sent)
        };

        let payload = match summary.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                error!("could not encode session summary: {}", err);
                return;
            }
        };
        let bytes = Packet::summary(payload.into()).encode();

        let mut acked = false;

        for attempt in 1..=SUMMARY_ATTEMPTS {
            trace!("sending session summary, attempt {}", attempt);
            if let Err(err) = self.socket.send_to(&bytes, self.server_addr) {
                record_fault(&mut self.shared.lock(), err);
                break;
            }

            let mut state = self.shared.lock();
            let deadline = Instant::now() + self.shared.config.resend_timeout;
            while !state.summary_acked {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self.shared.signal.wait_timeout(state, deadline - now).unwrap().0;
            }

            acked = state.summary_acked;
            if acked {
                break;
            }
        }

        if !acked {
            warn!(
                "session summary not acknowledged after {} attempts",
                SUMMARY_ATTEMPTS
            );
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn record_fault(state: &mut State, err: io::Error) {
    error!("socket fault: {}", err);
    if state.fault.is_none() {
        state.fault = Some(err);
    }
}

/// Moves payloads from the admission queue into the send window, transmits them, and
/// services retransmit deadlines. One condition variable covers both wake-up reasons:
/// work arriving and window slots freeing.
fn run_dispatcher(shared: &Shared, socket: &net::UdpSocket, server_addr: net::SocketAddr) {
    let mut state = shared.lock();

    loop {
        let now = Instant::now();
        for event in state.window.pop_due(now) {
            match event {
                TimerEvent::Resend { seq, bytes } => {
                    trace!("resending seq {}", seq);
                    if let Err(err) = socket.send_to(&bytes, server_addr) {
                        record_fault(&mut state, err);
                    }
                }
                TimerEvent::Expired { seq, resend_count } => {
                    warn!("dropping seq {} after {} resends", seq, resend_count);
                    shared.signal.notify_all();
                }
            }
        }

        if state.shutdown {
            return;
        }

        if !state.queue.is_empty() && !state.window.is_full() {
            if let Some(item) = state.queue.pop_front() {
                state = dispatch(state, shared, socket, server_addr, item);
            }
            continue;
        }

        state = match state.window.next_deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                shared.signal.wait_timeout(state, timeout).unwrap().0
            }
            None => shared.signal.wait(state).unwrap(),
        };
    }
}

/// Transmits one queued payload. The socket write happens outside the lock so that
/// send() callers and the acknowledgement reader are never blocked behind it.
fn dispatch<'a>(
    mut state: MutexGuard<'a, State>,
    shared: &'a Shared,
    socket: &net::UdpSocket,
    server_addr: net::SocketAddr,
    item: Queued,
) -> MutexGuard<'a, State> {
    let bytes: Arc<[u8]> = match item.mode {
        SendMode::Reliable => {
            let seq = state.next_seq;
            state.next_seq = seq::next(seq);
            state.reliable_sent += 1;

            let bytes: Arc<[u8]> = Packet::reliable(seq, item.payload).encode().into();
            state.window.register(seq, bytes.clone(), Instant::now());
            trace!("sending reliable seq {} ({} in window)", seq, state.window.len());
            bytes
        }
        SendMode::Unreliable => {
            state.unreliable_sent += 1;
            trace!("sending unreliable payload");
            Packet::unreliable(item.payload).encode().into()
        }
    };

    drop(state);
    let result = socket.send_to(&bytes, server_addr);

    let mut state = shared.lock();
    if let Err(err) = result {
        record_fault(&mut state, err);
    }
    // a drain() in progress watches the queue length
    shared.signal.notify_all();
    state
}

/// Reads replies off the client socket: acknowledgements free their send-window entry,
/// a session-summary acknowledgement raises the flag `close()` waits on. Anything else
/// arriving on this socket is ignored.
fn run_ack_reader(shared: &Shared, socket: &net::UdpSocket) {
    let mut buf = [0; MAX_DATAGRAM_SIZE];

    loop {
        if shared.lock().shutdown {
            return;
        }

        match socket.recv_from(&mut buf) {
            Ok((len, _)) => match Packet::decode(&buf[..len]) {
                Ok(packet) => handle_reply(shared, &packet),
                Err(err) => debug!("ignoring undecodable reply: {}", err),
            },
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                record_fault(&mut shared.lock(), err);
                return;
            }
        }
    }
}

fn handle_reply(shared: &Shared, packet: &Packet) {
    match packet.channel_type {
        ChannelType::Reliable => {
            let mut state = shared.lock();
            if state.window.acknowledge(packet.ack_num) {
                trace!("ack for seq {}", packet.ack_num);
                shared.signal.notify_all();
            } else {
                debug!("ack for unknown seq {}", packet.ack_num);
            }
        }
        ChannelType::Session => {
            let mut state = shared.lock();
            state.summary_acked = true;
            shared.signal.notify_all();
        }
        ChannelType::Unreliable => {}
    }
}
