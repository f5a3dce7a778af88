use crate::metrics::MetricsRecorder;
use crate::packet;
use crate::Config;
use crate::Error;
use crate::Packet;
use crate::Report;
use crate::MAX_DATAGRAM_SIZE;
use crate::POLL_INTERVAL;

use log::warn;

use std::io;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

mod receiver;

use receiver::{DatagramSink, Receiver};

struct Shared {
    stop: AtomicBool,
    metrics: Mutex<MetricsRecorder>,
}

/// The server endpoint of a `duolane` link. Binds a non-blocking UDP socket and runs a
/// background receive-and-deliver loop; the peer address is learned from the most
/// recently received datagram.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: net::SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds a UDP socket to the provided address and spawns the receive loop. The
    /// callback is invoked once per delivered payload with the packet and its one-way
    /// latency in milliseconds: in sequence order (modulo gap skips) for reliable
    /// payloads, in arrival order for unreliable ones. Any errors resulting from socket
    /// initialization are forwarded to the caller.
    pub fn start<A, F>(addr: A, config: Config, callback: F) -> Result<Self, Error>
    where
        A: net::ToSocketAddrs,
        F: FnMut(&Packet, f64) + Send + 'static,
    {
        assert!(config.is_valid(), "invalid endpoint config");

        let socket = net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            metrics: Mutex::new(MetricsRecorder::default()),
        });

        let receiver = Receiver::new(config.window_size, config.stop_threshold);

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("duolane-server".to_owned())
                .spawn(move || run_loop(&shared, &socket, receiver, callback))?
        };

        Ok(Self {
            shared,
            local_addr,
            handle: Some(handle),
        })
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    /// Computes a point-in-time metrics report. May be called from any thread while the
    /// receive loop is running.
    pub fn metrics(&self) -> Report {
        self.shared.metrics.lock().unwrap().report()
    }

    /// Stops the receive loop before its next iteration and waits for it to exit.
    /// Buffered packets that were never delivered are discarded.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sends the receiver's replies to whichever address the datagram under processing came
/// from.
struct UdpDatagramSink<'a> {
    socket: &'a net::UdpSocket,
    address: net::SocketAddr,
}

impl DatagramSink for UdpDatagramSink<'_> {
    fn send(&mut self, data: &[u8]) {
        let _ = self.socket.send_to(data, self.address);
    }
}

/// One tick: honour the stop flag, check the gap timeout, hand at most one pending
/// payload to the callback, poll the socket once, and sleep only when idle.
fn run_loop(
    shared: &Shared,
    socket: &net::UdpSocket,
    mut receiver: Receiver,
    mut callback: impl FnMut(&Packet, f64),
) {
    let mut buf = [0; MAX_DATAGRAM_SIZE];

    while !shared.stop.load(Ordering::Relaxed) {
        let mut idle = true;

        {
            let mut metrics = shared.metrics.lock().unwrap();
            receiver.check_gap_timeout(Instant::now(), &mut metrics);
        }

        if let Some(delivery) = receiver.pop_delivery() {
            callback(&delivery.packet, delivery.latency_ms);
            idle = false;
        }

        match socket.recv_from(&mut buf) {
            Ok((len, address)) => {
                let mut sink = UdpDatagramSink { socket, address };
                let immediate = {
                    let mut metrics = shared.metrics.lock().unwrap();
                    receiver.handle_datagram(
                        &buf[..len],
                        Instant::now(),
                        packet::now_millis(),
                        &mut metrics,
                        &mut sink,
                    )
                };
                if let Some(delivery) = immediate {
                    callback(&delivery.packet, delivery.latency_ms);
                }
                idle = false;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("socket receive failed: {}", err);
            }
        }

        if idle {
            thread::sleep(POLL_INTERVAL);
        }
    }
}
