#![warn(missing_docs)]

//! `duolane` is a minimal two-lane transport layered over UDP, designed for real-time,
//! loss-tolerant workloads such as game telemetry. A single datagram socket between one
//! [`Client`] and one [`Server`] carries two complementary delivery lanes:
//!
//!   * an *unreliable* lane, which forwards payloads with no retransmission, no ordering,
//!     and no duplicate suppression;
//!
//!   * a *reliable* lane, which provides in-order, deduplicated delivery using a Selective
//!     Repeat ARQ with per-packet retransmit timers and a bounded receiver reassembly
//!     window. Unlike classical Selective Repeat, delivery effort is bounded: a packet
//!     that cannot be delivered within the configured deadlines is dropped rather than
//!     retransmitted forever.
//!
//! When a client shuts down it sends a session summary so that the server can compute
//! delivery-ratio metrics for the session.
//!
//! # Sending Data
//!
//! [`Client::send`](Client::send) enqueues a payload and returns immediately; a
//! background dispatcher assigns sequence numbers and manages the send window. Delivery
//! of reliable payloads is not guaranteed — a packet whose retransmit budget is exhausted
//! is dropped, and the loss is visible only in the server's delivery ratio.
//!
//! # Receiving Data
//!
//! [`Server::start`](Server::start) binds a socket and spawns a receive loop which
//! invokes the provided callback once per delivered payload, together with the packet's
//! one-way latency in milliseconds. Reliable payloads arrive in sequence order (modulo
//! gap skips); unreliable payloads arrive in whatever order the network produced.
//!
//! # Closing
//!
//! [`Client::close`](Client::close) drains in-flight traffic, performs the session
//! summary exchange, and stops the background threads. [`Server::stop`](Server::stop)
//! terminates the receive loop; [`Server::metrics`](Server::metrics) reports counters,
//! latency, jitter and delivery ratios at any time.

mod client;
mod config;
mod error;
mod metrics;
mod packet;
mod seq;
mod server;
mod session;

pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use metrics::{ChannelReport, Report};
pub use packet::{ChannelType, Packet, HEADER_SIZE};
pub use server::Server;

use std::time::Duration;

/// The size of the receive buffer used on either end of the link, in bytes. Datagrams
/// larger than this are truncated by the socket, so payloads must respect
/// [`MAX_PAYLOAD_SIZE`].
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// The maximum size of a single payload, in bytes, according to the receive buffer size
/// and header overhead.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// How long an idle polling loop sleeps before checking its non-blocking socket again.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A mode with which a user payload is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// The payload will be sent at most once. If the datagram is dropped, reordered, or
    /// duplicated by the network, the receiver sees exactly what the network produced.
    Unreliable,
    /// The payload will be sent and resent until acknowledged by the receiver, up to the
    /// configured retransmit budget. Within that budget the receiver delivers reliable
    /// payloads in order and without duplicates.
    Reliable,
}
