use crate::error::Error;

use byteorder::{BigEndian, ByteOrder};

use std::time;

/// The number of header bytes preceding the payload in every datagram:
/// channel type (1) ‖ sequence number (2) ‖ timestamp (8) ‖ ack number (2), big-endian.
pub const HEADER_SIZE: usize = 13;

/// The lane a datagram belongs to, carried in the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelType {
    /// Unreliable data.
    Unreliable = 0,
    /// Reliable data in the request direction; an acknowledgement in the reply direction
    /// (distinguished by a populated ack number and an empty payload).
    Reliable = 1,
    /// A session summary in the request direction; a session-summary acknowledgement in
    /// the reply direction.
    Session = 2,
}

impl ChannelType {
    fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(ChannelType::Unreliable),
            1 => Ok(ChannelType::Reliable),
            2 => Ok(ChannelType::Session),
            other => Err(Error::UnknownChannel(other)),
        }
    }
}

/// A single protocol datagram. Field widths are enforced by the field types themselves,
/// so any `Packet` value can be encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// The lane this packet travels on.
    pub channel_type: ChannelType,
    /// Sender-assigned sequence number, wrapping mod 2¹⁶. Zero for replies.
    pub seq_num: u16,
    /// Milliseconds since the Unix epoch at send time. Zero for replies.
    pub time_stamp: u64,
    /// The sequence number being acknowledged, on reliable-lane replies.
    pub ack_num: u16,
    /// Application data, or UTF-8 JSON on the session lane.
    pub payload: Box<[u8]>,
}

impl Packet {
    pub(crate) fn reliable(seq_num: u16, payload: Box<[u8]>) -> Self {
        Self {
            channel_type: ChannelType::Reliable,
            seq_num,
            time_stamp: now_millis(),
            ack_num: 0,
            payload,
        }
    }

    pub(crate) fn unreliable(payload: Box<[u8]>) -> Self {
        Self {
            channel_type: ChannelType::Unreliable,
            seq_num: 0,
            time_stamp: now_millis(),
            ack_num: 0,
            payload,
        }
    }

    pub(crate) fn summary(payload: Box<[u8]>) -> Self {
        Self {
            channel_type: ChannelType::Session,
            seq_num: 0,
            time_stamp: now_millis(),
            ack_num: 0,
            payload,
        }
    }

    pub(crate) fn ack(seq_num: u16) -> Self {
        Self {
            channel_type: ChannelType::Reliable,
            seq_num: 0,
            time_stamp: 0,
            ack_num: seq_num,
            payload: Box::default(),
        }
    }

    pub(crate) fn summary_ack() -> Self {
        Self {
            channel_type: ChannelType::Session,
            seq_num: 0,
            time_stamp: 0,
            ack_num: 0,
            payload: Box::default(),
        }
    }

    /// Serializes this packet. The result is always at least [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0; HEADER_SIZE + self.payload.len()];

        data[0] = self.channel_type as u8;
        BigEndian::write_u16(&mut data[1..3], self.seq_num);
        BigEndian::write_u64(&mut data[3..11], self.time_stamp);
        BigEndian::write_u16(&mut data[11..13], self.ack_num);
        data[HEADER_SIZE..].copy_from_slice(&self.payload);

        data
    }

    /// Deserializes a packet from raw datagram bytes. Fails if the input is shorter than
    /// [`HEADER_SIZE`] or names a channel this protocol does not define.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader { len: data.len() });
        }

        Ok(Self {
            channel_type: ChannelType::from_u8(data[0])?,
            seq_num: BigEndian::read_u16(&data[1..3]),
            time_stamp: BigEndian::read_u64(&data[3..11]),
            ack_num: BigEndian::read_u16(&data[11..13]),
            payload: data[HEADER_SIZE..].into(),
        })
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
