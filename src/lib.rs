//! Message channels with different delivery guarantees over a single UDP socket.
//!
//! The abstraction is sending and receiving *messages*, i.e. a message type tag followed by an
//!  application defined payload, each sent as a datagram of its own. Every message is sent on
//!  one of three channels:
//!
//! * **Unreliable**: fire-and-forget. A message arrives at most once, or not at all.
//! * **Reliable**: every frame carries a sequence number and is acknowledged by the receiver. The
//!   sender retransmits frames that were not acknowledged within a timeout, and the receiver
//!   suppresses duplicates, so every message is delivered exactly once, though not necessarily
//!   in the order it was sent.
//! * **ReliableOrdered**: like Reliable, but the receiver buffers frames that arrive ahead of a
//!   gap, delivering messages strictly in the order they were sent.
//!
//! There is no handshake and no notion of a connection: per-peer state is created when a peer is
//!  first sent to or received from, and it lives until the peer is disconnected explicitly or
//!  the socket is closed.
//!
//! ## Wire format
//!
//! All numbers are little-endian.
//!
//! ```ascii
//! 0:  bitmask (u8)
//!     * bit 0-1: channel
//!       * 00 Unreliable
//!       * 01 Reliable
//!       * 10 ReliableOrdered
//!       * 11 invalid - frame is dropped
//!     * bit 2-3: target (Server, All, Others, Me) - carried for the application, the
//!        transport does not interpret it
//!     * bit 4-7: unused, must be 0
//! 1:  sequence number (u32) - only for Reliable and ReliableOrdered. The first frame on a
//!      channel has sequence number 1.
//! *:  message type (u8)
//! *:  payload
//! ```
//!
//! Acknowledgements are regular messages with the reserved message type `2`, sent on the
//!  Unreliable channel with target `Me`:
//!
//! ```ascii
//! 0: channel of the acknowledged frame (u8)
//! 1: sequence number of the acknowledged frame (u32)
//! ```
//!
//! Acks are sent for every received frame including duplicates, since the first ack may have
//!  been lost. The only frames that are not acknowledged are frames on the ordered channel that
//!  are too far ahead of the delivered sequence to be buffered: the sender keeps retransmitting
//!  them until they fit into the receiver's reorder window.
//!
//! ## Known limitations
//!
//! * Sequence numbers are not expected to wrap around. At 1000 reliable messages per second
//!    to a single peer, this takes about 50 days.
//! * Per-peer state is created for every address that sends a reliable frame, and it is only
//!    removed by disconnecting the peer explicitly or closing the socket. The peer table is
//!    unbounded, so a long-running socket exposed to many senders should disconnect peers it
//!    no longer talks to.
//! * There is no congestion control and no path MTU discovery. Messages must fit into a
//!    single datagram of the configured buffer size.

pub mod buffers;
pub mod channel;
pub mod channel_state;
pub mod config;
pub mod frame_header;
pub mod message_dispatcher;
pub mod peer_addr;
pub mod send_pipeline;
pub mod transport_socket;

#[cfg(test)]
mod test_util;
