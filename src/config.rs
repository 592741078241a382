use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::channel::{Channel, Role};
use crate::frame_header::FrameHeader;

pub struct TransportConfig {
    /// The address the socket binds to. If the port is in use, the socket falls back to an
    ///  ephemeral port on the same IP address, so applications should check
    ///  `TransportSocket::local_addr()` after binding.
    pub self_addr: SocketAddr,

    /// passed to the application with every received message
    pub role: Role,

    /// This is the maximum size of a complete datagram including the frame header, and it is
    ///  the capacity of every pooled buffer. The transport does no fragmentation, so messages
    ///  that do not fit are refused when they are sent.
    ///
    /// NB: With full Ethernet frames, the UDP payload that is guaranteed to pass without IP level
    ///  fragmentation is `1500 - 20 - 8 = 1472` bytes for IPV4. Bigger datagrams work but may
    ///  be fragmented on the way.
    pub buffer_size: usize,

    /// The number of buffers that are allocated up front
    pub buffer_pool_size: usize,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub max_pool_size: usize,

    /// The interval at which unacknowledged frames are checked for retransmission, and
    ///  acknowledged frames are cleaned up
    pub retransmit_sweep_interval: Duration,

    /// A frame is resent if it was not acknowledged within this time after it was (re)sent.
    ///  Configure this to roughly 2x RTT.
    pub retransmit_timeout: Duration,

    /// The maximum number of sequence numbers a received frame may be ahead of the lowest
    ///  undelivered sequence number. Frames that are further ahead are dropped without
    ///  acknowledgement, which bounds the memory for buffering out-of-order frames per channel.
    pub max_reorder_depth: u32,

    /// the bound of the queue between the receive loop and the application if messages are
    ///  consumed through a `QueueDispatcher`
    pub receive_queue_size: usize,
}

impl TransportConfig {
    /// defaults with an Ethernet-MTU sized receive buffer, for server role
    pub fn default_ipv4(self_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            self_addr,
            role: Role::Server,
            buffer_size: 1500,
            buffer_pool_size: 128,
            max_pool_size: 4096,
            retransmit_sweep_interval: Duration::from_millis(15),
            retransmit_timeout: Duration::from_millis(100),
            max_reorder_depth: 1024,
            receive_queue_size: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size <= FrameHeader::SEQUENCED_LEN + 1 {
            bail!("buffer size {} is too small to hold a frame header and a message type", self.buffer_size);
        }
        if self.buffer_size > 65507 {
            bail!("buffer size {} exceeds the maximum UDP payload", self.buffer_size);
        }
        if self.buffer_pool_size > self.max_pool_size {
            bail!("initial buffer pool size {} exceeds the maximum pool size {}", self.buffer_pool_size, self.max_pool_size);
        }
        if self.retransmit_sweep_interval.is_zero() {
            bail!("retransmit sweep interval must not be zero");
        }
        if self.retransmit_timeout < self.retransmit_sweep_interval {
            bail!("retransmit timeout {:?} is shorter than the sweep interval {:?}", self.retransmit_timeout, self.retransmit_sweep_interval);
        }
        if self.max_reorder_depth == 0 {
            bail!("max reorder depth must be at least 1");
        }
        if self.receive_queue_size == 0 {
            bail!("receive queue size must be at least 1");
        }

        Ok(())
    }

    /// the largest logical message (message type tag and payload) that can be sent on a channel
    pub fn max_message_len(&self, channel: Channel) -> usize {
        self.buffer_size - FrameHeader::serialized_len_for(channel)
    }
}
