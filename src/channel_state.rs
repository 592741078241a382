//! Per-peer bookkeeping for the reliable channels, both for sending (sequence numbers, frames
//!  awaiting acknowledgement) and for receiving (duplicate suppression, reassembly of the
//!  ordered channel's sequence).
//!
//! [ChannelState] does no I/O and has no notion of time beyond what it is passed, which keeps
//!  it testable without a socket. The transport guards each instance by a single lock and
//!  performs all sending and dispatching based on the values returned from here.

use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::byte_stream::ByteStream;
use crate::channel::Channel;
use crate::frame_header::FrameHeader;

/// A frame that arrived on a reliable channel, with the buffer's read position after the frame
///  header, i.e. at the message type tag
pub struct ReceivedFrame {
    pub header: FrameHeader,
    pub buf: ByteStream,
}

impl ReceivedFrame {
    pub fn sequence(&self) -> u32 {
        self.header.sequence.unwrap_or_default()
    }
}

/// What the receiving side should do with a frame after it was registered with the channel
///  state. All variants except [ReceiveOutcome::Rejected] require an acknowledgement.
pub enum ReceiveOutcome {
    /// frames that are ready for delivery to the application, in this order
    Deliver(Vec<ReceivedFrame>),
    /// the frame is buffered until the gap before it is filled
    Held,
    /// the frame was received before; it is returned so its buffer can be recycled
    Duplicate(ReceivedFrame),
    /// the frame is too far ahead of the delivered sequence to be buffered. It is not
    ///  acknowledged, so the sender retransmits it later
    Rejected(ReceivedFrame),
}

impl ReceiveOutcome {
    pub fn requires_ack(&self) -> bool {
        !matches!(self, ReceiveOutcome::Rejected(_))
    }
}

struct PendingFrame {
    frame: ByteStream,
    acknowledged: bool,
}

pub struct ChannelState {
    channel: Channel,
    max_reorder_depth: u32,

    /// the most recently assigned sequence number; the first one assigned is 1
    next_sequence: u32,
    pending_retransmit: BTreeMap<u32, PendingFrame>,

    expected_sequence: u32,
    min_ack: u32,
    max_ack: u32,
    received: FxHashSet<u32>,
    /// Reliable channel: all sequence numbers up to and including this were received, and
    ///  they are no longer stored in `received`
    delivered_through: u32,
    reorder_buffer: BTreeMap<u32, ReceivedFrame>,
}

impl ChannelState {
    pub fn new(channel: Channel, max_reorder_depth: u32) -> ChannelState {
        if !channel.is_reliable() {
            warn!("creating channel state for unreliable channel - this is most likely a bug");
        }

        ChannelState {
            channel,
            max_reorder_depth,
            next_sequence: 0,
            pending_retransmit: Default::default(),
            expected_sequence: 1,
            min_ack: 1,
            max_ack: 1,
            received: Default::default(),
            delivered_through: 0,
            reorder_buffer: Default::default(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.next_sequence
    }

    /// Registers a copy of a sent frame for retransmission until it is acknowledged. The
    ///  frame's last write time is the reference for the retransmit timeout.
    pub fn track_pending(&mut self, sequence: u32, frame: ByteStream, buffer_pool: &BufferPool) {
        trace!("tracking frame #{} on {:?} for retransmission", sequence, self.channel);
        if let Some(prev) = self.pending_retransmit.insert(sequence, PendingFrame { frame, acknowledged: false }) {
            warn!("sequence number #{} on {:?} was still pending - sequence numbers wrapped around?", sequence, self.channel);
            buffer_pool.recycle(prev.frame);
        }
    }

    /// Returns `true` if the sequence number was pending and not acknowledged before
    pub fn on_ack(&mut self, sequence: u32) -> bool {
        match self.pending_retransmit.get_mut(&sequence) {
            Some(pending) if !pending.acknowledged => {
                trace!("frame #{} on {:?} acknowledged", sequence, self.channel);
                pending.acknowledged = true;
                true
            }
            Some(_) => {
                trace!("duplicate ack for frame #{} on {:?}", sequence, self.channel);
                false
            }
            None => {
                debug!("ack for frame #{} on {:?} that is not pending - ignoring", sequence, self.channel);
                false
            }
        }
    }

    /// Removes acknowledged frames, and returns the sequence numbers of frames that were sent
    ///  more than `timeout` ago. Their last write time is set to `now`, so the caller is
    ///  expected to resend them.
    pub fn sweep_pending(&mut self, now: Instant, timeout: Duration, buffer_pool: &BufferPool) -> Vec<u32> {
        let acknowledged = self.pending_retransmit.iter()
            .filter(|(_, pending)| pending.acknowledged)
            .map(|(&sequence, _)| sequence)
            .collect::<Vec<_>>();
        for sequence in acknowledged {
            if let Some(pending) = self.pending_retransmit.remove(&sequence) {
                buffer_pool.recycle(pending.frame);
            }
        }

        let mut due = Vec::new();
        for (&sequence, pending) in self.pending_retransmit.iter_mut() {
            let is_due = match pending.frame.last_write_time() {
                Some(last_write_time) => now.saturating_duration_since(last_write_time) > timeout,
                None => true,
            };
            if is_due {
                pending.frame.set_last_write_time_to(now);
                due.push(sequence);
            }
        }
        due
    }

    pub fn pending_frame(&self, sequence: u32) -> Option<&ByteStream> {
        self.pending_retransmit.get(&sequence)
            .map(|pending| &pending.frame)
    }

    /// the number of sent frames that are retained, including acknowledged frames that were not
    ///  swept yet
    pub fn num_pending(&self) -> usize {
        self.pending_retransmit.len()
    }

    pub fn expected_sequence(&self) -> u32 {
        self.expected_sequence
    }

    pub fn num_buffered(&self) -> usize {
        self.reorder_buffer.len()
    }

    pub fn on_receive(&mut self, frame: ReceivedFrame) -> ReceiveOutcome {
        match self.channel {
            Channel::ReliableOrdered => self.on_receive_ordered(frame),
            _ => self.on_receive_unordered(frame),
        }
    }

    fn is_beyond_reorder_depth(&self, sequence: u32, base: u32) -> bool {
        sequence as u64 >= base as u64 + self.max_reorder_depth as u64
    }

    fn on_receive_unordered(&mut self, frame: ReceivedFrame) -> ReceiveOutcome {
        let sequence = frame.sequence();

        if sequence <= self.delivered_through || self.received.contains(&sequence) {
            debug!("duplicate frame #{} on {:?} - dropping", sequence, self.channel);
            return ReceiveOutcome::Duplicate(frame);
        }
        if self.is_beyond_reorder_depth(sequence, self.delivered_through + 1) {
            debug!("frame #{} on {:?} is too far ahead of #{} - dropping without ack", sequence, self.channel, self.delivered_through);
            return ReceiveOutcome::Rejected(frame);
        }

        self.received.insert(sequence);
        while self.received.remove(&(self.delivered_through + 1)) {
            self.delivered_through += 1;
        }
        ReceiveOutcome::Deliver(vec![frame])
    }

    fn on_receive_ordered(&mut self, frame: ReceivedFrame) -> ReceiveOutcome {
        let sequence = frame.sequence();

        if sequence < self.expected_sequence || self.received.contains(&sequence) {
            debug!("duplicate frame #{} on {:?} - dropping", sequence, self.channel);
            return ReceiveOutcome::Duplicate(frame);
        }
        if self.is_beyond_reorder_depth(sequence, self.expected_sequence) {
            debug!("frame #{} on {:?} is too far ahead of expected #{} - dropping without ack", sequence, self.channel, self.expected_sequence);
            return ReceiveOutcome::Rejected(frame);
        }

        self.received.insert(sequence);
        self.reorder_buffer.insert(sequence, frame);
        self.min_ack = self.min_ack.min(sequence);
        self.max_ack = self.max_ack.max(sequence);

        let is_contiguous = self.min_ack == self.expected_sequence
            && self.received.len() as u64 == (self.max_ack - self.min_ack) as u64 + 1;
        if !is_contiguous {
            trace!("frame #{} on {:?} is held until #{} arrives", sequence, self.channel, self.expected_sequence);
            return ReceiveOutcome::Held;
        }

        let deliverable = std::mem::take(&mut self.reorder_buffer)
            .into_values()
            .collect::<Vec<_>>();
        trace!("delivering frames #{} to #{} on {:?}", self.expected_sequence, self.max_ack, self.channel);

        self.expected_sequence = self.max_ack + 1;
        self.min_ack = self.expected_sequence;
        self.max_ack = self.expected_sequence;
        self.received.clear();

        ReceiveOutcome::Deliver(deliverable)
    }

    /// discards all retained frames, returning their buffers to the pool
    pub fn teardown(&mut self, buffer_pool: &BufferPool) {
        debug!("tearing down {:?} state: {} pending, {} buffered", self.channel, self.pending_retransmit.len(), self.reorder_buffer.len());

        for (_, pending) in std::mem::take(&mut self.pending_retransmit) {
            buffer_pool.recycle(pending.frame);
        }
        for (_, frame) in std::mem::take(&mut self.reorder_buffer) {
            buffer_pool.recycle(frame.buf);
        }
        self.received.clear();
    }
}

/// The state of both reliable channels for a single peer, each behind its own lock
pub struct PeerChannels {
    reliable: Mutex<ChannelState>,
    ordered: Mutex<ChannelState>,
}

impl PeerChannels {
    pub fn new(max_reorder_depth: u32) -> PeerChannels {
        PeerChannels {
            reliable: Mutex::new(ChannelState::new(Channel::Reliable, max_reorder_depth)),
            ordered: Mutex::new(ChannelState::new(Channel::ReliableOrdered, max_reorder_depth)),
        }
    }

    /// `None` for the unreliable channel, which has no state
    pub fn get(&self, channel: Channel) -> Option<&Mutex<ChannelState>> {
        match channel {
            Channel::Unreliable => None,
            Channel::Reliable => Some(&self.reliable),
            Channel::ReliableOrdered => Some(&self.ordered),
        }
    }

    pub fn all(&self) -> [&Mutex<ChannelState>; 2] {
        [&self.reliable, &self.ordered]
    }
}
