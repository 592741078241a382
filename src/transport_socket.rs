use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::byte_stream::ByteStream;
use crate::channel::{Channel, MessageType, Role, Target};
use crate::channel_state::{PeerChannels, ReceiveOutcome, ReceivedFrame};
use crate::config::TransportConfig;
use crate::frame_header::{AckMessage, FrameHeader};
use crate::message_dispatcher::{InboundMessage, MessageDispatcher};
use crate::peer_addr::PeerAddr;
use crate::send_pipeline::SendPipeline;

/// TransportSocket is the place where all other parts of the protocol come together: It owns a
///  UdpSocket, runs the receive loop that dispatches incoming frames through the per-peer channel
///  state, runs the periodic retransmission of unacknowledged frames, and has an API for
///  application code to send messages.
///
/// Sending is possible concurrently from any number of tasks.
pub struct TransportSocket {
    inner: Arc<TransportInner>,
    cancel_sender: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for TransportSocket {
    fn drop(&mut self) {
        for handle in self.handles.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }
}

impl TransportSocket {
    /// Binds the socket and starts the receive loop and the retransmit loop. If the configured
    ///  address is in use, the socket binds to an ephemeral port on the same IP address instead.
    pub async fn bind(config: TransportConfig, message_dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<TransportSocket> {
        config.validate()?;

        let socket = match UdpSocket::bind(config.self_addr).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                warn!("address {:?} is in use - binding to an ephemeral port instead", config.self_addr);
                UdpSocket::bind(SocketAddr::new(config.self_addr.ip(), 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        info!("bound transport socket to {:?}", local_addr);

        let inner = Arc::new(TransportInner::new(
            Arc::new(config),
            local_addr,
            SendPipeline::new(Arc::new(socket.clone())),
            message_dispatcher,
        ));

        let (cancel_sender, _) = broadcast::channel(1);
        let recv_handle = tokio::spawn(TransportInner::recv_loop(inner.clone(), socket, cancel_sender.subscribe()));
        let retransmit_handle = tokio::spawn(TransportInner::retransmit_loop(inner.clone(), cancel_sender.subscribe()));

        Ok(TransportSocket {
            inner,
            cancel_sender,
            handles: Mutex::new(vec![recv_handle, retransmit_handle]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// The pool that the socket takes its buffers from. Application code can use it for the
    ///  buffers it passes to [TransportSocket::send].
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.buffer_pool
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Sends a logical message, i.e. a message type tag followed by payload. The message is
    ///  framed into a datagram of its own, and the call returns the number of bytes written to
    ///  the socket without waiting for acknowledgement.
    ///
    /// The buffer remains with the caller, who is responsible for returning it to the pool.
    pub async fn send(&self, message: &ByteStream, to: PeerAddr, channel: Channel, target: Target) -> anyhow::Result<usize> {
        self.inner.send(message, to, channel, target).await
    }

    /// convenience for sending a message without handling a buffer explicitly
    pub async fn send_message(&self, message_type: MessageType, payload: &[u8], to: PeerAddr, channel: Channel, target: Target) -> anyhow::Result<usize> {
        self.inner.send_message(message_type, payload, to, channel, target).await
    }

    /// Discards all state for a peer, including frames that are pending acknowledgement. A
    ///  peer that sends again afterwards starts from scratch. Returns `false` if there was no
    ///  state for the peer.
    pub async fn disconnect_peer(&self, peer_addr: PeerAddr) -> bool {
        self.inner.disconnect_peer(peer_addr).await
    }

    /// the number of frames retained for a peer and channel until they are acknowledged
    pub async fn num_pending_retransmits(&self, peer_addr: PeerAddr, channel: Channel) -> usize {
        self.inner.num_pending_retransmits(peer_addr, channel).await
    }

    /// Stops the receive and retransmit loops and discards all per-peer state. Messages that
    ///  are not acknowledged yet are not retransmitted afterwards.
    pub async fn close(&self) {
        if self.inner.is_closed.swap(true, Ordering::AcqRel) {
            debug!("transport socket is already closed");
            return;
        }

        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling background loops");
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("background loop terminated abnormally: {}", e);
                }
            }
        }

        self.inner.teardown_peers().await;
        info!("closed transport socket {:?}", self.inner.local_addr);
    }
}

struct TransportInner {
    config: Arc<TransportConfig>,
    local_addr: SocketAddr,
    send_pipeline: SendPipeline,
    buffer_pool: Arc<BufferPool>,
    peers: RwLock<FxHashMap<PeerAddr, Arc<PeerChannels>>>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    is_closed: AtomicBool,
}

impl TransportInner {
    fn new(
        config: Arc<TransportConfig>,
        local_addr: SocketAddr,
        send_pipeline: SendPipeline,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> TransportInner {
        let buffer_pool = Arc::new(BufferPool::new(config.buffer_size, config.buffer_pool_size, config.max_pool_size));

        TransportInner {
            config,
            local_addr,
            send_pipeline,
            buffer_pool,
            peers: Default::default(),
            message_dispatcher,
            is_closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    async fn get_peer_channels(&self, peer_addr: PeerAddr) -> Arc<PeerChannels> {
        if let Some(channels) = self.peers.read().await.get(&peer_addr) {
            return channels.clone();
        }

        self.peers.write().await
            .entry(peer_addr)
            .or_insert_with(|| {
                debug!("initializing channel state for {:?}", peer_addr);
                Arc::new(PeerChannels::new(self.config.max_reorder_depth))
            })
            .clone()
    }

    async fn send_message(&self, message_type: MessageType, payload: &[u8], to: PeerAddr, channel: Channel, target: Target) -> anyhow::Result<usize> {
        let mut buf = self.buffer_pool.get();
        let result = match buf.write_message_type(message_type).and_then(|_| buf.write_slice(payload)) {
            Ok(()) => self.send(&buf, to, channel, target).await,
            Err(e) => Err(e.into()),
        };
        self.buffer_pool.recycle(buf);
        result
    }

    async fn send(&self, message: &ByteStream, to: PeerAddr, channel: Channel, target: Target) -> anyhow::Result<usize> {
        match message.as_slice().first() {
            None => bail!("cannot send an empty message - it requires at least a message type"),
            Some(&tag) if MessageType(tag).is_reserved() => bail!("message type {:?} is reserved for the transport", MessageType(tag)),
            Some(_) => {}
        }
        self.do_send(message, to, channel, target).await
    }

    async fn do_send(&self, message: &ByteStream, to: PeerAddr, channel: Channel, target: Target) -> anyhow::Result<usize> {
        if self.is_closed() {
            bail!("transport socket is closed");
        }
        let max_len = self.config.max_message_len(channel);
        if message.bytes_written() > max_len {
            debug!("message for {:?} on {:?} has a maximum length of {} to fit a single datagram, was {}", to, channel, max_len, message.bytes_written());
            bail!("message for {:?} on {:?} has a maximum length of {} to fit a single datagram, was {}", to, channel, max_len, message.bytes_written());
        }

        let mut frame = self.buffer_pool.get();

        let channels = if channel.is_reliable() {
            Some(self.get_peer_channels(to).await)
        }
        else {
            None
        };

        if let Some(state) = channels.as_ref().and_then(|c| c.get(channel)) {
            let mut state = state.lock().await;
            let sequence = state.next_sequence();
            trace!("sending frame #{} on {:?} to {:?}", sequence, channel, to);

            FrameHeader::sequenced(channel, target, sequence).ser(&mut frame)?;
            frame.write_buffer(message)?;
            frame.set_raw_bytes(true);

            let mut retained = self.buffer_pool.get();
            retained.write_buffer(&frame)?;
            retained.set_raw_bytes(true);
            retained.set_last_write_time();
            state.track_pending(sequence, retained, &self.buffer_pool);
        }
        else {
            trace!("sending unreliable frame to {:?}", to);
            FrameHeader::unsequenced(target).ser(&mut frame)?;
            frame.write_buffer(message)?;
            frame.set_raw_bytes(true);
        }

        let num_written = self.send_pipeline.send_packet(to, frame.as_slice()).await;
        self.buffer_pool.recycle(frame);
        Ok(num_written)
    }

    async fn send_ack(&self, to: PeerAddr, channel: Channel, sequence: u32) {
        trace!("acknowledging frame #{} on {:?} from {:?}", sequence, channel, to);

        let ack = AckMessage { channel, sequence };
        let mut buf = self.buffer_pool.get();
        match ack.ser(&mut buf) {
            Ok(()) => {
                if let Err(e) = self.do_send(&buf, to, Channel::Unreliable, Target::Me).await {
                    warn!("error sending ack to {:?}: {}", to, e);
                }
            }
            Err(e) => error!("error serializing ack: {}", e),
        }
        self.buffer_pool.recycle(buf);
    }

    async fn recv_loop(inner: Arc<TransportInner>, socket: Arc<UdpSocket>, mut cancel_receiver: broadcast::Receiver<()>) {
        info!("starting receive loop on {:?}", inner.local_addr);

        // one byte of headroom: the OS truncates datagrams that exceed the buffer, so a
        //  datagram filling it completely was too big
        let max_datagram_len = inner.config.buffer_size;
        let mut buf = vec![0u8; max_datagram_len + 1];
        loop {
            let (num_read, from) = select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok(r) => r,
                        Err(e) if inner.is_closed() && matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::NotConnected) => {
                            debug!("socket closed: {}", e);
                            break;
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    }
                }
                _ = cancel_receiver.recv() => {
                    debug!("receive loop canceled");
                    break;
                }
            };

            if num_read > max_datagram_len {
                warn!("datagram from {:?} exceeds the buffer size of {} bytes - dropping", from, max_datagram_len);
                continue;
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            // a dispatcher waiting for queue space must not block shutdown
            select! {
                _ = inner.on_datagram(from, &buf[..num_read]).instrument(span) => {}
                _ = cancel_receiver.recv() => {
                    debug!("receive loop canceled while processing a datagram");
                    break;
                }
            }
        }
    }

    async fn retransmit_loop(inner: Arc<TransportInner>, mut cancel_receiver: broadcast::Receiver<()>) {
        let mut sweep_interval = interval(inner.config.retransmit_sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = sweep_interval.tick() => {}
                _ = cancel_receiver.recv() => {
                    debug!("retransmit loop canceled");
                    break;
                }
            }

            select! {
                _ = inner.do_retransmit_sweep() => {}
                _ = cancel_receiver.recv() => {
                    debug!("retransmit loop canceled during a sweep");
                    break;
                }
            }
        }
    }

    async fn do_retransmit_sweep(&self) {
        let peers = self.peers.read().await
            .iter()
            .map(|(addr, channels)| (*addr, channels.clone()))
            .collect::<Vec<_>>();

        let now = Instant::now();
        for (peer_addr, channels) in peers {
            for state in channels.all() {
                let mut state = state.lock().await;
                let due = state.sweep_pending(now, self.config.retransmit_timeout, &self.buffer_pool);
                for sequence in due {
                    if let Some(frame) = state.pending_frame(sequence) {
                        debug!("retransmitting frame #{} on {:?} to {:?}", sequence, state.channel(), peer_addr);
                        self.send_pipeline.send_packet(peer_addr, frame.as_slice()).await;
                    }
                }
            }
        }
    }

    async fn on_datagram(&self, from: SocketAddr, data: &[u8]) {
        let peer_addr = PeerAddr::from(from);
        trace!("received datagram from {:?}: {:?}", peer_addr, data);

        let mut buf = self.buffer_pool.get();
        if buf.write_slice(data).is_err() {
            warn!("datagram from {:?} exceeds the buffer size ({} bytes) - dropping", peer_addr, data.len());
            self.buffer_pool.recycle(buf);
            return;
        }
        buf.set_raw_bytes(true);

        let header = match FrameHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received frame with unparsable header from {:?}: {} - dropping", peer_addr, e);
                self.buffer_pool.recycle(buf);
                return;
            }
        };
        let message_type = match buf.remaining_slice().first() {
            Some(&tag) => MessageType(tag),
            None => {
                debug!("received frame without message type from {:?} - dropping", peer_addr);
                self.buffer_pool.recycle(buf);
                return;
            }
        };

        match (header.sequence, message_type.is_reserved()) {
            (None, true) => self.on_ack_message(peer_addr, buf).await,
            (None, false) => self.dispatch(peer_addr, header, buf).await,
            (Some(_), true) => {
                warn!("received ack on {:?} from {:?} - acks are sent unreliably, dropping", header.channel, peer_addr);
                self.buffer_pool.recycle(buf);
            }
            (Some(sequence), false) => self.on_sequenced_frame(peer_addr, header, sequence, buf).await,
        }
    }

    async fn on_ack_message(&self, peer_addr: PeerAddr, mut buf: ByteStream) {
        buf.read_message_type();
        let ack = AckMessage::deser(&mut buf);
        self.buffer_pool.recycle(buf);

        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                warn!("received unparseable ack from {:?}: {}", peer_addr, e);
                return;
            }
        };

        let channels = self.peers.read().await
            .get(&peer_addr)
            .cloned();
        match channels.as_ref().and_then(|c| c.get(ack.channel)) {
            Some(state) => {
                state.lock().await.on_ack(ack.sequence);
            }
            None => debug!("received ack from {:?} without channel state - ignoring", peer_addr),
        }
    }

    async fn on_sequenced_frame(&self, peer_addr: PeerAddr, header: FrameHeader, sequence: u32, buf: ByteStream) {
        let channels = self.get_peer_channels(peer_addr).await;
        let state = match channels.get(header.channel) {
            Some(state) => state,
            None => {
                error!("sequenced frame on {:?} - this is a bug", header.channel);
                self.buffer_pool.recycle(buf);
                return;
            }
        };

        let outcome = state.lock().await
            .on_receive(ReceivedFrame { header, buf });

        if outcome.requires_ack() {
            self.send_ack(peer_addr, header.channel, sequence).await;
        }

        match outcome {
            ReceiveOutcome::Deliver(frames) => {
                for frame in frames {
                    self.dispatch(peer_addr, frame.header, frame.buf).await;
                }
            }
            ReceiveOutcome::Held => {}
            ReceiveOutcome::Duplicate(frame) | ReceiveOutcome::Rejected(frame) => {
                self.buffer_pool.recycle(frame.buf);
            }
        }
    }

    async fn dispatch(&self, peer_addr: PeerAddr, header: FrameHeader, mut buf: ByteStream) {
        let message_type = buf.read_message_type();
        let payload = Bytes::copy_from_slice(buf.remaining_slice());
        self.buffer_pool.recycle(buf);

        trace!("dispatching {:?} on {:?} from {:?}", message_type, header.channel, peer_addr);
        self.message_dispatcher.on_message(InboundMessage {
            sender: peer_addr,
            channel: header.channel,
            target: header.target,
            message_type,
            payload,
            role: self.config.role,
        }).await;
    }

    async fn disconnect_peer(&self, peer_addr: PeerAddr) -> bool {
        let removed = self.peers.write().await
            .remove(&peer_addr);

        match removed {
            Some(channels) => {
                debug!("disconnecting {:?}", peer_addr);
                for state in channels.all() {
                    state.lock().await.teardown(&self.buffer_pool);
                }
                true
            }
            None => false,
        }
    }

    async fn num_pending_retransmits(&self, peer_addr: PeerAddr, channel: Channel) -> usize {
        let channels = self.peers.read().await
            .get(&peer_addr)
            .cloned();
        match channels.as_ref().and_then(|c| c.get(channel)) {
            Some(state) => state.lock().await.num_pending(),
            None => 0,
        }
    }

    async fn teardown_peers(&self) {
        let peers = std::mem::take(&mut *self.peers.write().await);
        for channels in peers.into_values() {
            for state in channels.all() {
                state.lock().await.teardown(&self.buffer_pool);
            }
        }
    }
}
