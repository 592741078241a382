//! Test doubles for the transport's I/O boundaries: a send socket that records datagrams instead
//!  of putting them on the network, and a dispatcher that records received messages.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use crate::channel::MessageType;
use crate::message_dispatcher::{InboundMessage, MessageDispatcher};
use crate::peer_addr::PeerAddr;
use crate::send_pipeline::SendSocket;

/// convenience method for unit test code: create a [PeerAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_peer_addr_from_number(number: u16) -> PeerAddr {
    PeerAddr::from(SocketAddr::from((Ipv4Addr::new(10, 0, (number >> 8) as u8, number as u8), 9000)))
}

/// Records all sent datagrams for later inspection. Tests 'deliver' them by feeding them into the
///  receiving side explicitly, which gives tests full control over loss, duplication and order.
#[derive(Default)]
pub struct CollectingSendSocket {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl CollectingSendSocket {
    pub fn new() -> CollectingSendSocket {
        Default::default()
    }

    /// removes and returns all datagrams sent so far
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn num_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SendSocket for CollectingSendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> usize {
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
        packet_buf.len()
    }
}

#[derive(Default)]
pub struct CollectingMessageDispatcher {
    messages: tokio::sync::Mutex<Vec<InboundMessage>>,
}

impl CollectingMessageDispatcher {
    pub fn new() -> CollectingMessageDispatcher {
        Default::default()
    }

    pub async fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().await.clone()
    }

    /// the payloads of all received messages of a given type, in the order they were received
    pub async fn payloads(&self, message_type: MessageType) -> Vec<Vec<u8>> {
        self.messages.lock().await
            .iter()
            .filter(|m| m.message_type == message_type)
            .map(|m| m.payload.to_vec())
            .collect()
    }

    pub async fn assert_senders(&self, expected_sender: PeerAddr) {
        for message in self.messages.lock().await.iter() {
            assert_eq!(message.sender, expected_sender);
        }
    }
}

#[async_trait]
impl MessageDispatcher for CollectingMessageDispatcher {
    async fn on_message(&self, message: InboundMessage) {
        self.messages.lock().await.push(message);
    }
}
