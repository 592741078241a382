use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::peer_addr::PeerAddr;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// returns the number of bytes written, 0 if sending failed
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> usize;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> usize {
        trace!("UDP socket: sending packet to {:?}", to);

        match self.send_to(packet_buf, to).await {
            Ok(num_written) => num_written,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                0
            }
        }
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    /// Sends a complete datagram. Send failures are logged rather than returned: the transport
    ///  is unreliable at this level, and reliable channels compensate by retransmitting.
    pub async fn send_packet(&self, to: PeerAddr, packet_buf: &[u8]) -> usize {
        let num_written = self.socket.do_send_packet(to.socket_addr(), packet_buf).await;
        if num_written != packet_buf.len() {
            error!("short write sending to {:?}: {} of {} bytes", to, num_written, packet_buf.len());
        }
        num_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;

    #[rstest]
    #[case::complete(3, 3)]
    #[case::short(3, 2)]
    #[case::failed(3, 0)]
    fn test_send_packet(#[case] len: usize, #[case] written: usize) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let expected_buf = vec![7u8; len];

            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .once()
                .withf(move |addr, buf|
                    addr == &SocketAddr::from(([1, 2, 3, 4], 9)) &&
                        buf == expected_buf.as_slice()
                )
                .returning(move |_, _| written)
            ;

            let pipeline = SendPipeline::new(Arc::new(send_socket));
            let actual = pipeline.send_packet(PeerAddr::from(SocketAddr::from(([1, 2, 3, 4], 9))), &vec![7u8; len]).await;
            assert_eq!(actual, written);
        });
    }

    #[test]
    fn test_udp_send_socket() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

            let num_written = sender.do_send_packet(receiver.local_addr().unwrap(), &[1, 2, 3]).await;
            assert_eq!(num_written, 3);

            let mut buf = [0u8; 16];
            let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[1, 2, 3]);
            assert_eq!(from, sender.local_addr().unwrap());
        });
    }
}
