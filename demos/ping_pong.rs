//! Binds a server and a client socket on localhost. The client sends pings on all three
//!  channels, and the server answers each ping with a pong on the channel it arrived on.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use udp_channels::channel::{Channel, MessageType, Role, Target};
use udp_channels::config::TransportConfig;
use udp_channels::message_dispatcher::{HandlerRegistry, QueueDispatcher};
use udp_channels::peer_addr::PeerAddr;
use udp_channels::transport_socket::TransportSocket;

const PING: MessageType = MessageType(10);
const PONG: MessageType = MessageType(11);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let server_config = TransportConfig::default_ipv4(SocketAddr::from_str("127.0.0.1:9810")?);
    let (server_dispatcher, mut server_queue) = QueueDispatcher::new(server_config.receive_queue_size);
    let server = Arc::new(TransportSocket::bind(server_config, Arc::new(server_dispatcher)).await?);

    let mut client_config = TransportConfig::default_ipv4(SocketAddr::from_str("127.0.0.1:0")?);
    client_config.role = Role::Client;
    let mut handlers = HandlerRegistry::new();
    handlers.register(PONG, |msg| {
        info!("client received pong #{:?} on {:?} from {:?}", msg.payload.as_ref(), msg.channel, msg.sender);
    })?;
    let client = TransportSocket::bind(client_config, Arc::new(handlers)).await?;

    let server_for_replies = server.clone();
    let reply_loop = tokio::spawn(async move {
        while let Some(msg) = server_queue.recv().await {
            if msg.message_type != PING {
                continue;
            }
            info!("server received ping #{:?} on {:?} from {:?}", msg.payload.as_ref(), msg.channel, msg.sender);
            if let Err(e) = server_for_replies.send_message(PONG, &msg.payload, msg.sender, msg.channel, Target::Me).await {
                info!("error sending pong: {}", e);
            }
        }
    });

    let server_addr = PeerAddr::from(server.local_addr());
    for i in 0u32..5 {
        for channel in [Channel::Unreliable, Channel::Reliable, Channel::ReliableOrdered] {
            client.send_message(PING, &i.to_le_bytes(), server_addr, channel, Target::Server).await?;
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    client.close().await;
    server.close().await;
    reply_loop.abort();
    Ok(())
}
