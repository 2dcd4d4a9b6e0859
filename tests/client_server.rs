use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use tracing::Level;

use teleport::config::TeleportConfig;
use teleport::session::client::{ClientProcessor, ClientState};
use teleport::session::server::ServerProcessor;
use teleport::session::{ClientDisconnectReason, ServerDisconnectReason};
use teleport::test_util::listener::{ClientEvent, RecordingClientListener, RecordingServerListener, ServerEvent};
use teleport::test_util::message::TestMessage;
use teleport::transport::udp::UdpTransport;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

type Server = ServerProcessor<UdpTransport>;
type Client = ClientProcessor<UdpTransport>;

async fn tick_until(server: &mut Server, client: &mut Client, condition: impl Fn(&Server, &Client) -> bool) -> anyhow::Result<()> {
    for _ in 0..500 {
        server.tick()?;
        client.tick()?;
        if condition(server, client) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition was not reached in time");
}

#[tokio::test]
async fn test_session_over_localhost() -> anyhow::Result<()> {
    let config = Arc::new(TeleportConfig::default());

    let server_listener = RecordingServerListener::default();
    let mut server = ServerProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(server_listener.clone()))?;
    server.register::<TestMessage>()?;
    let server_addr = server.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await?;

    let client_listener = RecordingClientListener::default();
    let mut client = ClientProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(client_listener.clone()))?;
    client.register::<TestMessage>()?;
    client.connect("127.0.0.1", server_addr.port()).await?;

    tick_until(&mut server, &mut client, |_, c| c.is_authenticated()).await?;
    assert_eq!(client.client_state(), ClientState::Authenticated { client_id: 0, auth_key: server.session(0).unwrap().auth_key });
    assert!(server_listener.events().contains(&ServerEvent::Online));
    assert_eq!(client_listener.events(), vec![ClientEvent::Connected(0)]);

    client.send_to_server(&mut TestMessage::new(1, "hello"))?;
    tick_until(&mut server, &mut client, |_, _| server_listener.events().iter()
        .any(|e| matches!(e, ServerEvent::MessageArrived(0, _, m) if m == &TestMessage::new(1, "hello")))
    ).await?;

    server.send_to_all(&mut TestMessage::new(2, "world"))?;
    tick_until(&mut server, &mut client, |_, c| c.server_time_estimate().is_some() &&
        client_listener.events().contains(&ClientEvent::MessageArrived(TestMessage::new(2, "world")))
    ).await?;

    let error = client.server_time_estimate().unwrap() - server.local_time();
    assert!(error.abs() < 0.1, "clock estimate is off by {}", error);

    client.disconnect_and_stop().await?;
    assert_eq!(client_listener.events().last(), Some(&ClientEvent::Disconnected(ClientDisconnectReason::ClientSideDisconnectRequested)));

    let mut disconnected = false;
    for _ in 0..500 {
        server.tick()?;
        if server_listener.events().contains(&ServerEvent::ClientDisconnected(0, ServerDisconnectReason::ClientInitiatedDisconnect)) {
            disconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(disconnected);
    assert!(server.client_ids().is_empty());

    server.stop_listening().await?;
    assert!(!server.is_listening());
    Ok(())
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() -> anyhow::Result<()> {
    let config = Arc::new(TeleportConfig::default());

    let mut server = ServerProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(RecordingServerListener::default()))?;
    let server_addr = server.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await?;

    let client_listener = RecordingClientListener::default();
    let mut client = ClientProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(client_listener.clone()))?;
    client.connect("127.0.0.1", server_addr.port()).await?;
    tick_until(&mut server, &mut client, |_, c| c.is_authenticated()).await?;

    server.stop_listening().await?;
    for _ in 0..500 {
        client.tick()?;
        if client.client_state() == ClientState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client_listener.events().last(), Some(&ClientEvent::Disconnected(ClientDisconnectReason::ServerRequestedDisconnect)));

    client.disconnect_and_stop().await
}

#[tokio::test]
async fn test_shutdown_after_client_went_silent() -> anyhow::Result<()> {
    let config = Arc::new(TeleportConfig {
        endpoint_timeout: Duration::from_millis(300),
        ..TeleportConfig::default()
    });

    let server_listener = RecordingServerListener::default();
    let mut server = ServerProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(server_listener.clone()))?;
    let server_addr = server.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await?;

    let mut client = ClientProcessor::new(UdpTransport::new(config.clone())?, config.clone(), Box::new(RecordingClientListener::default()))?;
    client.connect("127.0.0.1", server_addr.port()).await?;
    tick_until(&mut server, &mut client, |_, c| c.is_authenticated()).await?;

    // the client disappears without a disconnect, and the server does not tick until its endpoint timed out
    client.transport().stop().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    server.stop_listening().await?;
    assert!(!server.is_listening());
    assert!(server.client_ids().is_empty());
    assert_eq!(server_listener.events().last(), Some(&ServerEvent::ClientDisconnected(0, ServerDisconnectReason::ClientTimeout)));
    Ok(())
}
