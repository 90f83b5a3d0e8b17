//! Signaling über einen echten WebSocket-Relay

use call_core::config::ReconnectPolicy;
use call_core::signaling::{Envelope, SessionDescription, SignalingEvent};
use call_core::{
    CallConfig, ConnectionStatus, RelayServer, SignalingClient, SignalingMessage,
    SignalingTransport,
};
use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

fn config_for(addr: SocketAddr) -> CallConfig {
    CallConfig {
        signaling_url: format!("ws://{}", addr),
        connect_timeout_ms: 1000,
        ..Default::default()
    }
}

async fn start_relay() -> SocketAddr {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn next_message(rx: &mut broadcast::Receiver<SignalingEvent>) -> Envelope {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no signaling event")
            .unwrap();
        if let SignalingEvent::Message(envelope) = event {
            if !matches!(envelope.message, SignalingMessage::ActiveUsers { .. }) {
                return envelope;
            }
        }
    }
}

async fn next_status(rx: &mut broadcast::Receiver<SignalingEvent>) -> ConnectionStatus {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no status event")
            .unwrap();
        if let SignalingEvent::Status(status) = event {
            return status;
        }
    }
}

#[tokio::test]
async fn test_offer_is_relayed_with_sender_id() {
    let addr = start_relay().await;
    let alice = SignalingClient::new(&config_for(addr)).unwrap();
    let bob = SignalingClient::new(&config_for(addr)).unwrap();
    let mut bob_rx = bob.subscribe();

    alice.connect("alice").await.unwrap();
    bob.connect("bob").await.unwrap();

    alice
        .send(SignalingMessage::CallOffer {
            target_id: "bob".to_string(),
            sdp_offer: SessionDescription::offer("v=0"),
        })
        .unwrap();

    let envelope = next_message(&mut bob_rx).await;
    assert_eq!(envelope.from_id, "alice");
    assert_eq!(
        envelope.message,
        SignalingMessage::CallOffer {
            target_id: "bob".to_string(),
            sdp_offer: SessionDescription::offer("v=0"),
        }
    );
}

#[tokio::test]
async fn test_offer_to_offline_user_fails() {
    let addr = start_relay().await;
    let alice = SignalingClient::new(&config_for(addr)).unwrap();
    let mut rx = alice.subscribe();
    alice.connect("alice").await.unwrap();

    alice
        .send(SignalingMessage::CallOffer {
            target_id: "nobody".to_string(),
            sdp_offer: SessionDescription::offer("v=0"),
        })
        .unwrap();

    let envelope = next_message(&mut rx).await;
    assert_eq!(
        envelope.message,
        SignalingMessage::CallFailed {
            reason: "user offline".to_string(),
            user_id: Some("nobody".to_string()),
        }
    );
}

#[tokio::test]
async fn test_disconnect_is_announced() {
    let addr = start_relay().await;
    let alice = SignalingClient::new(&config_for(addr)).unwrap();
    let bob = SignalingClient::new(&config_for(addr)).unwrap();
    let mut bob_rx = bob.subscribe();
    alice.connect("alice").await.unwrap();
    bob.connect("bob").await.unwrap();

    alice.disconnect();

    let envelope = next_message(&mut bob_rx).await;
    assert_eq!(
        envelope.message,
        SignalingMessage::UserDisconnected {
            user_id: "alice".to_string()
        }
    );
    assert!(alice
        .send(SignalingMessage::EndCall {
            target_id: "bob".to_string()
        })
        .is_err());
}

/// Nimmt `count` Verbindungen an, schließt jede sofort und hört dann auf
fn closing_server(listener: tokio::net::TcpListener, count: usize) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..count {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        }
    })
}

async fn collect_reconnects(
    rx: &mut broadcast::Receiver<SignalingEvent>,
) -> (Vec<(u32, Duration)>, String) {
    let mut attempts = Vec::new();
    loop {
        match next_status(rx).await {
            ConnectionStatus::Reconnecting { attempt, delay } => attempts.push((attempt, delay)),
            ConnectionStatus::Failed(reason) => return (attempts, reason),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_reconnect_backoff_until_exhausted() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = closing_server(listener, 1);

    let client = SignalingClient::new(&CallConfig {
        reconnect: ReconnectPolicy {
            base_delay_ms: 20,
            max_delay_ms: 60,
            max_attempts: 4,
        },
        ..config_for(addr)
    })
    .unwrap();
    let mut rx = client.subscribe();
    client.connect("alice").await.unwrap();
    server.await.unwrap();

    let (attempts, reason) = collect_reconnects(&mut rx).await;
    let ms = Duration::from_millis;
    assert_eq!(
        attempts,
        vec![(1, ms(20)), (2, ms(40)), (3, ms(60)), (4, ms(60))]
    );
    assert_eq!(reason, "reconnect attempts exhausted");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_reconnect_resets_after_success() {
    // Erste Verbindung und erster Reconnect werden angenommen und geschlossen
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = closing_server(listener, 2);

    let client = SignalingClient::new(&CallConfig {
        reconnect: ReconnectPolicy {
            base_delay_ms: 20,
            max_delay_ms: 200,
            max_attempts: 3,
        },
        ..config_for(addr)
    })
    .unwrap();
    let mut rx = client.subscribe();
    client.connect("alice").await.unwrap();

    let (attempts, reason) = collect_reconnects(&mut rx).await;
    server.await.unwrap();

    let ms = Duration::from_millis;
    assert_eq!(
        attempts,
        vec![(1, ms(20)), (1, ms(20)), (2, ms(40)), (3, ms(80))]
    );
    assert_eq!(reason, "reconnect attempts exhausted");
}
