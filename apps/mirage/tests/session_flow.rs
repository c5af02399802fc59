use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mirage::endpoint::{ClientEndpoint, ClientEvent, EndpointError, ServerEndpointConfig};
use mirage::protocol::{wire, Message, VmState, MAX_MESSAGE_SIZE};
use mirage::session::{LocalController, SessionServer};
use mirage::transport::framed;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TOKEN: &str = "open-sesame";
const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerEndpointConfig {
    ServerEndpointConfig {
        auth_token: TOKEN.to_string(),
        max_mouse_rate: 30,
        server_timeout_min: 60,
        server_timeout_max: 120,
    }
}

async fn spawn_server(controller: Arc<LocalController>) -> SocketAddr {
    let server = SessionServer::bind("127.0.0.1:0", test_config(), controller)
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

#[tokio::test]
async fn authenticate_start_and_stop_round_trip() {
    let controller = LocalController::new("demo-vm", "127.0.0.1:1", None, false);
    let addr = spawn_server(controller).await;

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    let info = timeout(WAIT, client.authenticate(TOKEN))
        .await
        .expect("timely")
        .expect("auth");
    assert_eq!(info.name, "demo-vm");
    assert_eq!(info.state, VmState::Stopped);
    assert_eq!(info.max_mouse_rate, 30);
    assert_eq!(info.server_timeout_min, 60);
    assert_eq!(info.server_timeout_max, 120);

    client.start_vm().await.expect("start");
    let event = timeout(WAIT, client.next_event())
        .await
        .expect("timely")
        .expect("event");
    assert_eq!(
        event,
        ClientEvent::StartupComplete {
            check_display: false
        }
    );

    client.stop_vm().await.expect("stop");
    let event = timeout(WAIT, client.next_event())
        .await
        .expect("timely")
        .expect("event");
    assert_eq!(event, ClientEvent::VmStopped);
}

#[tokio::test]
async fn bad_token_is_fatal_auth_failure() {
    let controller = LocalController::new("demo-vm", "127.0.0.1:1", None, false);
    let addr = spawn_server(controller).await;

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    let err = timeout(WAIT, client.authenticate("wrong"))
        .await
        .expect("timely")
        .expect_err("must fail");
    assert!(matches!(err, EndpointError::AuthFailed(_)), "{err}");
}

#[tokio::test]
async fn startup_progress_fractions_follow_chunk_fetches() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("stats")).unwrap();
    std::fs::create_dir_all(dir.path().join("streams")).unwrap();
    std::fs::write(dir.path().join("stats/chunks"), "4\n").unwrap();
    std::fs::write(dir.path().join("streams/chunk_fetched"), "0\n1\n2\n3\n").unwrap();

    let controller = LocalController::new(
        "demo-vm",
        "127.0.0.1:1",
        Some(dir.path().to_path_buf()),
        false,
    );
    let addr = spawn_server(controller).await;

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    timeout(WAIT, client.authenticate(TOKEN))
        .await
        .expect("timely")
        .expect("auth");
    client.start_vm().await.expect("start");

    let mut fractions = Vec::new();
    loop {
        let event = timeout(WAIT, client.next_event())
            .await
            .expect("timely")
            .expect("event");
        match event {
            ClientEvent::StartupProgress { fraction } => fractions.push(fraction),
            ClientEvent::StartupComplete { .. } => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(fractions, vec![0.25, 0.5, 0.75, 1.0]);
}

#[tokio::test]
async fn message_before_authentication_draws_error_and_keeps_connection() {
    let controller = LocalController::new("demo-vm", "127.0.0.1:1", None, false);
    let addr = spawn_server(controller).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (mut reader, mut writer) = framed::split(stream);

    writer
        .send(wire::encode_body(&Message::StartVm).unwrap())
        .await
        .expect("send");
    let body = timeout(WAIT, reader.recv())
        .await
        .expect("timely")
        .expect("recv")
        .expect("frame");
    match wire::decode_body(&body).expect("decode") {
        Message::Error { message } => assert!(message.contains("Not authenticated")),
        other => panic!("unexpected reply {other:?}"),
    }

    // Same connection still authenticates fine afterwards.
    writer
        .send(
            wire::encode_body(&Message::Authenticate {
                token: TOKEN.to_string(),
            })
            .unwrap(),
        )
        .await
        .expect("send");
    let body = timeout(WAIT, reader.recv())
        .await
        .expect("timely")
        .expect("recv")
        .expect("frame");
    assert!(matches!(
        wire::decode_body(&body).expect("decode"),
        Message::AuthOk { .. }
    ));
}

#[tokio::test]
async fn state_inconsistent_message_terminates_the_connection() {
    let controller = LocalController::new("demo-vm", "127.0.0.1:1", None, false);
    let addr = spawn_server(controller).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (mut reader, mut writer) = framed::split(stream);
    writer
        .send(
            wire::encode_body(&Message::Authenticate {
                token: TOKEN.to_string(),
            })
            .unwrap(),
        )
        .await
        .expect("send");
    let body = reader.recv().await.expect("recv").expect("frame");
    assert!(matches!(
        wire::decode_body(&body).expect("decode"),
        Message::AuthOk { .. }
    ));

    // A server-to-client message type from the client is a violation.
    writer
        .send(wire::encode_body(&Message::AttachingViewer).unwrap())
        .await
        .expect("send");
    let body = timeout(WAIT, reader.recv())
        .await
        .expect("timely")
        .expect("recv")
        .expect("frame");
    assert!(matches!(
        wire::decode_body(&body).expect("decode"),
        Message::Error { .. }
    ));
    // ...followed by the server closing the connection.
    let next = timeout(WAIT, reader.recv()).await.expect("timely");
    assert!(matches!(next, Ok(None)));
}

#[tokio::test]
async fn oversized_message_is_drained_reported_and_terminates() {
    let controller = LocalController::new("demo-vm", "127.0.0.1:1", None, false);
    let addr = spawn_server(controller).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = framed::FramedReader::new(read_half);

    let oversized = vec![0u8; MAX_MESSAGE_SIZE + 1];
    write_half
        .write_all(&(oversized.len() as u32).to_be_bytes())
        .await
        .expect("header");
    write_half.write_all(&oversized).await.expect("body");

    let body = timeout(WAIT, reader.recv())
        .await
        .expect("timely")
        .expect("recv")
        .expect("frame");
    assert!(matches!(
        wire::decode_body(&body).expect("decode"),
        Message::Error { .. }
    ));
    let next = timeout(WAIT, reader.recv()).await.expect("timely");
    assert!(matches!(next, Ok(None)));
}

#[tokio::test]
#[should_panic(expected = "cannot start the VM")]
async fn sending_from_the_wrong_state_is_a_contract_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    // Never authenticated; this must panic, not transmit.
    let _ = client.start_vm().await;
}
