use std::time::Duration;

use mirage::endpoint::{ClientEndpoint, ServerEndpointConfig};
use mirage::protocol::{wire, Message, VmState};
use mirage::session::{LocalController, SessionServer};
use mirage::transport::framed;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

const TOKEN: &str = "open-sesame";
const WAIT: Duration = Duration::from_secs(5);

/// Accepts one connection and echoes everything back, standing in for
/// the VM's display server.
async fn spawn_echo_display() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        }
    });
    addr
}

#[tokio::test]
async fn forwarded_bytes_are_opaque_and_ordered() {
    let display = spawn_echo_display().await;
    let controller = LocalController::new("demo-vm", display.to_string(), None, false);
    let server = SessionServer::bind(
        "127.0.0.1:0",
        ServerEndpointConfig {
            auth_token: TOKEN.to_string(),
            max_mouse_rate: 30,
            server_timeout_min: 60,
            server_timeout_max: 120,
        },
        controller,
    )
    .await
    .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    timeout(WAIT, client.authenticate(TOKEN))
        .await
        .expect("timely")
        .expect("auth");
    let tunnel = timeout(WAIT, client.attach_viewer())
        .await
        .expect("timely")
        .expect("attach");
    assert!(tunnel.residual.is_empty());
    let mut tunnel = tunnel.stream;

    // Deliberately frame-shaped garbage: if anything were still
    // parsing messages, a bogus huge length prefix would break it.
    let mut payload = Vec::new();
    payload.extend_from_slice(&u32::MAX.to_be_bytes());
    payload.extend_from_slice(b"\x00\x01\x02raw display bytes\xff\xfe");
    payload.extend((0..2048u32).map(|i| (i % 256) as u8));

    tunnel.write_all(&payload).await.expect("write");
    let mut echoed = vec![0u8; payload.len()];
    timeout(WAIT, tunnel.read_exact(&mut echoed))
        .await
        .expect("timely")
        .expect("read");
    assert_eq!(echoed, payload);

    // Closing our side tears the pair down.
    tunnel.shutdown().await.expect("shutdown");
    let mut rest = Vec::new();
    timeout(WAIT, tunnel.read_to_end(&mut rest))
        .await
        .expect("timely")
        .expect("eof");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn vm_stopped_during_viewer_attach_is_ignored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    // Scripted server: answer the handshake, slip a `vm-stopped` in
    // between the attach request and the acknowledgement, then echo.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (mut reader, mut writer) = framed::split(stream);

        let body = reader.recv().await.expect("recv").expect("frame");
        assert!(matches!(
            wire::decode_body(&body).expect("decode"),
            Message::Authenticate { .. }
        ));
        writer
            .send(
                wire::encode_body(&Message::AuthOk {
                    state: VmState::Running,
                    name: "demo-vm".into(),
                    max_mouse_rate: 30,
                    server_timeout_min: 60,
                    server_timeout_max: 120,
                })
                .unwrap(),
            )
            .await
            .expect("send");

        let body = reader.recv().await.expect("recv").expect("frame");
        assert!(matches!(
            wire::decode_body(&body).expect("decode"),
            Message::AttachViewer
        ));
        writer
            .send(wire::encode_body(&Message::VmStopped).unwrap())
            .await
            .expect("send");
        writer
            .send(wire::encode_body(&Message::AttachingViewer).unwrap())
            .await
            .expect("send");

        let (mut stream, residual) = framed::reunite(reader, writer).expect("reunite");
        let (mut read, mut write) = stream.split();
        // Echo anything the client got ahead of the handshake first.
        if !residual.is_empty() {
            write.write_all(&residual).await.expect("residual");
        }
        let _ = tokio::io::copy(&mut read, &mut write).await;
    });

    let mut client = ClientEndpoint::connect(addr).await.expect("connect");
    timeout(WAIT, client.authenticate(TOKEN))
        .await
        .expect("timely")
        .expect("auth");
    let tunnel = timeout(WAIT, client.attach_viewer())
        .await
        .expect("timely")
        .expect("attach survives the stop race");
    let mut stream = tunnel.stream;

    stream.write_all(b"still here").await.expect("write");
    let mut echoed = [0u8; 10];
    timeout(WAIT, stream.read_exact(&mut echoed))
        .await
        .expect("timely")
        .expect("read");
    assert_eq!(&echoed, b"still here");
}
