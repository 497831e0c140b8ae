//! End-to-end tests: real sockets, full client/server exchanges.

use std::time::{Duration, Instant};

use bytes::Bytes;
use grpc::{
    Algorithm, Batch, CallDetails, Channel, Code, CompletionQueue, CompletionType, EventKind,
    Metadata, Runtime, Server, Status,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait(cq: &CompletionQueue, secs: u64) -> grpc::Event {
    cq.next(Instant::now() + Duration::from_secs(secs))
}

/// Bind a started echo-capable server on an ephemeral port with `cq`
/// registered for its notifications.
fn start_server(runtime: &Runtime, cq: &CompletionQueue) -> (Server, u16) {
    init_tracing();
    let server = Server::new(runtime);
    let port = server.add_insecure_http2_port("127.0.0.1:0");
    assert!(port > 0, "server must bind an ephemeral port");
    server.register_completion_queue(cq);
    server.start();
    (server, port)
}

/// Serve exactly one unary echo call, then return.
fn serve_one_echo(server: &Server, cq: &CompletionQueue) -> CallDetails {
    let requested = server.request_call(cq, 100).unwrap();
    let event = wait(cq, 5);
    assert_eq!(event.tag, 100);
    assert!(event.success);
    let (call, details) = requested.take().expect("requested call materialized");

    // Read the request message.
    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    let request = batch.recv_message();
    call.start_batch(batch, 101).unwrap();
    let event = wait(cq, 5);
    assert_eq!(event.tag, 101);
    assert!(event.success);
    let payload = request.take().unwrap().expect("request message present");

    // Echo it back and finish OK.
    let mut batch = Batch::new();
    batch.send_message(payload);
    batch.send_status_from_server(Status::ok(), Metadata::new());
    let closed = batch.recv_close_on_server();
    call.start_batch(batch, 102).unwrap();
    let event = wait(cq, 5);
    assert_eq!(event.tag, 102);
    assert!(event.success);
    assert_eq!(closed.take(), Some(false));

    details
}

#[test]
fn lifecycle_create_and_destroy_everything() {
    let runtime = Runtime::new();
    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, "localhost:50051");

    let call = channel.create_call(
        &cq,
        "/echo.Echo/SayHello",
        None,
        Some(Instant::now() + Duration::from_millis(5000)),
    );
    assert_eq!(call.method(), "/echo.Echo/SayHello");
    drop(call);

    cq.shutdown();
    assert_eq!(wait(&cq, 1).kind, EventKind::Shutdown);
    drop(channel);
    drop(runtime);
}

#[test]
fn unary_echo_roundtrip() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    let server_thread = {
        let server_cq = server_cq.clone();
        std::thread::spawn(move || {
            let details = serve_one_echo(&server, &server_cq);
            assert_eq!(details.method, "/echo.Echo/Say");
            server
        })
    };

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/echo.Echo/Say",
        None,
        Some(Instant::now() + Duration::from_secs(5)),
    );

    let mut batch = Batch::new();
    let mut metadata = Metadata::new();
    metadata.add("x-request-id", "42");
    batch.send_initial_metadata(metadata);
    batch.send_message(&b"hello over the wire"[..]);
    batch.send_close_from_client();
    let initial = batch.recv_initial_metadata();
    let reply = batch.recv_message();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 7).unwrap();

    let event = wait(&cq, 5);
    assert_eq!(event.tag, 7);
    assert!(event.success, "echo batch should succeed");

    assert!(initial.take().is_some());
    let reply = reply.take().unwrap().expect("echo reply present");
    assert_eq!(&reply[..], b"hello over the wire");
    let (status, _trailing) = status.take().unwrap();
    assert_eq!(status.code(), Code::Ok);

    let server = server_thread.join().unwrap();
    server.shutdown_and_notify(&server_cq, 999);
    let event = wait(&server_cq, 5);
    assert_eq!(event.tag, 999);
    assert!(event.success);
}

#[test]
fn zero_length_message_is_deliverable() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    let server_thread = {
        let server_cq = server_cq.clone();
        std::thread::spawn(move || {
            serve_one_echo(&server, &server_cq);
            server
        })
    };

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/echo.Echo/Say",
        None,
        Some(Instant::now() + Duration::from_secs(5)),
    );

    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    batch.send_message(Bytes::new());
    batch.send_close_from_client();
    let reply = batch.recv_message();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 1).unwrap();

    let event = wait(&cq, 5);
    assert!(event.success);

    // An empty message is Some(empty), never None.
    let reply = reply.take().unwrap();
    assert_eq!(reply, Some(Bytes::new()));
    assert_eq!(status.take().unwrap().0.code(), Code::Ok);

    let server = server_thread.join().unwrap();
    server.shutdown_and_notify(&server_cq, 999);
    assert!(wait(&server_cq, 5).success);
}

#[test]
fn client_streaming_three_messages() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    let server_thread = {
        let server_cq = server_cq.clone();
        std::thread::spawn(move || {
            let requested = server.request_call(&server_cq, 200).unwrap();
            assert!(wait(&server_cq, 5).success);
            let (call, _details) = requested.take().unwrap();

            let mut batch = Batch::new();
            batch.send_initial_metadata(Metadata::new());
            call.start_batch(batch, 201).unwrap();
            assert!(wait(&server_cq, 5).success);

            // Read until the client half-closes.
            let mut received = Vec::new();
            loop {
                let mut batch = Batch::new();
                let message = batch.recv_message();
                call.start_batch(batch, 202).unwrap();
                assert!(wait(&server_cq, 5).success);
                match message.take().unwrap() {
                    Some(payload) => received.push(payload),
                    None => break,
                }
            }

            let mut batch = Batch::new();
            batch.send_message(Bytes::from(format!("got {}", received.len())));
            batch.send_status_from_server(Status::ok(), Metadata::new());
            call.start_batch(batch, 203).unwrap();
            assert!(wait(&server_cq, 5).success);

            (server, received)
        })
    };

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/stream.Sink/Collect",
        None,
        Some(Instant::now() + Duration::from_secs(5)),
    );

    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    batch.send_message(&b"one"[..]);
    call.start_batch(batch, 1).unwrap();
    assert!(wait(&cq, 5).success);

    let mut batch = Batch::new();
    batch.send_message(&b"two"[..]);
    call.start_batch(batch, 2).unwrap();
    assert!(wait(&cq, 5).success);

    let mut batch = Batch::new();
    batch.send_message(&b"three"[..]);
    batch.send_close_from_client();
    call.start_batch(batch, 3).unwrap();
    assert!(wait(&cq, 5).success);

    let mut batch = Batch::new();
    let reply = batch.recv_message();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 4).unwrap();
    assert!(wait(&cq, 5).success);

    assert_eq!(&reply.take().unwrap().unwrap()[..], b"got 3");
    assert_eq!(status.take().unwrap().0.code(), Code::Ok);

    let (server, received) = server_thread.join().unwrap();
    let received: Vec<&[u8]> = received.iter().map(|b| &b[..]).collect();
    assert_eq!(received, vec![&b"one"[..], b"two", b"three"]);
    server.shutdown_and_notify(&server_cq, 999);
    assert!(wait(&server_cq, 5).success);
}

#[test]
fn gzip_compressed_roundtrip() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    let server_thread = {
        let server_cq = server_cq.clone();
        std::thread::spawn(move || {
            let requested = server.request_call(&server_cq, 300).unwrap();
            assert!(wait(&server_cq, 5).success);
            let (call, _details) = requested.take().unwrap();

            // Reply compressed as well.
            call.set_compression(Algorithm::Gzip);

            let mut batch = Batch::new();
            batch.send_initial_metadata(Metadata::new());
            let request = batch.recv_message();
            call.start_batch(batch, 301).unwrap();
            assert!(wait(&server_cq, 5).success);
            let payload = request.take().unwrap().unwrap();

            let mut batch = Batch::new();
            batch.send_message(payload);
            batch.send_status_from_server(Status::ok(), Metadata::new());
            call.start_batch(batch, 302).unwrap();
            assert!(wait(&server_cq, 5).success);
            server
        })
    };

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/echo.Echo/Say",
        None,
        Some(Instant::now() + Duration::from_secs(5)),
    );
    call.set_compression(Algorithm::Gzip);

    let payload: Vec<u8> = b"compress me ".repeat(500);

    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    batch.send_message(payload.clone());
    batch.send_close_from_client();
    let reply = batch.recv_message();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 1).unwrap();

    assert!(wait(&cq, 5).success);
    assert_eq!(&reply.take().unwrap().unwrap()[..], &payload[..]);
    assert_eq!(status.take().unwrap().0.code(), Code::Ok);

    let server = server_thread.join().unwrap();
    server.shutdown_and_notify(&server_cq, 999);
    assert!(wait(&server_cq, 5).success);
}

#[test]
fn deadline_expires_without_server_response() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    // Accept the call but never answer it.
    let requested = server.request_call(&server_cq, 400).unwrap();

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/slow.Slow/Never",
        None,
        Some(Instant::now() + Duration::from_millis(150)),
    );

    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 1).unwrap();

    let event = wait(&cq, 5);
    assert_eq!(event.tag, 1);
    assert!(!event.success, "deadline must fail the batch");
    assert_eq!(status.take().unwrap().0.code(), Code::DeadlineExceeded);

    // The server saw the call arrive; it just never responded.
    assert!(wait(&server_cq, 5).success);
    let _ = requested.take();

    server.shutdown_and_notify(&server_cq, 999);
    assert!(wait(&server_cq, 5).success);
}

#[test]
fn deadline_on_unreachable_channel() {
    let runtime = Runtime::new();
    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, "127.0.0.1:1");
    let call = channel.create_call(
        &cq,
        "/echo.Echo/Say",
        None,
        Some(Instant::now() + Duration::from_millis(100)),
    );

    let mut batch = Batch::new();
    batch.send_initial_metadata(Metadata::new());
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 9).unwrap();

    let event = cq.next(Instant::now() + Duration::from_secs(1));
    assert_eq!(event.tag, 9);
    assert!(!event.success);
    let code = status.take().unwrap().0.code();
    assert!(
        code == Code::DeadlineExceeded || code == Code::Unavailable,
        "unexpected code {:?}",
        code
    );
}

#[test]
fn cancellation_fails_pending_batch() {
    let runtime = Runtime::new();
    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, "127.0.0.1:1");
    let call = channel.create_call(&cq, "/echo.Echo/Say", None, None);

    call.cancel();

    let mut batch = Batch::new();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 5).unwrap();

    let event = wait(&cq, 2);
    assert_eq!(event.tag, 5);
    assert!(!event.success);
    assert_eq!(status.take().unwrap().0.code(), Code::Cancelled);
}

#[test]
fn server_bind_start_shutdown_notify() {
    let runtime = Runtime::new();
    let server = Server::new(&runtime);
    let port = server.add_insecure_http2_port("127.0.0.1:0");
    assert!(port > 0);

    let cq = CompletionQueue::new(CompletionType::Next);
    server.register_completion_queue(&cq);
    server.start();

    let started = Instant::now();
    server.shutdown_and_notify(&cq, 77);
    let event = cq.next(Instant::now() + Duration::from_secs(1));
    assert_eq!(event.tag, 77);
    assert_eq!(event.kind, EventKind::OpComplete);
    assert!(event.success);
    assert!(started.elapsed() < Duration::from_secs(1));

    cq.shutdown();
    assert_eq!(wait(&cq, 1).kind, EventKind::Shutdown);
}

#[test]
fn hpack_metadata_roundtrip_on_the_wire_format() {
    // The canonical three-entry block survives encode/decode in order.
    use http2::hpack::{decode_block, encode_block};
    use http2::HeaderField;

    let fields = vec![
        HeaderField::new("content-type", "application/grpc"),
        HeaderField::new("user-agent", "x/1"),
        HeaderField::new("grpc-status", "0"),
    ];

    let mut block = Vec::new();
    encode_block(&fields, &mut block);
    let decoded = decode_block(&block).unwrap();
    assert_eq!(decoded, fields);
}

#[test]
fn flow_controlled_send_drains_in_order() {
    // Engine-level: the peer advertises a 10-byte stream window, the
    // sender has 25 bytes. Each WINDOW_UPDATE round releases more.
    use http2::{
        ConnEvent, Connection, ConnectionSettings, HeaderField, ServerConnection,
    };

    let mut client = Connection::new(ConnectionSettings::default());
    let mut server =
        ServerConnection::new(ConnectionSettings::new().initial_window_size(10));

    fn pump(
        client: &mut Connection,
        server: &mut ServerConnection,
        received: &mut Vec<u8>,
    ) {
        loop {
            let mut moved = false;
            let out = client.take_write_buf();
            if !out.is_empty() {
                moved = true;
                server.recv(&out).unwrap();
            }
            let out = server.take_write_buf();
            if !out.is_empty() {
                moved = true;
                client.recv(&out).unwrap();
            }
            for event in server.poll_events() {
                if let ConnEvent::Data { data, .. } = event {
                    received.extend_from_slice(&data);
                }
            }
            client.poll_events();
            if !moved {
                break;
            }
        }
    }

    let mut received = Vec::new();
    pump(&mut client, &mut server, &mut received);
    assert!(client.is_ready());

    let id = client.open_stream().unwrap();
    client
        .send_headers(id, &[HeaderField::new(":method", "POST")], false)
        .unwrap();

    let payload: Vec<u8> = (0..25u8).collect();

    // First burst is capped by the 10-byte stream window.
    let first = client.send_data(id, &payload, true).unwrap();
    assert_eq!(first, 10);

    let mut sent = first;
    let mut rounds = 0;
    while sent < payload.len() {
        // Receiving the data makes the server replenish the window;
        // the WINDOW_UPDATE unblocks the next burst.
        pump(&mut client, &mut server, &mut received);
        let n = client.send_data(id, &payload[sent..], true).unwrap();
        assert!(n > 0, "window update must unblock the sender");
        sent += n;
        rounds += 1;
        assert!(rounds < 10, "sender failed to make progress");
    }
    pump(&mut client, &mut server, &mut received);

    assert!(rounds >= 2, "the send must have been window-limited");
    assert_eq!(received, payload);
}

#[test]
fn metadata_order_preserved_end_to_end() {
    let runtime = Runtime::new();
    let server_cq = CompletionQueue::new(CompletionType::Next);
    let (server, port) = start_server(&runtime, &server_cq);

    let server_thread = {
        let server_cq = server_cq.clone();
        std::thread::spawn(move || {
            let requested = server.request_call(&server_cq, 500).unwrap();
            assert!(wait(&server_cq, 5).success);
            let (call, _details) = requested.take().unwrap();

            let mut batch = Batch::new();
            let initial = batch.recv_initial_metadata();
            call.start_batch(batch, 501).unwrap();
            assert!(wait(&server_cq, 5).success);
            let metadata = initial.take().unwrap();

            let mut batch = Batch::new();
            batch.send_initial_metadata(Metadata::new());
            batch.send_status_from_server(Status::ok(), Metadata::new());
            call.start_batch(batch, 502).unwrap();
            assert!(wait(&server_cq, 5).success);

            (server, metadata)
        })
    };

    let cq = CompletionQueue::new(CompletionType::Next);
    let channel = Channel::insecure(&runtime, format!("127.0.0.1:{}", port));
    let call = channel.create_call(
        &cq,
        "/meta.Meta/Check",
        None,
        Some(Instant::now() + Duration::from_secs(5)),
    );

    let mut metadata = Metadata::new();
    metadata.add("z-last-first", "1");
    metadata.add("a-then", "2");
    metadata.add("m-finally", "3");
    metadata.add("bin-data-bin", vec![0u8, 255, 128]);

    let mut batch = Batch::new();
    batch.send_initial_metadata(metadata);
    batch.send_close_from_client();
    let status = batch.recv_status_on_client();
    call.start_batch(batch, 1).unwrap();
    assert!(wait(&cq, 5).success);
    assert_eq!(status.take().unwrap().0.code(), Code::Ok);

    let (server, received) = server_thread.join().unwrap();
    let keys: Vec<&str> = received.iter().map(|(k, _)| k).collect();
    let z = keys.iter().position(|k| *k == "z-last-first").unwrap();
    let a = keys.iter().position(|k| *k == "a-then").unwrap();
    let m = keys.iter().position(|k| *k == "m-finally").unwrap();
    assert!(z < a && a < m, "insertion order preserved: {:?}", keys);
    assert_eq!(received.get("bin-data-bin"), Some(&[0u8, 255, 128][..]));

    server.shutdown_and_notify(&server_cq, 999);
    assert!(wait(&server_cq, 5).success);
}
