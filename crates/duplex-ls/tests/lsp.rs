#![cfg(feature = "lsp")]

//! End-to-end tests for LSP connections, one side driven over raw pipes.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{read_raw, runtime, write_raw};
use duplex_ls::transport::pipe_pair;
use duplex_ls::{ConnectionBuilder, HandlerOptions, RequestError};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn server_builder(handle: tokio::runtime::Handle) -> ConnectionBuilder {
    let builder = ConnectionBuilder::lsp(handle)
        .flush_timeout(Duration::from_millis(500))
        .scheduler_grace(Duration::from_millis(500));
    builder
        .registry()
        .register_raw_request("initialize", HandlerOptions::default(), |_, _, _| async {
            Ok(json!({"capabilities": {}}))
        })
        .unwrap();
    builder
}

fn handshake(peer_read: &mut impl std::io::BufRead, peer_write: &mut impl Write) {
    write_raw(
        peer_write,
        r#"{"jsonrpc":"2.0","id":100,"method":"initialize","params":{"capabilities":{}}}"#,
    );
    let resp = read_raw(peer_read);
    assert_eq!(resp["id"], 100);
    assert!(resp["result"]["capabilities"].is_object());
    write_raw(
        peer_write,
        r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#,
    );
}

#[test]
fn answers_ping_request() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("ping", HandlerOptions::default(), |_, _, _| async {
            Ok(json!("pong"))
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    write_raw(
        &mut peer_write,
        r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":null}"#,
    );
    let resp = read_raw(&mut peer_read);
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"], "pong");

    server.disconnect(true);
}

#[test]
fn handles_two_messages_in_one_write() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("ping", HandlerOptions::default(), |_, _, _| async {
            Ok(json!("pong"))
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    let first = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
    let second = r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;
    let both = format!(
        "Content-Length: {}\r\n\r\n{first}Content-Length: {}\r\n\r\n{second}",
        first.len(),
        second.len()
    );
    peer_write.write_all(both.as_bytes()).unwrap();
    peer_write.flush().unwrap();

    let mut ids = vec![
        read_raw(&mut peer_read)["id"].as_i64().unwrap(),
        read_raw(&mut peer_read)["id"].as_i64().unwrap(),
    ];
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    server.disconnect(true);
}

#[test]
fn unknown_method_is_answered_with_method_not_found() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let mut server = server_builder(rt.handle().clone()).build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","id":7,"method":"nope"}"#);
    let resp = read_raw(&mut peer_read);
    assert_eq!(resp["id"], 7);
    assert_eq!(resp["error"]["code"], -32601);

    server.disconnect(true);
}

#[test]
fn replies_to_invalid_and_unparseable_payloads() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let mut server = server_builder(rt.handle().clone()).build(server_read, server_write);
    server.connect().unwrap();

    // wrong protocol: null id, -32600
    write_raw(&mut peer_write, "{}");
    let resp = read_raw(&mut peer_read);
    assert!(resp["id"].is_null());
    assert_eq!(resp["error"]["code"], -32600);
    assert_eq!(resp["error"]["message"], "Unexpected protocol");

    // not JSON at all: null id, -32700
    write_raw(&mut peer_write, "hello there");
    let resp = read_raw(&mut peer_read);
    assert!(resp["id"].is_null());
    assert_eq!(resp["error"]["code"], -32700);

    server.disconnect(true);
}

#[test]
fn spurious_response_is_dropped_without_crashing() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("ping", HandlerOptions::default(), |_, _, _| async {
            Ok(json!("pong"))
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    // a response for a request we never sent
    write_raw(
        &mut peer_write,
        r#"{"jsonrpc":"2.0","id":42,"error":{"code":-32601,"message":"unknown"}}"#,
    );

    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
    let resp = read_raw(&mut peer_read);
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"], "pong");

    server.disconnect(true);
}

#[test]
fn full_duplex_initialize_and_echo() {
    let rt = runtime();
    let ((client_read, client_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("echo", HandlerOptions::default(), |_, params, _| async move {
            Ok(params)
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    let mut client = ConnectionBuilder::lsp(rt.handle().clone())
        .flush_timeout(Duration::from_millis(500))
        .scheduler_grace(Duration::from_millis(500))
        .build(client_read, client_write);
    client.connect().unwrap();

    rt.block_on(async {
        // issued before the handshake: held back, flushed on ready
        let early = client.client().send_request_("echo", json!("early"), None);

        let init = client.initialize(json!({"capabilities": {}})).await.unwrap();
        assert!(init["capabilities"].is_object());
        client.ready().await;
        assert!(client.is_ready());

        assert_eq!(early.await.unwrap(), json!("early"));

        let echoed = client
            .client()
            .send_request_("echo", json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(echoed, json!({"x": 1}));
    });

    client.disconnect(true);
    server.disconnect(true);
}

#[test]
fn cancelling_a_request_notifies_the_peer() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (client_read, client_write)) = pipe_pair().unwrap();

    let mut client = ConnectionBuilder::lsp(rt.handle().clone())
        .flush_timeout(Duration::from_millis(500))
        .scheduler_grace(Duration::from_millis(500))
        .build(client_read, client_write);
    client.connect().unwrap();

    // the manual server: answer the handshake, then watch the slow request
    // get cancelled on the wire
    let peer = std::thread::spawn(move || {
        let init = read_raw(&mut peer_read);
        assert_eq!(init["method"], "initialize");
        write_raw(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0", "id": init["id"], "result": {"capabilities": {}}
            })
            .to_string(),
        );
        let initialized = read_raw(&mut peer_read);
        assert_eq!(initialized["method"], "initialized");

        let slow = read_raw(&mut peer_read);
        assert_eq!(slow["method"], "slow");
        let cancel = read_raw(&mut peer_read);
        assert_eq!(cancel["method"], "$/cancelRequest");
        assert_eq!(cancel["params"]["id"], slow["id"]);
        (peer_read, peer_write)
    });

    rt.block_on(async {
        client.initialize(json!({"capabilities": {}})).await.unwrap();

        let token = CancellationToken::new();
        let pending = client
            .client()
            .send_request_("slow", json!({}), Some(token.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = pending.await.unwrap_err();
        assert!(err.is_cancelled(), "unexpected outcome: {err}");
    });

    let _pipes = peer.join().unwrap();
    client.disconnect(false);
}

#[test]
fn cancel_notification_trips_the_inbound_handler() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();
    let (observed_tx, observed_rx) = crossbeam_channel::bounded::<()>(1);

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("slow", HandlerOptions::parallel(), move |_, _, token| {
            let observed_tx = observed_tx.clone();
            async move {
                token.cancelled().await;
                let _ = observed_tx.send(());
                std::future::pending::<()>().await;
                unreachable!()
            }
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","id":5,"method":"slow"}"#);
    write_raw(
        &mut peer_write,
        r#"{"jsonrpc":"2.0","method":"$/cancelRequest","params":{"id":5}}"#,
    );

    observed_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("handler never observed the cancellation");
    let resp = read_raw(&mut peer_read);
    assert_eq!(resp["id"], 5);
    assert_eq!(resp["error"]["code"], -32800);

    server.disconnect(true);
}

#[test]
fn serial_notifications_order_around_parallel_ones() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let builder = server_builder(rt.handle().clone());
    let registry = builder.registry();
    let log = |events: &Arc<Mutex<Vec<&'static str>>>, start: &'static str, end: &'static str, ms: u64| {
        let events = events.clone();
        move |_client, _params| {
            let events = events.clone();
            async move {
                events.lock().push(start);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                events.lock().push(end);
                Ok(())
            }
        }
    };
    registry
        .register_raw_notification("n1", HandlerOptions::serial(), log(&events, "n1.start", "n1.end", 30))
        .unwrap();
    registry
        .register_raw_notification("n2", HandlerOptions::parallel(), log(&events, "n2.start", "n2.end", 50))
        .unwrap();
    registry
        .register_raw_notification("n3", HandlerOptions::serial(), log(&events, "n3.start", "n3.end", 0))
        .unwrap();
    registry
        .register_raw_request("done", HandlerOptions::default(), |_, _, _| async {
            Ok(json!(null))
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);

    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","method":"n1"}"#);
    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","method":"n2"}"#);
    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","method":"n3"}"#);
    write_raw(&mut peer_write, r#"{"jsonrpc":"2.0","id":9,"method":"done"}"#);
    let resp = read_raw(&mut peer_read);
    assert_eq!(resp["id"], 9);

    assert_eq!(
        *events.lock(),
        vec!["n1.start", "n1.end", "n2.start", "n2.end", "n3.start", "n3.end"]
    );

    server.disconnect(true);
}

#[test]
fn disconnect_settles_every_pending_request() {
    let rt = runtime();
    let ((client_read, client_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request("hang", HandlerOptions::default(), |_, _, _| async {
            std::future::pending::<()>().await;
            unreachable!()
        })
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    let mut client = ConnectionBuilder::lsp(rt.handle().clone())
        .flush_timeout(Duration::from_millis(200))
        .scheduler_grace(Duration::from_millis(200))
        .build(client_read, client_write);
    client.connect().unwrap();

    let pending = rt.block_on(async {
        client.initialize(json!({"capabilities": {}})).await.unwrap();
        let pending = client.client().send_request_("hang", json!({}), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending
    });

    client.disconnect(true);
    let err = rt.block_on(pending).unwrap_err();
    assert!(matches!(err, RequestError::Closed), "unexpected outcome: {err}");
    rt.block_on(client.disconnected());

    server.disconnect(true);
}

#[test]
fn dynamic_registrations_reach_the_peer() {
    let rt = runtime();
    let ((mut peer_read, mut peer_write), (server_read, server_write)) = pipe_pair().unwrap();

    let builder = server_builder(rt.handle().clone());
    builder
        .registry()
        .register_raw_request(
            "textDocument/hover",
            HandlerOptions::default()
                .with_register_options(|| json!({"documentSelector": [{"language": "xml"}]})),
            |_, _, _| async { Ok(json!(null)) },
        )
        .unwrap();
    let mut server = builder.build(server_read, server_write);
    server.connect().unwrap();

    handshake(&mut peer_read, &mut peer_write);
    while !server.is_ready() {
        std::thread::sleep(Duration::from_millis(5));
    }

    let pending = server.register_capability();
    let req = read_raw(&mut peer_read);
    assert_eq!(req["method"], "client/registerCapability");
    let registration = &req["params"]["registrations"][0];
    assert_eq!(registration["method"], "textDocument/hover");
    assert_eq!(registration["id"].as_str().unwrap().len(), 36);
    assert!(registration["registerOptions"]["documentSelector"].is_array());

    write_raw(
        &mut peer_write,
        &json!({"jsonrpc": "2.0", "id": req["id"], "result": null}).to_string(),
    );
    rt.block_on(pending).unwrap();

    server.disconnect(true);
}
