mod mock_server;

use std::time::Duration;

use bson::{doc, Document};

use self::mock_server::{is_hello, MockServer, MockServerBuilder};
use crate::{
    cmap::conn::{Connection, ConnectionOptions},
    error::ErrorKind,
    options::{ChangeStreamOptions, ClientOptions},
    Client,
};

fn cursor_reply(ns: &str, id: i64, first: bool, batch: Vec<Document>) -> Document {
    let batch_key = if first { "firstBatch" } else { "nextBatch" };
    doc! {
        "ok": 1,
        "cursor": {
            "id": id,
            "ns": ns,
            batch_key: batch,
        }
    }
}

fn client_for(server: &MockServer) -> Client {
    let mut options = ClientOptions::parse(server.uri()).unwrap();
    options.server_selection_timeout = Some(Duration::from_secs(10));
    Client::with_options(options).unwrap()
}

#[tokio::test]
async fn handshake_carries_client_metadata() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.standalone_hello();
    let server = builder.serve(move |command, _| {
        if is_hello(command) {
            hello.clone()
        } else {
            doc! { "ok": 1 }
        }
    });

    let mut options = ClientOptions::parse(server.uri()).unwrap();
    options.app_name = Some("mockTest".to_string());
    options.server_selection_timeout = Some(Duration::from_secs(10));
    let client = Client::with_options(options).unwrap();

    client.run_command("admin", doc! { "ping": 1 }).await.unwrap();

    let hellos = server.commands_named("isMaster");
    assert!(!hellos.is_empty());
    let metadata = hellos[0].get_document("client").unwrap();
    assert_eq!(
        metadata.get_document("application").unwrap().get_str("name"),
        Ok("mockTest")
    );
    assert_eq!(
        metadata.get_document("driver").unwrap().get_str("name"),
        Ok("mongocore")
    );
    assert!(metadata.get_document("os").unwrap().get_str("type").is_ok());

    // The ping was sent with an implicitly acquired session.
    let pings = server.commands_named("ping");
    assert_eq!(pings.len(), 1);
    assert!(pings[0].get_document("lsid").is_ok());
    assert_eq!(pings[0].get_str("$db"), Ok("admin"));
}

#[tokio::test]
async fn retryable_write_replays_same_txn_number() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.primary_hello();
    let server = builder.serve(move |command, previous_count| {
        if is_hello(command) {
            hello.clone()
        } else if command.contains_key("insert") {
            if previous_count == 0 {
                doc! {
                    "ok": 0,
                    "code": 189,
                    "codeName": "PrimaryStepDown",
                    "errmsg": "stepping down",
                    "errorLabels": ["RetryableWriteError"],
                }
            } else {
                doc! { "ok": 1, "n": 1 }
            }
        } else {
            doc! { "ok": 1 }
        }
    });

    let client = client_for(&server);
    let result = client
        .insert("app.users", vec![doc! { "name": "jane" }])
        .await
        .unwrap();
    assert_eq!(result.inserted_count, 1);

    let inserts = server.commands_named("insert");
    assert_eq!(inserts.len(), 2, "expected exactly one retry");

    // The replay reuses the session and transaction number so the server can deduplicate.
    assert_eq!(
        inserts[0].get_document("lsid").unwrap(),
        inserts[1].get_document("lsid").unwrap()
    );
    assert_eq!(inserts[0].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(
        inserts[0].get_i64("txnNumber").unwrap(),
        inserts[1].get_i64("txnNumber").unwrap()
    );
}

#[tokio::test]
async fn retryable_read_is_replayed_once() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.standalone_hello();
    let server = builder.serve(move |command, previous_count| {
        if is_hello(command) {
            hello.clone()
        } else if command.contains_key("find") {
            if previous_count == 0 {
                doc! {
                    "ok": 0,
                    "code": 11600,
                    "codeName": "InterruptedAtShutdown",
                    "errmsg": "shutting down",
                }
            } else {
                cursor_reply("app.users", 0, true, vec![doc! { "name": "jane" }])
            }
        } else {
            doc! { "ok": 1 }
        }
    });

    let client = client_for(&server);
    let mut cursor = client.find("app.users", doc! {}).await.unwrap();
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_str("name"), Ok("jane"));
    assert!(cursor.next().await.unwrap().is_none());

    assert_eq!(server.commands_named("find").len(), 2);
}

#[tokio::test]
async fn cursor_iterates_batches_against_originating_server() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.standalone_hello();
    let server = builder.serve(move |command, _| {
        if is_hello(command) {
            hello.clone()
        } else if command.contains_key("find") {
            cursor_reply("app.items", 42, true, vec![doc! { "x": 1 }])
        } else if command.contains_key("getMore") {
            cursor_reply("app.items", 0, false, vec![doc! { "x": 2 }])
        } else {
            doc! { "ok": 1 }
        }
    });

    let client = client_for(&server);
    let cursor = client.find("app.items", doc! {}).await.unwrap();
    let all = cursor.collect().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].get_i32("x"), Ok(1));
    assert_eq!(all[1].get_i32("x"), Ok(2));

    let get_mores = server.commands_named("getMore");
    assert_eq!(get_mores.len(), 1);
    assert_eq!(get_mores[0].get_i64("getMore"), Ok(42));
    assert_eq!(get_mores[0].get_str("collection"), Ok("items"));
}

#[tokio::test]
async fn change_stream_resumes_after_resumable_error() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.standalone_hello();
    let server = builder.serve(move |command, previous_count| {
        if is_hello(command) {
            hello.clone()
        } else if command.contains_key("aggregate") {
            if previous_count == 0 {
                doc! {
                    "ok": 1,
                    "cursor": {
                        "id": 7i64,
                        "ns": "app.events",
                        "firstBatch": [],
                        "postBatchResumeToken": { "_data": "t1" },
                    }
                }
            } else {
                doc! {
                    "ok": 1,
                    "cursor": {
                        "id": 8i64,
                        "ns": "app.events",
                        "firstBatch": [
                            { "_id": { "_data": "t2" }, "operationType": "insert" }
                        ],
                    }
                }
            }
        } else if command.contains_key("getMore") {
            doc! { "ok": 0, "code": 234, "codeName": "RetryChangeStream", "errmsg": "retry" }
        } else {
            doc! { "ok": 1 }
        }
    });

    let client = client_for(&server);
    let mut stream = client
        .watch("app.events", Vec::new(), ChangeStreamOptions::default())
        .await
        .unwrap();

    // The empty initial batch's post-batch resume token advances the stream's position before
    // any event is seen.
    assert_eq!(
        stream.resume_token().unwrap().as_document(),
        &doc! { "_data": "t1" }
    );

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.get_str("operationType"), Ok("insert"));
    assert_eq!(
        stream.resume_token().unwrap().as_document(),
        &doc! { "_data": "t2" }
    );

    // The resumed aggregate carried the token from before the failure.
    let aggregates = server.commands_named("aggregate");
    assert_eq!(aggregates.len(), 2);
    let first_stage = aggregates[1].get_array("pipeline").unwrap()[0]
        .as_document()
        .unwrap();
    assert_eq!(
        first_stage
            .get_document("$changeStream")
            .unwrap()
            .get_document("resumeAfter"),
        Ok(&doc! { "_data": "t1" })
    );
}

#[tokio::test]
async fn connection_is_dead_after_io_error() {
    // A listener that accepts and immediately closes every connection.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = crate::options::ServerAddress::Tcp {
        host: "127.0.0.1".to_string(),
        port: Some(listener.local_addr().unwrap().port()),
    };
    crate::runtime::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let mut conn = Connection::connect(1, address, 0, &ConnectionOptions::default())
        .await
        .unwrap();

    let first = conn.ping().await.unwrap_err();
    assert!(first.is_network_error());

    let second = conn.ping().await.unwrap_err();
    assert!(matches!(*second.kind, ErrorKind::Disconnected { .. }));
}

#[tokio::test]
async fn operations_after_shutdown_fail() {
    let builder = MockServerBuilder::bind().await;
    let hello = builder.standalone_hello();
    let server = builder.serve(move |command, _| {
        if is_hello(command) {
            hello.clone()
        } else {
            doc! { "ok": 1 }
        }
    });

    let client = client_for(&server);
    client.run_command("admin", doc! { "ping": 1 }).await.unwrap();
    client.shutdown().await;

    let error = client
        .run_command("admin", doc! { "ping": 1 })
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown));
}
