//! A minimal in-process server speaking enough of the wire protocol to exercise the driver:
//! legacy OP_QUERY handshakes, OP_MSG commands, and scripted replies.

use std::sync::{Arc, Mutex};

use bson::{doc, Document};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    cmap::conn::wire::{Header, Message, MessageFlags, MessageSection, OpCode},
    options::ServerAddress,
    runtime,
};

/// Scripted reply logic: invoked with the received command and the number of commands with the
/// same name received before it, returning the reply body.
pub(crate) type Handler = dyn Fn(&Document, usize) -> Document + Send + Sync;

/// A bound-but-not-yet-serving mock server, so reply scripts can reference its address.
pub(crate) struct MockServerBuilder {
    listener: TcpListener,
    port: u16,
}

impl MockServerBuilder {
    pub(crate) async fn bind() -> MockServerBuilder {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        MockServerBuilder { listener, port }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(self.port),
        }
    }

    /// The hello reply for a one-member replica set whose primary is this server.
    pub(crate) fn primary_hello(&self) -> Document {
        let address = self.address().to_string();
        doc! {
            "ok": 1,
            "ismaster": true,
            "setName": "replset1",
            "setVersion": 1,
            "hosts": [address.clone()],
            "me": address,
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
        }
    }

    /// The hello reply for a standalone server.
    pub(crate) fn standalone_hello(&self) -> Document {
        doc! {
            "ok": 1,
            "ismaster": true,
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 16 * 1024 * 1024,
        }
    }

    pub(crate) fn serve<F>(self, handler: F) -> MockServer
    where
        F: Fn(&Document, usize) -> Document + Send + Sync + 'static,
    {
        let commands: Arc<Mutex<Vec<Document>>> = Arc::new(Mutex::new(Vec::new()));

        let handler: Arc<Handler> = Arc::new(handler);
        let listener = self.listener;
        let log = commands.clone();
        runtime::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(_) => break,
                };
                runtime::spawn(handle_connection(stream, handler.clone(), log.clone()));
            }
        });

        MockServer {
            port: self.port,
            commands,
        }
    }
}

pub(crate) struct MockServer {
    port: u16,
    commands: Arc<Mutex<Vec<Document>>>,
}

impl MockServer {
    pub(crate) fn uri(&self) -> String {
        format!("mongodb://127.0.0.1:{}", self.port)
    }

    /// All commands received so far whose name (first key) matches.
    pub(crate) fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| command_name(doc) == name)
            .cloned()
            .collect()
    }
}

fn command_name(doc: &Document) -> &str {
    doc.keys().next().map(String::as_str).unwrap_or("")
}

pub(crate) fn is_hello(doc: &Document) -> bool {
    matches!(command_name(doc), "isMaster" | "hello" | "ismaster")
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<Document>>>,
) {
    loop {
        let mut header_bytes = [0u8; Header::LENGTH];
        if stream.read_exact(&mut header_bytes).await.is_err() {
            return;
        }
        let header = match Header::from_slice(&header_bytes) {
            Ok(header) => header,
            Err(_) => return,
        };

        let mut body = vec![0u8; header.length as usize - Header::LENGTH];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let (command, legacy) = match header.op_code {
            OpCode::Query => match parse_query_body(&body) {
                Some(command) => (command, true),
                None => return,
            },
            OpCode::Message => {
                let message = match Message::decode(header.clone(), &body) {
                    Ok(message) => message,
                    Err(_) => return,
                };
                match message.single_document_response() {
                    Ok(command) => (command, false),
                    Err(_) => return,
                }
            }
            OpCode::Reply => return,
        };

        let previous_count = {
            let mut log = log.lock().unwrap();
            let count = log
                .iter()
                .filter(|logged| {
                    // Hello variants count together so handshakes and heartbeats share a script
                    // position.
                    if is_hello(&command) {
                        is_hello(logged)
                    } else {
                        command_name(logged) == command_name(&command)
                    }
                })
                .count();
            log.push(command.clone());
            count
        };

        let reply = handler(&command, previous_count);

        let frame = if legacy {
            encode_op_reply(header.request_id, &reply)
        } else {
            let message = Message {
                request_id: 0,
                response_to: header.request_id,
                flags: MessageFlags::empty(),
                sections: vec![MessageSection::Document(reply)],
                checksum: None,
            };
            message.encode().unwrap()
        };

        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// OP_QUERY body: flags, fullCollectionName cstring, numberToSkip, numberToReturn, document.
fn parse_query_body(body: &[u8]) -> Option<Document> {
    let nul = body.iter().skip(4).position(|b| *b == 0)? + 4;
    let doc_start = nul + 1 + 8;
    let mut reader = std::io::Cursor::new(body.get(doc_start..)?);
    Document::from_reader(&mut reader).ok()
}

fn encode_op_reply(response_to: i32, reply: &Document) -> Vec<u8> {
    let mut doc_bytes = Vec::new();
    reply.to_writer(&mut doc_bytes).unwrap();

    let length = Header::LENGTH + 20 + doc_bytes.len();
    let mut frame = Vec::with_capacity(length);
    Header {
        length: length as i32,
        request_id: 0,
        response_to,
        op_code: OpCode::Reply,
    }
    .write_to(&mut frame);
    frame.extend(0i32.to_le_bytes()); // responseFlags
    frame.extend(0i64.to_le_bytes()); // cursorId
    frame.extend(0i32.to_le_bytes()); // startingFrom
    frame.extend(1i32.to_le_bytes()); // numberReturned
    frame.extend(doc_bytes);
    frame
}
