//! An in-process server that speaks just enough of the wire protocol for the driver to connect,
//! run commands and read the replies a test scripts for it.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};

use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::conn::wire::{next_request_id, read_frame, Message, OpCode, Query, Reply, ResponseFlags},
    hello::{LEGACY_HELLO_COMMAND_NAME, LEGACY_HELLO_COMMAND_NAME_LOWERCASE},
    options::{ClientOptions, ServerAddress},
};

/// What the server does with a command.
#[derive(Debug)]
pub(crate) enum MockReply {
    /// Send this document back.
    Document(Document),

    /// Read the command but never answer it.
    Hang,

    /// Close the connection without answering.
    Close,
}

impl From<Document> for MockReply {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

type Handler = Box<dyn FnMut(&Document) -> MockReply + Send>;

struct MockState {
    hello: Mutex<Document>,
    handler: Mutex<Handler>,
    received: Mutex<Vec<Document>>,
}

impl MockState {
    fn respond(&self, command: &Document) -> MockReply {
        match bson_util::first_key(command) {
            Some("hello") | Some(LEGACY_HELLO_COMMAND_NAME)
            | Some(LEGACY_HELLO_COMMAND_NAME_LOWERCASE) => {
                return MockReply::Document(self.hello.lock().unwrap().clone())
            }
            _ => {}
        }
        self.received.lock().unwrap().push(command.clone());
        (self.handler.lock().unwrap())(command)
    }
}

/// A wire-protocol server listening on an ephemeral localhost port. Handshakes and heartbeats
/// are answered with the configured hello reply; every other command is recorded and passed to
/// the handler set with [`MockServer::set_handler`], which acknowledges with `{ ok: 1 }` by
/// default.
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Starts a server that presents itself as a mongos recent enough for sessions, retryable
    /// writes and transactions.
    pub(crate) async fn start() -> Self {
        Self::with_hello(mongos_hello()).await
    }

    pub(crate) async fn with_hello(hello: Document) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockState {
            hello: Mutex::new(hello),
            handler: Mutex::new(Box::new(|_| doc! { "ok": 1 }.into())),
            received: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            // Dropping the set when this task is aborted closes every open connection.
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            address: ServerAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: Some(port),
            },
            state,
            accept_task,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Options for a client connected directly to this server. Heartbeats are slowed down so
    /// they do not interleave with the commands under test.
    pub(crate) fn client_options(&self) -> ClientOptions {
        ClientOptions::builder()
            .hosts(vec![self.address.clone()])
            .direct_connection(true)
            .heartbeat_freq(Duration::from_secs(60))
            .server_selection_timeout(Duration::from_secs(5))
            .build()
    }

    /// Replaces the reply to handshakes and heartbeats.
    pub(crate) fn set_hello(&self, hello: Document) {
        *self.state.hello.lock().unwrap() = hello;
    }

    /// Replaces the function that answers non-handshake commands.
    pub(crate) fn set_handler(
        &self,
        handler: impl FnMut(&Document) -> MockReply + Send + 'static,
    ) {
        *self.state.handler.lock().unwrap() = Box::new(handler);
    }

    /// The non-handshake commands received so far whose name is `name`, in arrival order.
    pub(crate) fn received(&self, name: &str) -> Vec<Document> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|command| bson_util::first_key(command) == Some(name))
            .cloned()
            .collect()
    }

    /// The names of every non-handshake command received so far, in arrival order.
    pub(crate) fn received_names(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|command| bson_util::first_key(command).map(str::to_string))
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub(crate) fn mongos_hello() -> Document {
    doc! {
        "ismaster": true,
        "isWritablePrimary": true,
        "helloOk": true,
        "msg": "isdbgrid",
        "minWireVersion": 0,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 100_000,
        "ok": 1,
    }
}

/// A standalone mongod: sessions are supported but writes are never retried.
pub(crate) fn standalone_hello() -> Document {
    let mut hello = mongos_hello();
    hello.remove("msg");
    hello
}

/// A reply to a `find`, `aggregate` or `getMore` carrying `batch`. A `cursor_id` of zero marks
/// the cursor as exhausted.
pub(crate) fn cursor_reply(
    ns: &str,
    cursor_id: i64,
    batch: Vec<Document>,
    first: bool,
) -> Document {
    let batch_key = if first { "firstBatch" } else { "nextBatch" };
    let mut cursor = doc! { "id": cursor_id, "ns": ns };
    cursor.insert(batch_key, batch);
    doc! { "cursor": cursor, "ok": 1 }
}

async fn serve(mut stream: TcpStream, state: Arc<MockState>) {
    loop {
        let Ok((header, body)) = read_frame(&mut stream, None).await else {
            return;
        };
        let (command, op_msg) = match header.op_code {
            OpCode::Message => match Message::parse(&header, &body) {
                Ok(message) => (message.get_command_document(), true),
                Err(_) => return,
            },
            OpCode::Query => match Query::parse(&header, &body) {
                Ok(query) => (query.query, false),
                Err(_) => return,
            },
            _ => return,
        };

        let reply = match state.respond(&command) {
            MockReply::Document(reply) => reply,
            MockReply::Hang => {
                std::future::pending::<()>().await;
                return;
            }
            MockReply::Close => return,
        };

        let written = if op_msg {
            Message::reply_to(header.request_id, reply)
                .write_to(&mut stream, None)
                .await
        } else {
            Reply {
                response_to: header.request_id,
                response_flags: ResponseFlags::empty(),
                cursor_id: 0,
                starting_from: 0,
                docs: vec![reply],
            }
            .write_to(&mut stream, next_request_id())
            .await
        };
        if written.is_err() {
            return;
        }
    }
}
