use std::sync::LazyLock;

use crate::{
    bson::{doc, Document},
    client::auth::Credential,
    cmap::{Connection, StreamDescription},
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
};

const DRIVER_NAME: &str = "mongodb-core";

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the hello or legacy hello command.
static BASE_CLIENT_METADATA: LazyLock<Document> = LazyLock::new(|| {
    doc! {
        "driver": doc! {
            "name": DRIVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": doc! {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": "tokio",
    }
});

/// Options used to build the handshake sent on every new connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct HandshakerOptions {
    /// The application name reported to the server.
    pub(crate) app_name: Option<String>,

    /// The credential connections are authenticated with, if any.
    pub(crate) credential: Option<Credential>,
}

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The client metadata sent with each handshake. This is identical for every connection made
    /// with the same options, so it is built once.
    metadata: Document,

    credential: Option<Credential>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        if let Some(app_name) = options.app_name {
            metadata.insert("application", doc! { "name": app_name });
        }

        Self {
            metadata,
            credential: options.credential,
        }
    }

    fn build_command(&self, authenticate: bool) -> crate::cmap::Command {
        let mut command = hello_command(None);
        command.body.insert("client", self.metadata.clone());

        if let (true, Some(credential)) = (authenticate, self.credential.as_ref()) {
            credential.append_needed_mechanism_negotiation(&mut command.body);
        }

        command
    }

    /// Handshakes a connection, authenticating it afterwards when `authenticate` is set and a
    /// credential was configured. Monitoring connections skip authentication.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        authenticate: bool,
    ) -> Result<HelloReply> {
        let command = self.build_command(authenticate);
        let hello_reply = run_hello(conn, command).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.server_id = hello_reply.command_response.connection_id;

        if let (true, Some(credential)) = (authenticate, self.credential.as_ref()) {
            credential.authenticate_stream(conn).await?;
        }

        Ok(hello_reply)
    }
}
