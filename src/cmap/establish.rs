pub(crate) mod handshake;

use std::time::Duration;

use derive_where::derive_where;

use self::handshake::{Handshaker, HandshakerOptions};
use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    Connection,
};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    error::{Error, Result},
    hello::HelloReply,
    runtime::{self, stream, AsyncStream, TlsConfig},
    sdam::HandshakePhase,
};

/// Opens connections for pools and monitors: TCP, then TLS, then the handshake.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,

    /// Built once, since loading roots and certificates is not free.
    #[derive_where(skip)]
    tls_config: Option<TlsConfig>,

    connect_timeout: Duration,
}

impl ConnectionEstablisher {
    /// Fails when the TLS options cannot be loaded.
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let tls_config = match &options.tls {
            Some(tls) => Some(TlsConfig::new(tls.clone())?),
            None => None,
        };
        Ok(Self {
            handshaker: Handshaker::new(HandshakerOptions {
                app_name: options.app_name.clone(),
                credential: options.credential.clone(),
            }),
            tls_config,
            connect_timeout: stream::connect_timeout(options.connect_timeout),
        })
    }

    async fn connect(&self, address: &ServerAddress) -> Result<AsyncStream> {
        let connecting = AsyncStream::connect(address, self.tls_config.as_ref());
        runtime::timeout(self.connect_timeout, connecting).await?
    }

    /// A connection for a pool, handshaken and authenticated. Failures say how far the handshake
    /// got, which decides whether the pool gets cleared.
    pub(crate) async fn establish_connection(
        &self,
        pending: PendingConnection,
    ) -> std::result::Result<PooledConnection, EstablishError> {
        let generation = pending.generation;
        let address = pending.address.clone();
        let stream = self
            .connect(&address)
            .await
            .map_err(|cause| EstablishError::new(cause, HandshakePhase::PreHello { generation }))?;

        let mut connection = PooledConnection::new(pending, stream);
        if let Err(cause) = self.handshaker.handshake(&mut connection, true).await {
            let phase = if connection.stream_description().is_ok() {
                HandshakePhase::PostHello { generation }
            } else {
                HandshakePhase::PreHello { generation }
            };
            return Err(EstablishError::new(cause, phase));
        }
        Ok(connection)
    }

    /// A monitor's connection, which never authenticates. Returns the handshake's `hello` reply
    /// as the monitor's first check.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.connect(&address).await?;
        let mut connection = Connection::new_monitoring(address, stream, id);
        let reply = self.handshaker.handshake(&mut connection, false).await?;
        Ok((connection, reply))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn new(cause: Error, handshake_phase: HandshakePhase) -> Self {
        Self {
            cause,
            handshake_phase,
        }
    }
}
