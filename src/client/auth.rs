//! Credentials and the SCRAM mechanisms used to authenticate new connections.

mod sasl;
mod scram;

use std::{fmt, str::FromStr};

use hmac::{digest::KeyInit, Mac};
use rand::Rng;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    base64,
    bson::Document,
    cmap::{Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

const DEFAULT_SOURCE: &str = "admin";

/// A supported authentication mechanism.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// SCRAM-SHA-1, as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ScramSha1,

    /// SCRAM-SHA-256, as defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ScramSha256,
}

impl AuthMechanism {
    /// The mechanism to use when the credential names none: SCRAM-SHA-256 if the handshake
    /// reply lists it among `saslSupportedMechs`, SCRAM-SHA-1 otherwise.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let offers_sha256 = description
            .sasl_supported_mechs
            .iter()
            .flatten()
            .any(|name| name == Self::ScramSha256.as_str());
        if offers_sha256 {
            Self::ScramSha256
        } else {
            Self::ScramSha1
        }
    }

    /// Checks that `credential` carries what this mechanism needs.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        let missing = match (&credential.username, &credential.password) {
            (None, _) => "username",
            (_, None) => "password",
            _ => return Ok(()),
        };
        Err(ErrorKind::InvalidArgument {
            message: format!("No {missing} provided for {} authentication", self.as_str()),
        }
        .into())
    }

    /// The name used for this mechanism on the wire and in connection strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScramSha1 => "SCRAM-SHA-1",
            Self::ScramSha256 => "SCRAM-SHA-256",
        }
    }

    fn scram_version(&self) -> ScramVersion {
        match self {
            Self::ScramSha1 => ScramVersion::Sha1,
            Self::ScramSha256 => ScramVersion::Sha256,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        [Self::ScramSha1, Self::ScramSha256]
            .into_iter()
            .find(|mechanism| mechanism.as_str() == name)
            .ok_or_else(|| {
                ErrorKind::InvalidArgument {
                    message: format!("invalid or unsupported mechanism string: {name}"),
                }
                .into()
            })
    }
}

/// Authentication settings for a [`Client`](crate::Client).
///
/// Without a mechanism, one is negotiated during the connection handshake. The source database
/// defaults to `"admin"`.
#[derive(Clone, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The user to authenticate as.
    pub username: Option<String>,

    /// The database the user is defined in.
    pub source: Option<String>,

    /// The user's password.
    pub password: Option<String>,

    /// The mechanism to authenticate with.
    pub mechanism: Option<AuthMechanism>,
}

impl Credential {
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or(DEFAULT_SOURCE)
    }

    /// Asks the server, through the handshake, which mechanisms the user supports. Only needed
    /// when no mechanism was configured.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if self.mechanism.is_some() {
            return;
        }
        if let Some(username) = &self.username {
            let user = format!("{}.{username}", self.resolved_source());
            command.insert("saslSupportedMechs", user);
        }
    }

    /// Authenticates a freshly handshaken connection.
    pub(crate) async fn authenticate_stream(&self, conn: &mut Connection) -> Result<()> {
        let description = conn.stream_description()?;

        // Arbiters hold no user data and cannot authenticate.
        if !description.initial_server_type.can_auth() {
            return Ok(());
        }

        let mechanism = self
            .mechanism
            .clone()
            .unwrap_or_else(|| AuthMechanism::from_stream_description(description));
        mechanism.validate_credential(self)?;
        mechanism
            .scram_version()
            .authenticate_stream(conn, self)
            .await
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(REDACTED)")
    }
}

/// A random base64 nonce for the client's first message.
pub(crate) fn generate_nonce() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    base64::encode(bytes)
}

fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8], mechanism: &str) -> Result<impl AsRef<[u8]>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::authentication_error(mechanism, "invalid key length"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes())
}
