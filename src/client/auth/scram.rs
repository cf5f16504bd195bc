//! SCRAM-SHA-1 and SCRAM-SHA-256 ([RFC 5802](https://tools.ietf.org/html/rfc5802),
//! [RFC 7677](https://tools.ietf.org/html/rfc7677)) carried over `saslStart`/`saslContinue`.

use std::{borrow::Cow, collections::HashMap, sync::LazyLock};

use hmac::{
    digest::{Digest, FixedOutput, KeyInit},
    Hmac,
    Mac,
};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::{
    base64,
    bson::{Bson, Document},
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::{Command, Connection},
    error::{Error, Result},
};

const MECHANISM: &str = "SCRAM";

/// No channel binding, no authorization identity.
const GS2_HEADER: &str = "n,,";

/// Servers asking for fewer PBKDF2 rounds than this are refused.
const MIN_ITERATION_COUNT: u32 = 4096;

/// Salted passwords are expensive to derive, so they are kept for the life of the process.
static SALTED_PASSWORDS: LazyLock<RwLock<HashMap<SaltedPasswordKey, Vec<u8>>>> =
    LazyLock::new(Default::default);

#[derive(Hash, Eq, PartialEq)]
struct SaltedPasswordKey {
    version: ScramVersion,
    password: String,
    salt: Vec<u8>,
    iterations: u32,
}

/// The SCRAM variants, named after the hash function they are built on.
#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    fn mechanism(self) -> AuthMechanism {
        match self {
            Self::Sha1 => AuthMechanism::ScramSha1,
            Self::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    /// Runs a full conversation on `conn`.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        let (username, password) = match (&credential.username, &credential.password) {
            (Some(username), Some(password)) => (username.as_str(), password.as_str()),
            (None, _) => return Err(Error::authentication_error(MECHANISM, "no username supplied")),
            (_, None) => return Err(Error::authentication_error(MECHANISM, "no password supplied")),
        };
        let source = credential.resolved_source();

        let client_first = ClientFirst::new(source, username);
        let reply = conn.send_command(client_first.to_command(self), None).await?;
        let server_first = ServerFirst::parse(reply.auth_response_body(MECHANISM)?)?;
        server_first.validate(&client_first.nonce)?;

        let key = SaltedPasswordKey {
            version: *self,
            password: password.to_string(),
            salt: server_first.salt.clone(),
            iterations: server_first.iterations,
        };
        let cached = SALTED_PASSWORDS.read().await.get(&key).cloned();
        let was_cached = cached.is_some();
        let salted_password = match cached {
            Some(salted_password) => salted_password,
            None => self.compute_salted_password(
                username,
                password,
                server_first.iterations,
                &server_first.salt,
            )?,
        };

        let client_final =
            ClientFinal::new(source, &salted_password, &client_first, &server_first, self)?;
        let reply = conn.send_command(client_final.to_command(), None).await?;
        let server_final = ServerFinal::parse(reply.auth_response_body(MECHANISM)?)?;
        server_final.validate(&salted_password, &client_final, self)?;

        if !server_final.done {
            finish_conversation(conn, source, &server_final.conversation_id).await?;
        }

        if !was_cached {
            SALTED_PASSWORDS
                .write()
                .await
                .entry(key)
                .or_insert(salted_password);
        }
        Ok(())
    }

    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Sha1 => auth::mac::<Hmac<Sha1>>(key, input, MECHANISM)?.as_ref().to_vec(),
            Self::Sha256 => auth::mac::<Hmac<Sha256>>(key, input, MECHANISM)?.as_ref().to_vec(),
        })
    }

    fn verify_hmac(&self, key: &[u8], input: &[u8], expected: &[u8]) -> Result<()> {
        match self {
            Self::Sha1 => verify_mac::<Hmac<Sha1>>(key, input, expected),
            Self::Sha256 => verify_mac::<Hmac<Sha256>>(key, input, expected),
        }
    }

    fn digest(&self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(input).to_vec(),
            Self::Sha256 => Sha256::digest(input).to_vec(),
        }
    }

    /// Derives the salted password. SCRAM-SHA-1 hashes the MD5 digest of
    /// `user:mongo:password`; SCRAM-SHA-256 hashes the SASLprep'd password.
    pub(super) fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        iterations: u32,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        match self {
            Self::Sha1 => {
                let digest = Md5::digest(format!("{username}:mongo:{password}"));
                salt_password::<Hmac<Sha1>>(&hex::encode(digest), salt, iterations, 20)
            }
            Self::Sha256 => {
                let prepared: Cow<'_, str> = stringprep::saslprep(password)
                    .map_err(|_| Error::authentication_error("SCRAM-SHA-256", "saslprep failure"))?;
                salt_password::<Hmac<Sha256>>(&prepared, salt, iterations, 32)
            }
        }
    }
}

/// Servers that ignore `skipEmptyExchange` want one more empty round before they report the
/// conversation done.
async fn finish_conversation(
    conn: &mut Connection,
    source: &str,
    conversation_id: &Bson,
) -> Result<()> {
    let command =
        SaslContinue::new(source.to_string(), conversation_id.clone(), Vec::new()).into_command();
    let reply = conn.send_command(command, None).await?;
    let body = reply.auth_response_body(MECHANISM)?;

    if body.get("conversationId") != Some(conversation_id) {
        return Err(Error::authentication_error(MECHANISM, "mismatched conversationId's"));
    }
    if !matches!(body.get_bool("done"), Ok(true)) {
        return Err(Error::authentication_error(
            MECHANISM,
            "authentication did not complete successfully",
        ));
    }
    Ok(())
}

fn verify_mac<M: Mac + KeyInit>(key: &[u8], input: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::authentication_error(MECHANISM, "invalid key length"))?;
    mac.update(input);
    mac.verify_slice(expected)
        .map_err(|_| Error::authentication_error(MECHANISM, "Authentication failed."))
}

fn salt_password<M: KeyInit + FixedOutput + Mac + Sync + Clone>(
    password: &str,
    salt: &[u8],
    iterations: u32,
    len: usize,
) -> Result<Vec<u8>> {
    let mut output = vec![0u8; len];
    pbkdf2::pbkdf2::<M>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| Error::authentication_error(MECHANISM, "invalid salted password length"))?;
    Ok(output)
}

/// Reads `key=value` from one comma-separated field of a server message.
fn attribute(field: Option<&str>, key: char) -> Result<&str> {
    field
        .and_then(|field| field.strip_prefix(key))
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| Error::invalid_authentication_response(MECHANISM))
}

fn payload_text(payload: Vec<u8>) -> Result<String> {
    String::from_utf8(payload).map_err(|_| Error::invalid_authentication_response(MECHANISM))
}

/// `client-first-message`.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,
    bare: String,
    nonce: String,
}

impl ClientFirst {
    fn new(source: &str, username: &str) -> Self {
        Self::with_nonce(source, username, auth::generate_nonce())
    }

    pub(super) fn with_nonce(source: &str, username: &str, nonce: String) -> Self {
        // '=' and ',' are structural in the attribute list.
        let username = username.replace('=', "=3D").replace(',', "=2C");
        Self {
            source: source.to_string(),
            bare: format!("n={username},r={nonce}"),
            nonce,
        }
    }

    pub(super) fn to_command(&self, scram: &ScramVersion) -> Command {
        let payload = format!("{GS2_HEADER}{}", self.bare).into_bytes();
        SaslStart::new(self.source.clone(), scram.mechanism(), payload).into_command()
    }
}

/// `server-first-message`. Must be validated before anything is derived from it.
pub(super) struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    pub(super) fn parse(response: &Document) -> Result<Self> {
        let SaslResponse {
            conversation_id,
            payload,
            done,
        } = SaslResponse::parse(MECHANISM, response)?;
        let message = payload_text(payload)?;

        let mut fields = message.split(',');
        let nonce = attribute(fields.next(), 'r')?.to_string();
        let salt = base64::decode(attribute(fields.next(), 's')?)
            .map_err(|_| Error::invalid_authentication_response(MECHANISM))?;
        let iterations = attribute(fields.next(), 'i')?
            .parse()
            .map_err(|_| Error::authentication_error(MECHANISM, "iteration count invalid"))?;

        Ok(Self {
            conversation_id,
            done,
            message,
            nonce,
            salt,
            iterations,
        })
    }

    /// The server nonce must extend ours, and the conversation must not be over yet.
    pub(super) fn validate(&self, client_nonce: &str) -> Result<()> {
        let reason = if self.done {
            "handshake terminated early"
        } else if !self.nonce.starts_with(client_nonce) {
            "mismatched nonce"
        } else if self.iterations < MIN_ITERATION_COUNT {
            "iteration count too low"
        } else {
            return Ok(());
        };
        Err(Error::authentication_error(MECHANISM, reason))
    }
}

/// `client-final-message`, along with the `AuthMessage` both signatures are computed over.
pub(super) struct ClientFinal {
    source: String,
    conversation_id: Bson,
    message: String,
    auth_message: String,
}

impl ClientFinal {
    pub(super) fn new(
        source: &str,
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let without_proof = format!(
            "c={},r={}",
            base64::encode(GS2_HEADER),
            server_first.nonce
        );
        let auth_message = format!(
            "{},{},{without_proof}",
            client_first.bare, server_first.message
        );

        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.digest(&client_key);
        let signature = scram.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&signature)
            .map(|(key, sig)| key ^ sig)
            .collect();

        Ok(Self {
            source: source.to_string(),
            conversation_id: server_first.conversation_id.clone(),
            message: format!("{without_proof},p={}", base64::encode(proof)),
            auth_message,
        })
    }

    pub(super) fn to_command(&self) -> Command {
        SaslContinue::new(
            self.source.clone(),
            self.conversation_id.clone(),
            self.message.as_bytes().to_vec(),
        )
        .into_command()
    }
}

/// `server-final-message`: either the server's signature or an error.
pub(super) struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    outcome: ServerOutcome,
}

enum ServerOutcome {
    Verifier(String),
    Error(String),
}

impl ServerFinal {
    pub(super) fn parse(response: &Document) -> Result<Self> {
        let SaslResponse {
            conversation_id,
            payload,
            done,
        } = SaslResponse::parse(MECHANISM, response)?;
        let message = payload_text(payload)?;

        let outcome = match message.split_once('=') {
            Some(("v", verifier)) => ServerOutcome::Verifier(verifier.to_string()),
            Some(("e", error)) => ServerOutcome::Error(error.to_string()),
            _ => return Err(Error::invalid_authentication_response(MECHANISM)),
        };
        Ok(Self {
            conversation_id,
            done,
            outcome,
        })
    }

    /// Checks the server's signature, which proves it also knows the salted password.
    pub(super) fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        if self.conversation_id != client_final.conversation_id {
            return Err(Error::authentication_error(MECHANISM, "mismatched conversationId's"));
        }

        match &self.outcome {
            ServerOutcome::Error(error) => Err(Error::authentication_error(MECHANISM, error)),
            ServerOutcome::Verifier(verifier) => {
                let signature = base64::decode(verifier)
                    .map_err(|_| Error::invalid_authentication_response(MECHANISM))?;
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                scram.verify_hmac(&server_key, client_final.auth_message.as_bytes(), &signature)
            }
        }
    }
}
