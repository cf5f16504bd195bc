//! Client configuration: the options struct, connection string parsing, and the server address
//! type shared by the whole crate.

#[cfg(test)]
mod test;

use std::{
    fmt,
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

pub use crate::client::auth::{AuthMechanism, Credential};
use crate::{
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    error::{Error, Result},
    event::{cmap::CmapEventHandler, command::CommandEventHandler, sdam::SdamEventHandler},
    sdam::{verify_max_staleness, DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// Characters that must be percent-encoded in a connection string's username and password.
const USERINFO_RESERVED: &[char] = &[':', '/', '?', '#', '[', ']', '@'];

const DATABASE_NAME_FORBIDDEN: &[char] = &['/', '\\', ' ', '"', '$', '.'];

/// Where a server listens.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A hostname or IP address, with an optional port.
    Tcp {
        /// Lowercased when parsed from a string.
        host: String,

        /// `None` means 27017. Addresses that differ only in an explicit 27017 compare equal.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        (self.host(), self.port()) == (other.host(), other.port())
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.host(), self.port()).hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl ServerAddress {
    /// Parses `host`, `host:port` or `[ipv6]:port`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let invalid = |reason: &str| {
            Error::invalid_argument(format!("invalid server address {address:?}: {reason}"))
        };

        let (host, port) = match address.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
                let port = match after {
                    "" => None,
                    after => Some(
                        after
                            .strip_prefix(':')
                            .ok_or_else(|| invalid("expected ':' after IPv6 literal"))?,
                    ),
                };
                (host, port)
            }
            None => match address.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(invalid("IPv6 addresses must be enclosed in brackets"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            },
        };

        if host.is_empty() {
            return Err(invalid("hostname cannot be empty"));
        }
        let port = port
            .map(|port| match u16::from_str(port) {
                Ok(port) if port > 0 => Ok(port),
                _ => Err(invalid("port must be an integer between 1 and 65535")),
            })
            .transpose()?;

        Ok(Self::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host,
        }
    }

    /// The port, 27017 when none was given.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (host, port) = (self.host(), self.port());
        if host.contains(':') {
            write!(f, "[{host}]:{port}")
        } else {
            write!(f, "{host}:{port}")
        }
    }
}

/// TLS settings. Present in [`ClientOptions::tls`] only when TLS is on.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Accept any certificate and hostname. Only for testing.
    pub allow_invalid_certificates: Option<bool>,

    /// PEM file of trusted CA certificates. Without one, the `webpki-roots` set is trusted.
    pub ca_file_path: Option<PathBuf>,
}

/// Settings for a [`Client`](crate::Client). Build one with [`ClientOptions::builder`] or parse
/// a connection string with [`ClientOptions::parse`].
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// Seed list. Other members are discovered from the seeds' `hello` replies unless
    /// `direct_connection` is set.
    #[builder(default = vec![ServerAddress::default()], setter(!into))]
    pub hosts: Vec<ServerAddress>,

    /// Reported to the server in the handshake and shown in its logs.
    pub app_name: Option<String>,

    /// Receives connection pool events.
    #[derive_where(skip)]
    pub cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// Receives command started, succeeded and failed events.
    #[derive_where(skip)]
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,

    /// Receives topology and heartbeat events.
    #[derive_where(skip)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// Limit on opening a TCP connection. Defaults to 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// Authenticates every pooled connection.
    pub credential: Option<Credential>,

    /// Talk to the single seed only, whatever kind of server it is.
    pub direct_connection: Option<bool>,

    /// Time between monitor checks of each server. Defaults to 10 seconds, and may not go below
    /// 500 milliseconds.
    pub heartbeat_freq: Option<Duration>,

    /// Width of the latency window. Servers whose average round trip time exceeds the fastest
    /// suitable server's by more than this are not selected. Defaults to 15 milliseconds.
    pub local_threshold: Option<Duration>,

    /// Pooled connections left unused this long are closed. Unlimited by default.
    pub max_idle_time: Option<Duration>,

    /// Cap on each pool's connections, checked out or idle. Zero means no cap. Defaults to 10.
    pub max_pool_size: Option<u32>,

    /// Connections each pool keeps open in the background. Defaults to 0.
    pub min_pool_size: Option<u32>,

    /// Cap on connections a pool establishes at once. Defaults to 2.
    pub max_connecting: Option<u32>,

    /// Default read concern for the databases and collections of the client.
    pub read_concern: Option<ReadConcern>,

    /// Expected replica set name. Members reporting another name are removed.
    pub repl_set_name: Option<String>,

    /// Retry reads once after a retryable error. Defaults to true.
    pub retry_reads: Option<bool>,

    /// Retry writes once after a retryable error. Defaults to true.
    pub retry_writes: Option<bool>,

    /// Default read preference, or a custom server filter.
    pub selection_criteria: Option<SelectionCriteria>,

    /// How long an operation waits for a suitable server. Defaults to 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// How long a command may wait on the network once written. The connection is closed on
    /// expiry. Unlimited by default.
    pub socket_timeout: Option<Duration>,

    /// Enables TLS.
    pub tls: Option<TlsOptions>,

    /// How long a checkout waits for a connection when the pool is at `max_pool_size`.
    /// Unlimited by default.
    pub wait_queue_timeout: Option<Duration>,

    /// Default write concern for the databases and collections of the client.
    pub write_concern: Option<WriteConcern>,

    /// The database in the connection string path.
    pub default_database: Option<String>,

    /// Documents rendered into tracing events are cut to this many bytes. Defaults to 1000.
    pub tracing_max_document_length_bytes: Option<usize>,
}

impl ClientOptions {
    /// Parses a `mongodb://[user[:password]@]host[:port][,...][/[database]][?options]` string.
    ///
    /// Option names are case-insensitive. Recognized options:
    ///
    /// | option | sets |
    /// |---|---|
    /// | `appName` | `app_name` |
    /// | `authMechanism`, `authSource` | `credential` |
    /// | `connectTimeoutMS`, `socketTimeoutMS` | `connect_timeout`, `socket_timeout` |
    /// | `directConnection` | `direct_connection` |
    /// | `heartbeatFrequencyMS` | `heartbeat_freq` |
    /// | `localThresholdMS`, `serverSelectionTimeoutMS` | server selection |
    /// | `maxPoolSize`, `minPoolSize`, `maxConnecting` | pool sizes |
    /// | `maxIdleTimeMS`, `waitQueueTimeoutMS` | pool timeouts |
    /// | `readConcernLevel` | `read_concern` |
    /// | `readPreference`, `readPreferenceTags`, `maxStalenessSeconds` | `selection_criteria` |
    /// | `replicaSet` | `repl_set_name` |
    /// | `retryReads`, `retryWrites` | retries |
    /// | `tls` (or `ssl`), `tlsCAFile`, `tlsAllowInvalidCertificates`, `tlsInsecure` | `tls` |
    /// | `w`, `journal`, `wTimeoutMS` | `write_concern` |
    ///
    /// Unrecognized options are logged and skipped.
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let options = ConnectionString::parse(uri.as_ref())?.into_options()?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects inconsistent combinations. Runs again when a client is built from these options.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.hosts.len() {
            0 => return Err(Error::invalid_argument("at least one host must be specified")),
            1 => {}
            _ if self.direct_connection == Some(true) => {
                return Err(Error::invalid_argument(
                    "directConnection=true allows only one seed",
                ))
            }
            _ => {}
        }

        let heartbeat_freq = self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
        if heartbeat_freq < MIN_HEARTBEAT_FREQUENCY {
            return Err(Error::invalid_argument(format!(
                "heartbeat frequency of {heartbeat_freq:?} is below the minimum of \
                 {MIN_HEARTBEAT_FREQUENCY:?}"
            )));
        }

        if let Some(max_staleness) = self
            .selection_criteria
            .as_ref()
            .and_then(SelectionCriteria::as_read_pref)
            .and_then(ReadPreference::max_staleness)
        {
            verify_max_staleness(max_staleness, heartbeat_freq)?;
        }

        match (self.min_pool_size, self.max_pool_size, self.max_connecting) {
            (_, _, Some(0)) => {
                return Err(Error::invalid_argument("max connecting must be positive"))
            }
            (Some(min), Some(max), _) if max != 0 && min > max => {
                return Err(Error::invalid_argument(format!(
                    "min pool size ({min}) cannot exceed max pool size ({max})"
                )))
            }
            _ => {}
        }

        if let Some(write_concern) = &self.write_concern {
            write_concern.validate()?;
        }
        if let Some(credential) = &self.credential {
            if let Some(mechanism) = &credential.mechanism {
                mechanism.validate_credential(credential)?;
            }
        }
        Ok(())
    }
}

/// What a connection string said, before options that only make sense together are combined.
#[derive(Debug, Default)]
struct ConnectionString {
    options: ClientOptions,

    read_preference: Option<String>,
    read_preference_tags: Option<Vec<TagSet>>,
    max_staleness: Option<Duration>,

    tls: Option<bool>,
    ssl: Option<bool>,
    tls_insecure: Option<bool>,
    tls_allow_invalid_certificates: Option<bool>,
    tls_ca_file: Option<PathBuf>,

    username: Option<String>,
    password: Option<String>,
    auth_source: Option<String>,
    auth_mechanism: Option<AuthMechanism>,
}

fn decode(part: &str, what: &str) -> Result<String> {
    percent_encoding::percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::invalid_argument(format!("{what} is not valid percent-encoded UTF-8")))
}

fn decode_userinfo(part: &str, what: &str) -> Result<String> {
    if part.contains(USERINFO_RESERVED) {
        return Err(Error::invalid_argument(format!("{what} must be percent-encoded")));
    }
    let is_escape = |rest: &str| {
        rest.get(..2)
            .is_some_and(|hex| hex.chars().all(|c| c.is_ascii_hexdigit()))
    };
    let stray_percent = part.split('%').skip(1).any(|rest| !is_escape(rest));
    if stray_percent {
        return Err(Error::invalid_argument(format!("{what} contains an unescaped '%'")));
    }
    decode(part, what)
}

fn flag(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "connection string option {name} must be true or false, got {value:?}"
        ))),
    }
}

fn count(name: &str, value: &str) -> Result<u32> {
    u32::from_str(value).map_err(|_| {
        Error::invalid_argument(format!(
            "connection string option {name} must be a non-negative integer, got {value:?}"
        ))
    })
}

fn millis(name: &str, value: &str) -> Result<Duration> {
    u64::from_str(value).map(Duration::from_millis).map_err(|_| {
        Error::invalid_argument(format!(
            "connection string option {name} must be a non-negative number of milliseconds, got \
             {value:?}"
        ))
    })
}

fn tag_set(value: &str) -> Result<TagSet> {
    value
        .split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((name, tag)) if !tag.contains(':') => Ok((name.to_owned(), tag.to_owned())),
            _ => Err(Error::invalid_argument(format!(
                "read preference tag {pair:?} is not of the form name:value"
            ))),
        })
        .collect()
}

impl ConnectionString {
    fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::invalid_argument("connection string has no scheme"))?;
        if scheme != "mongodb" {
            return Err(Error::invalid_argument(format!(
                "unsupported connection string scheme {scheme:?}"
            )));
        }

        let (authority, path) = match rest.split_once('/') {
            Some(split) => split,
            None if rest.contains('?') => {
                return Err(Error::invalid_argument(
                    "connection string options must follow a '/' after the hosts",
                ))
            }
            None => (rest, ""),
        };
        let (database, query) = path.split_once('?').unwrap_or((path, ""));
        let (userinfo, hosts) = match authority.rsplit_once('@') {
            Some((userinfo, hosts)) => (Some(userinfo), hosts),
            None => (None, authority),
        };
        if hosts.is_empty() {
            return Err(Error::invalid_argument("connection string names no hosts"));
        }

        let mut parsed = Self::default();
        parsed.options.hosts = hosts
            .split(',')
            .map(ServerAddress::parse)
            .collect::<Result<_>>()?;

        if !database.is_empty() {
            let database = decode(database, "database name")?;
            if database.contains(DATABASE_NAME_FORBIDDEN) {
                return Err(Error::invalid_argument(format!(
                    "database name {database:?} contains a forbidden character"
                )));
            }
            parsed.options.default_database = Some(database);
        }

        if let Some(userinfo) = userinfo {
            let (username, password) = match userinfo.split_once(':') {
                Some((username, password)) => (username, Some(password)),
                None => (userinfo, None),
            };
            if username.is_empty() {
                return Err(Error::invalid_argument("connection string has an empty username"));
            }
            parsed.username = Some(decode_userinfo(username, "username")?);
            parsed.password = password
                .map(|password| decode_userinfo(password, "password"))
                .transpose()?;
        }

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                Error::invalid_argument(format!("connection string option {pair:?} has no value"))
            })?;
            let value = decode(value, name)?;
            parsed.set(name, &value)?;
        }

        Ok(parsed)
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let options = &mut self.options;
        match name.to_ascii_lowercase().as_str() {
            "appname" => options.app_name = Some(value.to_owned()),
            "authmechanism" => self.auth_mechanism = Some(value.parse()?),
            "authsource" => self.auth_source = Some(value.to_owned()),
            "connecttimeoutms" => options.connect_timeout = Some(millis(name, value)?),
            "directconnection" => options.direct_connection = Some(flag(name, value)?),
            "heartbeatfrequencyms" => options.heartbeat_freq = Some(millis(name, value)?),
            "localthresholdms" => options.local_threshold = Some(millis(name, value)?),
            "maxconnecting" => options.max_connecting = Some(count(name, value)?),
            "maxidletimems" => options.max_idle_time = Some(millis(name, value)?),
            "maxpoolsize" => options.max_pool_size = Some(count(name, value)?),
            "minpoolsize" => options.min_pool_size = Some(count(name, value)?),
            "readconcernlevel" => options.read_concern = Some(ReadConcern::custom(value)),
            "replicaset" => options.repl_set_name = Some(value.to_owned()),
            "retryreads" => options.retry_reads = Some(flag(name, value)?),
            "retrywrites" => options.retry_writes = Some(flag(name, value)?),
            "serverselectiontimeoutms" => {
                options.server_selection_timeout = Some(millis(name, value)?)
            }
            "sockettimeoutms" => options.socket_timeout = Some(millis(name, value)?),
            "waitqueuetimeoutms" => options.wait_queue_timeout = Some(millis(name, value)?),

            "journal" => self.write_concern().journal = Some(flag(name, value)?),
            "wtimeoutms" => self.write_concern().w_timeout = Some(millis(name, value)?),
            "w" => {
                let w = match i64::from_str(value) {
                    Ok(nodes) => u32::try_from(nodes).map(Acknowledgment::Nodes).map_err(|_| {
                        Error::invalid_argument("connection string option w cannot be negative")
                    })?,
                    Err(_) => Acknowledgment::from(value),
                };
                self.write_concern().w = Some(w);
            }

            "readpreference" => self.read_preference = Some(value.to_owned()),
            "readpreferencetags" => self
                .read_preference_tags
                .get_or_insert_with(Vec::new)
                .push(tag_set(value)?),
            "maxstalenessseconds" => {
                self.max_staleness = match i64::from_str(value) {
                    Ok(-1) => None,
                    Ok(seconds) if seconds >= 0 => {
                        Some(Duration::from_secs(seconds.unsigned_abs()))
                    }
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "{value:?} is not a valid maxStalenessSeconds"
                        )))
                    }
                }
            }

            "tls" => self.tls = Some(flag(name, value)?),
            "ssl" => self.ssl = Some(flag(name, value)?),
            "tlsinsecure" => self.tls_insecure = Some(flag(name, value)?),
            "tlsallowinvalidcertificates" => {
                self.tls_allow_invalid_certificates = Some(flag(name, value)?)
            }
            "tlscafile" => self.tls_ca_file = Some(PathBuf::from(value)),

            _ => tracing::warn!(option = name, "ignoring unrecognized connection string option"),
        }
        Ok(())
    }

    fn write_concern(&mut self) -> &mut WriteConcern {
        self.options.write_concern.get_or_insert_with(Default::default)
    }

    fn into_options(mut self) -> Result<ClientOptions> {
        self.options.selection_criteria = self.read_preference()?;
        self.options.tls = self.tls()?;
        self.options.credential = self.credential()?;
        Ok(self.options)
    }

    fn read_preference(&mut self) -> Result<Option<SelectionCriteria>> {
        let options = match (self.read_preference_tags.take(), self.max_staleness.take()) {
            (None, None) => None,
            (tag_sets, max_staleness) => Some(ReadPreferenceOptions {
                tag_sets,
                max_staleness,
            }),
        };
        match self.read_preference.take() {
            Some(mode) => Ok(Some(ReadPreference::from_mode(&mode, options)?.into())),
            None if options.is_some() => Err(Error::invalid_argument(
                "read preference tags and max staleness need a readPreference mode",
            )),
            None => Ok(None),
        }
    }

    fn tls(&mut self) -> Result<Option<TlsOptions>> {
        let enabled = match (self.tls, self.ssl) {
            (Some(tls), Some(ssl)) if tls != ssl => {
                return Err(Error::invalid_argument("tls and ssl must agree"))
            }
            (tls, ssl) => tls.or(ssl),
        };
        let insecure = (self.tls_insecure, self.tls_allow_invalid_certificates);
        let allow_invalid_certificates = match insecure {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_argument(
                    "tlsInsecure and tlsAllowInvalidCertificates are mutually exclusive",
                ))
            }
            (insecure, allow) => insecure.or(allow),
        };
        let tls = TlsOptions {
            allow_invalid_certificates,
            ca_file_path: self.tls_ca_file.take(),
        };
        let configured = tls != TlsOptions::default();

        match enabled {
            Some(false) if configured => Err(Error::invalid_argument(
                "TLS options cannot be given when TLS is disabled",
            )),
            Some(true) => Ok(Some(tls)),
            None if configured => Ok(Some(tls)),
            _ => Ok(None),
        }
    }

    fn credential(&mut self) -> Result<Option<Credential>> {
        let Some(username) = self.username.take() else {
            if self.auth_mechanism.is_some() {
                return Err(Error::invalid_argument("authMechanism requires a username"));
            }
            return Ok(None);
        };
        Ok(Some(Credential {
            username: Some(username),
            password: self.password.take(),
            source: self
                .auth_source
                .take()
                .or_else(|| self.options.default_database.clone()),
            mechanism: self.auth_mechanism.take(),
        }))
    }
}

/// Settings for a [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Used by `start_transaction` for anything its own options leave unset. The client's
    /// defaults fill in the rest.
    pub default_transaction_options: Option<TransactionOptions>,

    /// Reads observe the session's earlier writes and reads. Defaults to true.
    pub causal_consistency: Option<bool>,
}

/// Settings for one transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// Read concern of every read in the transaction. Sent with the first command only.
    pub read_concern: Option<ReadConcern>,

    /// Write concern of the commit or abort.
    pub write_concern: Option<WriteConcern>,

    /// Must be the primary read preference.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Sent as `maxTimeMS` with `commitTransaction`.
    pub max_commit_time: Option<Duration>,
}
