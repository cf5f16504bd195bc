//! Read and write concerns.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    bson::{Bson, Document, Timestamp},
    error::{Error, Result},
};

/// How consistent and isolated the data returned by a read must be.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The requested level.
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    /// `"majority"`: data acknowledged by a majority of the replica set.
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// `"local"`: the node's most recent data.
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// `"linearizable"`.
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// `"available"`.
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    /// `"snapshot"`.
    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    /// A level this crate has no name for, passed to the server as given.
    pub fn custom(level: impl AsRef<str>) -> Self {
        ReadConcernLevel::from_str(level.as_ref()).into()
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// The `readConcern` field as sent: the level is optional, and causally consistent sessions add
/// `afterClusterTime`.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ReadConcernInternal {
    pub(crate) level: Option<ReadConcernLevel>,
    pub(crate) after_cluster_time: Option<Timestamp>,
}

impl ReadConcernInternal {
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(level) = &self.level {
            doc.insert("level", level.as_str());
        }
        if let Some(time) = self.after_cluster_time {
            doc.insert("afterClusterTime", time);
        }
        doc
    }
}

impl From<ReadConcern> for ReadConcernInternal {
    fn from(read_concern: ReadConcern) -> Self {
        Self {
            level: Some(read_concern.level),
            ..Default::default()
        }
    }
}

/// The level of a [`ReadConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// `"local"`
    Local,
    /// `"majority"`
    Majority,
    /// `"linearizable"`
    Linearizable,
    /// `"available"`
    Available,
    /// `"snapshot"`
    Snapshot,

    /// Any other level.
    Custom(String),
}

impl ReadConcernLevel {
    const NAMED: [(&'static str, ReadConcernLevel); 5] = [
        ("local", ReadConcernLevel::Local),
        ("majority", ReadConcernLevel::Majority),
        ("linearizable", ReadConcernLevel::Linearizable),
        ("available", ReadConcernLevel::Available),
        ("snapshot", ReadConcernLevel::Snapshot),
    ];

    pub(crate) fn from_str(name: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find_map(|(known, level)| (known == name).then_some(level))
            .unwrap_or_else(|| Self::Custom(name.to_owned()))
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Custom(name) => name,
            named => Self::NAMED
                .iter()
                .find_map(|(name, level)| (level == named).then_some(*name))
                .unwrap_or_default(),
        }
    }
}

/// How many nodes must acknowledge a write, and how, before the server replies.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// The nodes that must have applied the write.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for `w` before reporting a write concern error. The client
    /// waits slightly longer than this for the reply.
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal.
    pub journal: Option<bool>,
}

/// The `w` of a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// This many nodes. Zero means the write is not acknowledged at all.
    Nodes(u32),

    /// A majority of voting nodes.
    Majority,

    /// A named write concern configured on the replica set.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(nodes: u32) -> Self {
        Self::Nodes(nodes)
    }
}

impl From<&str> for Acknowledgment {
    fn from(name: &str) -> Self {
        match name {
            "majority" => Self::Majority,
            custom => Self::Custom(custom.to_owned()),
        }
    }
}

impl From<String> for Acknowledgment {
    fn from(name: String) -> Self {
        name.as_str().into()
    }
}

impl From<&Acknowledgment> for Bson {
    fn from(w: &Acknowledgment) -> Bson {
        match w {
            Acknowledgment::Nodes(nodes) => Bson::from(*nodes),
            Acknowledgment::Majority => Bson::from("majority"),
            Acknowledgment::Custom(name) => Bson::from(name.as_str()),
        }
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        Self {
            w: Some(w),
            ..Default::default()
        }
    }
}

impl WriteConcern {
    /// `w: nodes`.
    pub fn nodes(nodes: u32) -> Self {
        Acknowledgment::Nodes(nodes).into()
    }

    /// `w: "majority"`.
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// `w: 0`.
    pub fn unacknowledged() -> Self {
        Self::nodes(0)
    }

    /// False only for `w: 0` without journaling.
    pub(crate) fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// An empty write concern defers to the server's default and is left off commands.
    pub(crate) fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot combine w=0 with j=true",
            ));
        }
        Ok(())
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        let mut doc = Document::new();
        if let Some(w) = &self.w {
            doc.insert("w", w);
        }
        if let Some(w_timeout) = self.w_timeout {
            let millis = i64::try_from(w_timeout.as_millis()).map_err(|_| {
                Error::invalid_argument(format!("wtimeout of {w_timeout:?} does not fit in i64"))
            })?;
            doc.insert("wtimeout", millis);
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        Ok(doc)
    }
}
