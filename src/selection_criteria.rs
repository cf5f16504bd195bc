use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
};

/// Which servers an operation may run on.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Servers matching a read preference.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Servers for which the function returns true.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

/// Predicates never compare equal, not even to themselves.
impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(ours), Self::ReadPreference(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(read_pref) => Some(read_pref),
            Self::Predicate(_) => None,
        }
    }

    /// Only the server at `address`. Cursors and pinned transactions must go back to the server
    /// holding their state.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| server.address() == &address))
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        self.as_read_pref() == Some(&ReadPreference::Primary)
    }
}

/// A server filter for [`SelectionCriteria::Predicate`].
pub type Predicate = Arc<dyn Fn(&ServerInfo) -> bool + Send + Sync>;

/// Where reads go within a replica set or sharded cluster.
///
/// Non-primary modes may narrow the candidates with tag sets and a `max_staleness`, the furthest a
/// secondary may lag behind the primary. Staleness is sent to mongos in whole seconds as
/// `maxStalenessSeconds`.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    Primary,

    /// Secondaries only.
    Secondary {
        /// Tag sets and staleness limit.
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or a secondary while there is none.
    PrimaryPreferred {
        /// Tag sets and staleness limit for the secondaries.
        options: Option<ReadPreferenceOptions>,
    },

    /// A secondary, or the primary while there is none.
    SecondaryPreferred {
        /// Tag sets and staleness limit for the secondaries.
        options: Option<ReadPreferenceOptions>,
    },

    /// Any member within the latency window of the fastest.
    Nearest {
        /// Tag sets and staleness limit.
        options: Option<ReadPreferenceOptions>,
    },
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.mode();
        let (first, rest) = mode.split_at(1);
        write!(f, "{{ Mode: {}{rest}", first.to_ascii_uppercase())?;
        if let Some(tag_sets) = self.tag_sets() {
            write!(f, ", Tag Sets: {tag_sets:?}")?;
        }
        if let Some(max_staleness) = self.max_staleness() {
            write!(f, ", Max Staleness: {max_staleness:?}")?;
        }
        f.write_str(" }")
    }
}

/// Refinements for the non-primary read preference modes.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order. The first tag set that some eligible server carries entirely picks the
    /// candidates. An empty tag set matches every server.
    pub tag_sets: Option<Vec<TagSet>>,

    /// Secondaries lagging the primary by more than this are skipped. At least 90 seconds, and
    /// at least the heartbeat frequency plus ten seconds.
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    /// True when the options would not narrow anything down.
    pub(crate) fn is_default(&self) -> bool {
        let no_tags = match self.tag_sets.as_deref() {
            None | Some([]) => true,
            Some([only]) => only.is_empty(),
            Some(_) => false,
        };
        self.max_staleness.is_none() && no_tags
    }
}

impl ReadPreference {
    /// Parses a `readPreference` mode name, ignoring case.
    pub(crate) fn from_mode(mode: &str, options: Option<ReadPreferenceOptions>) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "primary" if options.as_ref().is_some_and(|o| !o.is_default()) => {
                Err(Error::invalid_argument(
                    "tag sets and max staleness need a non-primary read preference",
                ))
            }
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary { options }),
            "primarypreferred" => Ok(Self::PrimaryPreferred { options }),
            "secondarypreferred" => Ok(Self::SecondaryPreferred { options }),
            "nearest" => Ok(Self::Nearest { options }),
            unknown => Err(Error::invalid_argument(format!(
                "unknown read preference mode '{unknown}'"
            ))),
        }
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options()?.max_staleness
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options()?.tag_sets.as_ref()
    }

    /// The `$readPreference` document sent to mongos. Tags within a set are sorted by name.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("mode", self.mode());
        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<Bson> = tag_sets
                .iter()
                .map(|tag_set| {
                    let mut pairs: Vec<(&String, &String)> = tag_set.iter().collect();
                    pairs.sort();
                    let mut tags = Document::new();
                    for (name, value) in pairs {
                        tags.insert(name.as_str(), value.as_str());
                    }
                    Bson::Document(tags)
                })
                .collect();
            doc.insert("tags", tags);
        }
        if let Some(max_staleness) = self.max_staleness() {
            let seconds = i64::try_from(max_staleness.as_secs()).unwrap_or(i64::MAX);
            doc.insert("maxStalenessSeconds", seconds);
        }
        doc
    }
}

/// Server tags that must all be present, as name/value pairs.
pub type TagSet = HashMap<String, String>;
