use std::cmp::Ordering;

use derive_where::derive_where;

use crate::{
    bson::{doc, Document, Timestamp},
    error::Result,
};

/// The logical clock a deployment attaches to its replies as `$clusterTime`. Drivers gossip the
/// newest one they have seen back to the server. Only the timestamp takes part in comparisons.
#[derive(Debug, Clone)]
#[derive_where(PartialEq, Eq)]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derive_where(skip)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// Reads a `$clusterTime` document as sent by the server.
    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            cluster_time: doc.get_timestamp("clusterTime")?,
            signature: doc.get_document("signature")?.clone(),
        })
    }

    pub(crate) fn to_document(&self) -> Document {
        doc! {
            "clusterTime": self.cluster_time,
            "signature": self.signature.clone(),
        }
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
