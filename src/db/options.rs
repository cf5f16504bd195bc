use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Defaults for a [`Database`](crate::Database) handle. Anything left unset is inherited from
/// the [`Client`](crate::Client).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct DatabaseOptions {
    /// Where reads run by default.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Read concern attached to reads by default.
    pub read_concern: Option<ReadConcern>,

    /// Write concern attached to writes by default.
    pub write_concern: Option<WriteConcern>,
}
