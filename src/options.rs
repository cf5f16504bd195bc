//! Every options type, re-exported in one place.
//!
//! Options structs have builders, so only the fields of interest need naming:
//!
//! ```rust
//! use mongodb_core::options::FindOptions;
//!
//! let options = FindOptions::builder().limit(20).batch_size(5).build();
//! assert_eq!(options.limit, Some(20));
//! ```

pub use crate::{
    client::{auth::*, options::*},
    coll::options::*,
    collation::*,
    concern::*,
    db::options::*,
    selection_criteria::*,
};

/// Fills each unset `$field` of the optional options `$opts` from the accessor of the same name
/// on `$obj`, a client, database, collection or session.
macro_rules! resolve_options {
    ($obj:expr, $opts:expr, [$( $field:ident ),+] ) => {
        $(
            if let Some(inherited) = $obj.$field() {
                let options = $opts.get_or_insert_with(Default::default);
                if options.$field.is_none() {
                    options.$field = Some(inherited.clone());
                }
            }
        )+
    };
}

/// Copies each `$field` that `$dst` leaves unset from `$src`.
macro_rules! merge_options {
    ($src:expr, $dst:expr, [$( $field:ident ),+] ) => {
        $(
            if $dst.$field.is_none() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

/// Evaluates to `Result<()>`. Outside a transaction the operation inherits `$obj`'s concern;
/// inside one, the transaction's concern applies and an explicit one is an error.
macro_rules! resolve_rw_concern_with_session {
    ($obj:expr, $opts:expr, $session:expr, $concern:ident, $name:literal) => {{
        let in_transaction = $session.as_ref().is_some_and(|s| s.in_transaction());
        let explicit = $opts.as_ref().is_some_and(|o| o.$concern.is_some());
        match (in_transaction, explicit) {
            (false, _) => {
                resolve_options!($obj, $opts, [$concern]);
                Ok(())
            }
            (true, true) => Err(crate::error::Error::invalid_argument(concat!(
                "cannot set ",
                $name,
                " concern after starting a transaction"
            ))),
            (true, false) => Ok(()),
        }
    }};
}

macro_rules! resolve_read_concern_with_session {
    ($obj:expr, $opts:expr, $session:expr) => {
        resolve_rw_concern_with_session!($obj, $opts, $session, read_concern, "read")
    };
}

macro_rules! resolve_write_concern_with_session {
    ($obj:expr, $opts:expr, $session:expr) => {
        resolve_rw_concern_with_session!($obj, $opts, $session, write_concern, "write")
    };
}

/// Statements of a transaction go where the transaction goes, so only operations outside one
/// inherit `$obj`'s selection criteria.
macro_rules! resolve_selection_criteria_with_session {
    ($obj:expr, $opts:expr, $session:expr) => {
        if !$session.as_ref().is_some_and(|s| s.in_transaction()) {
            resolve_options!($obj, $opts, [selection_criteria]);
        }
    };
}
