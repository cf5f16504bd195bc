//! Language-aware string comparison rules for queries, sorts and indexes.

use typed_builder::TypedBuilder;

use crate::bson::{doc, Bson, Document};

/// How the server compares strings. Only `locale` is required; everything else falls back to the
/// locale's own defaults.
///
/// ```rust
/// # use mongodb_core::options::{Collation, CollationStrength};
/// // Case and accent insensitive German comparisons.
/// let collation = Collation::builder()
///     .locale("de")
///     .strength(CollationStrength::Primary)
///     .build();
/// ```
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Collation {
    /// An ICU locale such as `"en_US"`, or `"simple"` for binary comparison.
    #[builder(!default)]
    pub locale: String,

    /// How many levels of difference count.
    pub strength: Option<CollationStrength>,

    /// Adds a case level below the primary or secondary strength.
    pub case_level: Option<bool>,

    /// Whether upper or lower case sorts first at the tertiary level.
    pub case_first: Option<CollationCaseFirst>,

    /// Compare runs of digits by numeric value, so that `"10"` sorts after `"9"`.
    pub numeric_ordering: Option<bool>,

    /// Whether spaces and punctuation count as base characters.
    pub alternate: Option<CollationAlternate>,

    /// Normalize text before comparing it.
    pub normalization: Option<bool>,

    /// Compare accents from the end of the string, as in some French dictionaries.
    pub backwards: Option<bool>,
}

impl Collation {
    pub(crate) fn to_document(&self) -> Document {
        let optional: [(&str, Option<Bson>); 7] = [
            ("strength", self.strength.map(|s| Bson::Int32(s.level()))),
            ("caseLevel", self.case_level.map(Bson::Boolean)),
            ("caseFirst", self.case_first.map(|c| c.as_str().into())),
            ("numericOrdering", self.numeric_ordering.map(Bson::Boolean)),
            ("alternate", self.alternate.map(|a| a.as_str().into())),
            ("normalization", self.normalization.map(Bson::Boolean)),
            ("backwards", self.backwards.map(Bson::Boolean)),
        ];
        let mut document = doc! { "locale": self.locale.as_str() };
        for (key, value) in optional {
            if let Some(value) = value {
                document.insert(key, value);
            }
        }
        document
    }
}

/// Comparison levels, from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollationStrength {
    /// Base letters only: `"a"` equals `"á"` and `"A"`.
    Primary,

    /// Accents too: `"a"` differs from `"á"` but equals `"A"`.
    Secondary,

    /// Accents and case. The ICU default.
    Tertiary,

    /// Also tells apart punctuation that `Shifted` ignores at lower levels.
    Quaternary,

    /// Breaks remaining ties by code point.
    Identical,
}

impl CollationStrength {
    fn level(self) -> i32 {
        self as i32 + 1
    }
}

/// Case ordering at the tertiary level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollationCaseFirst {
    /// `"A"` before `"a"`.
    Upper,

    /// `"a"` before `"A"`.
    Lower,

    /// The locale's ordering, close to `Lower`.
    Off,
}

impl CollationCaseFirst {
    /// The value sent as `caseFirst`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Off => "off",
        }
    }
}

/// Treatment of spaces and punctuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollationAlternate {
    /// They compare like any other character.
    NonIgnorable,

    /// They only matter at the quaternary strength and above.
    Shifted,
}

impl CollationAlternate {
    /// The value sent as `alternate`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonIgnorable => "non-ignorable",
            Self::Shifted => "shifted",
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Collation, CollationAlternate, CollationCaseFirst, CollationStrength};
    use crate::bson::doc;

    #[test]
    fn only_set_fields_are_sent() {
        let collation = Collation::builder()
            .locale("fr")
            .strength(CollationStrength::Secondary)
            .case_first(CollationCaseFirst::Upper)
            .build();
        assert_eq!(
            collation.to_document(),
            doc! { "locale": "fr", "strength": 2, "caseFirst": "upper" }
        );
    }

    #[test]
    fn every_field() {
        let collation = Collation::builder()
            .locale("en")
            .strength(CollationStrength::Identical)
            .case_level(true)
            .numeric_ordering(true)
            .alternate(CollationAlternate::Shifted)
            .normalization(false)
            .backwards(false)
            .build();
        assert_eq!(
            collation.to_document(),
            doc! {
                "locale": "en",
                "strength": 5,
                "caseLevel": true,
                "numericOrdering": true,
                "alternate": "shifted",
                "normalization": false,
                "backwards": false,
            }
        );
    }
}
