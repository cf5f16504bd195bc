/// Builds a [`Document`](crate::bson::Document) from `key: value` pairs, preserving their
/// order. Values may be anything convertible into [`Bson`](crate::bson::Bson), including
/// nested `doc!` invocations.
///
/// ```
/// use mongodb_core::doc;
///
/// let filter = doc! { "x": 1, "tags": vec!["a", "b"], "meta": doc! { "n": 2.5 } };
/// assert_eq!(filter.first_key(), Some("x"));
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ( $( $key:tt : $val:expr ),+ $(,)? ) => {{
        let mut document = $crate::bson::Document::new();
        $(
            document.insert($key, $val);
        )+
        document
    }};
}
