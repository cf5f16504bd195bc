//! Contains the events and functionality for monitoring internal `Client` behavior.
//!
//! Applications observe the driver by implementing one or more of the handler traits
//! ([`CommandEventHandler`](command::CommandEventHandler),
//! [`CmapEventHandler`](cmap::CmapEventHandler) and [`SdamEventHandler`](sdam::SdamEventHandler))
//! and registering them on [`ClientOptions`](crate::options::ClientOptions). Every method has a
//! no-op default, so a handler only implements the events it cares about.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use mongodb_core::{
//! #     event::command::{CommandEventHandler, CommandStartedEvent},
//! #     options::ClientOptions,
//! # };
//! struct Logger;
//!
//! impl CommandEventHandler for Logger {
//!     fn handle_command_started_event(&self, event: CommandStartedEvent) {
//!         println!("{} on {}", event.command_name, event.db);
//!     }
//! }
//!
//! let options = ClientOptions::builder()
//!     .command_event_handler(Arc::new(Logger) as Arc<dyn CommandEventHandler>)
//!     .build();
//! ```

pub mod cmap;
pub mod command;
pub mod sdam;

/// Hands the event built by `make` to the application's `handler` and to `tracer`, building it
/// only when at least one of them is present.
pub(crate) fn deliver<H: ?Sized, E: Clone>(
    handler: Option<&H>,
    tracer: Option<&H>,
    make: impl FnOnce() -> E,
    dispatch: impl Fn(E, &H),
) {
    match (handler, tracer) {
        (None, None) => {}
        (Some(only), None) | (None, Some(only)) => dispatch(make(), only),
        (Some(handler), Some(tracer)) => {
            let event = make();
            dispatch(event.clone(), handler);
            dispatch(event, tracer);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use super::deliver;

    #[test]
    fn events_are_only_built_for_receivers() {
        let received = RefCell::new(Vec::new());
        let record = |event: u32, name: &str| received.borrow_mut().push((event, name.to_owned()));

        deliver::<str, u32>(None, None, || unreachable!(), record);
        deliver(Some("app"), None, || 1, record);
        deliver(Some("app"), Some("tracing"), || 2, record);

        assert_eq!(
            received.into_inner(),
            vec![
                (1, "app".to_owned()),
                (2, "app".to_owned()),
                (2, "tracing".to_owned()),
            ]
        );
    }
}
