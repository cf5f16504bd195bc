//! Tests that drive a real `Client` against the in-process wire server in [`mock`].

mod bulk_write;
mod client;
mod mock;
mod transactions;
mod util;

pub(crate) use self::{
    mock::{cursor_reply, mongos_hello, standalone_hello, MockReply, MockServer},
    util::{client_with_events, Event, EventCollector},
};
