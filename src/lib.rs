//! The core of a MongoDB driver: everything between a `Collection::insert_one` call and the bytes
//! on the socket, with none of the higher-level helpers built on top.
//!
//! The crate carries its own [`bson`] implementation, frames commands as `OP_MSG` (falling back
//! to `OP_QUERY` for the initial handshake), keeps a connection pool per server, monitors the
//! deployment to maintain a topology description, selects servers by read preference and
//! latency, and tracks logical sessions and transactions.
//!
//! # Connecting to a MongoDB deployment
//! ```no_run
//! # async fn foo() -> mongodb_core::error::Result<()> {
//! use mongodb_core::{options::ClientOptions, Client};
//!
//! // Parse a connection string into an options struct.
//! let mut client_options = ClientOptions::parse("mongodb://localhost:27017")?;
//!
//! // Manually set an option.
//! client_options.app_name = Some("My App".to_string());
//!
//! // Get a handle to the deployment.
//! let client = Client::with_options(client_options)?;
//! # Ok(()) }
//! ```
//!
//! # Inserting and reading documents
//! ```no_run
//! # async fn foo() -> mongodb_core::error::Result<()> {
//! # let client = mongodb_core::Client::with_uri_str("mongodb://localhost:27017").await?;
//! use futures::stream::TryStreamExt;
//! use mongodb_core::{bson::doc, options::FindOptions};
//!
//! let collection = client.database("mydb").collection("books");
//!
//! let docs = vec![
//!     doc! { "title": "1984", "author": "George Orwell" },
//!     doc! { "title": "Animal Farm", "author": "George Orwell" },
//!     doc! { "title": "The Great Gatsby", "author": "F. Scott Fitzgerald" },
//! ];
//! collection.insert_many(docs, None).await?;
//!
//! let options = FindOptions::builder().sort(doc! { "title": 1 }).build();
//! let mut cursor = collection.find(doc! { "author": "George Orwell" }, options).await?;
//! while let Some(book) = cursor.try_next().await? {
//!     println!("title: {}", book.get_str("title").unwrap_or_default());
//! }
//! # Ok(()) }
//! ```
//!
//! # Transactions
//! ```no_run
//! # async fn foo() -> mongodb_core::error::Result<()> {
//! # let client = mongodb_core::Client::with_uri_str("mongodb://localhost:27017").await?;
//! use mongodb_core::bson::doc;
//!
//! let accounts = client.database("bank").collection("accounts");
//! let mut session = client.start_session(None).await?;
//!
//! session.start_transaction(None).await?;
//! accounts
//!     .update_one_with_session(
//!         doc! { "_id": 1 },
//!         doc! { "$inc": doc! { "balance": -10 } },
//!         None,
//!         &mut session,
//!     )
//!     .await?;
//! accounts
//!     .update_one_with_session(
//!         doc! { "_id": 2 },
//!         doc! { "$inc": doc! { "balance": 10 } },
//!         None,
//!         &mut session,
//!     )
//!     .await?;
//! session.commit_transaction().await?;
//! # Ok(()) }
//! ```
//!
//! # Logging
//! Commands, connection pool activity, server selection and topology changes are emitted as
//! [`tracing`](https://docs.rs/tracing) events under the `mongodb_core::command`,
//! `mongodb_core::connection`, `mongodb_core::server_selection` and `mongodb_core::topology`
//! targets. Applications can also observe them directly through the handler traits in [`event`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![allow(clippy::unreadable_literal, clippy::cognitive_complexity, clippy::float_cmp)]

#[macro_use]
pub mod options;

mod base64;
pub mod bson;
mod bson_util;
mod client;
mod cmap;
mod coll;
mod collation;
mod concern;
mod cursor;
mod db;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    client::{session::ClientSession, Client},
    coll::{Collection, WriteModel},
    cursor::{Cursor, SessionCursor},
    db::Database,
};

pub use {client::session::ClusterTime, coll::Namespace, sdam::public::*};
