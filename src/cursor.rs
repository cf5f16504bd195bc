use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
};

use derive_where::derive_where;
use futures_core::Stream;
use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    bson::{doc, Document},
    error::Result,
    operation::{CursorInformation, CursorSpecification, GetMore, RunCommand},
    options::SelectionCriteria,
    results::GetMoreResult,
    runtime,
    Client,
    ClientSession,
};

/// A `Cursor` streams the result of a query. When a query is made, a `Cursor` will be returned with
/// the first batch of results from the server; the documents will be returned as the `Cursor` is
/// iterated. When the batch is exhausted and if there are more results, the `Cursor` will fetch the
/// next batch of documents with a `getMore` sent to the server that created the cursor, and so
/// forth until the results are exhausted. Because of this batching, additional network I/O may
/// occur on any call to `next`, so a `Cursor` yields `Result<Document>` items.
///
/// The batch size of the `Cursor` can be configured using the options to the method that returns
/// it, e.g. the `batch_size` field of [`FindOptions`](options/struct.FindOptions.html).
///
/// A `Cursor` implements [`Stream`](futures_core::Stream):
///
/// ```rust,no_run
/// # use futures::stream::TryStreamExt;
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// #
/// # async fn do_stuff() -> Result<()> {
/// # let client = Client::with_uri_str("mongodb://example.com").await?;
/// # let coll = client.database("foo").collection("bar");
/// let mut cursor = coll.find(doc! { "x": 1 }, None).await?;
/// while let Some(doc) = cursor.try_next().await? {
///     println!("{}", doc);
/// }
/// # Ok(())
/// # }
/// ```
///
/// If a `Cursor` is dropped before it is exhausted, a `killCursors` command is sent in the
/// background to release the server-side cursor.
#[derive_where(Debug)]
pub struct Cursor {
    client: Client,
    info: CursorInformation,
    buffer: VecDeque<Document>,
    exhausted: bool,
    /// The implicit session the cursor was created in. It travels into each in-flight getMore and
    /// comes back with the reply.
    session: Option<ClientSession>,
    #[derive_where(skip)]
    pending: Option<PendingGetMore>,
}

type PendingGetMore = BoxFuture<'static, (Result<GetMoreResult>, Option<ClientSession>)>;

impl Cursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        Self {
            client,
            exhausted: spec.info.id == 0,
            info: spec.info,
            buffer: spec.initial_buffer,
            session,
            pending: None,
        }
    }

    /// Whether the server-side cursor has been fully iterated. Documents may still be buffered.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn get_more(&mut self) -> PendingGetMore {
        let client = self.client.clone();
        let get_more = GetMore::new(self.info.clone());
        let mut session = self.session.take();
        async move {
            let result = client.execute_operation(get_more, session.as_mut()).await;
            (result, session)
        }
        .boxed()
    }

    fn apply(&mut self, get_more: GetMoreResult) {
        self.buffer = get_more.batch;
        self.info.id = get_more.id;
        self.exhausted = get_more.exhausted;
    }
}

impl Stream for Cursor {
    type Item = Result<Document>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(doc) = this.buffer.pop_front() {
                return Poll::Ready(Some(Ok(doc)));
            }
            if this.exhausted {
                return Poll::Ready(None);
            }

            let mut pending = match this.pending.take() {
                Some(pending) => pending,
                None => this.get_more(),
            };
            let (result, session) = match pending.poll_unpin(cx) {
                Poll::Ready(output) => output,
                Poll::Pending => {
                    this.pending = Some(pending);
                    return Poll::Pending;
                }
            };
            this.session = session;

            match result {
                Ok(get_more) => this.apply(get_more),
                Err(error) => {
                    if error.is_network_error() || error.code() == Some(CURSOR_NOT_FOUND) {
                        this.exhausted = true;
                    }
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.exhausted {
            return;
        }
        kill_cursor(
            self.client.clone(),
            &self.info,
            KillSession::Owned(self.session.take()),
        );
    }
}

/// A `SessionCursor` is a cursor that was created with a `ClientSession` and must be iterated
/// using one. Iterating it with a different session than the one that created it is an error.
///
/// ```rust,no_run
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// # async fn do_stuff() -> Result<()> {
/// # let client = Client::with_uri_str("mongodb://example.com").await?;
/// # let coll = client.database("foo").collection("bar");
/// let mut session = client.start_session(None).await?;
/// let mut cursor = coll.find_with_session(doc! {}, None, &mut session).await?;
/// while let Some(doc) = cursor.next(&mut session).await.transpose()? {
///     println!("{}", doc);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SessionCursor {
    client: Client,
    info: CursorInformation,
    /// The id of the session that created the cursor, for the `killCursors` sent on drop.
    lsid: Document,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl SessionCursor {
    pub(crate) fn new(client: Client, spec: CursorSpecification, lsid: Document) -> Self {
        Self {
            client,
            lsid,
            exhausted: spec.info.id == 0,
            info: spec.info,
            buffer: spec.initial_buffer,
        }
    }

    /// Retrieves the next document, fetching another batch with `session` when the buffered one
    /// runs out. Returns `None` once the cursor is exhausted.
    pub async fn next(&mut self, session: &mut ClientSession) -> Option<Result<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(Ok(doc));
            }
            if self.exhausted {
                return None;
            }

            let get_more = GetMore::new(self.info.clone());
            match self.client.execute_operation(get_more, &mut *session).await {
                Ok(result) => {
                    self.buffer = result.batch;
                    self.info.id = result.id;
                    self.exhausted = result.exhausted;
                }
                Err(error) => {
                    if error.is_network_error() || error.code() == Some(CURSOR_NOT_FOUND) {
                        self.exhausted = true;
                    }
                    return Some(Err(error));
                }
            }
        }
    }

    /// Drains the cursor into a `Vec`, stopping at the first error.
    pub async fn collect(&mut self, session: &mut ClientSession) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        while let Some(doc) = self.next(session).await {
            docs.push(doc?);
        }
        Ok(docs)
    }

    /// Whether the server-side cursor has been fully iterated. Documents may still be buffered.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Drop for SessionCursor {
    fn drop(&mut self) {
        if self.exhausted {
            return;
        }
        let lsid = std::mem::take(&mut self.lsid);
        kill_cursor(self.client.clone(), &self.info, KillSession::Borrowed(lsid));
    }
}

const CURSOR_NOT_FOUND: i32 = 43;

/// The session a dropped cursor was created in.
enum KillSession {
    /// Owned by the cursor and released once `killCursors` completes.
    Owned(Option<ClientSession>),
    /// Still held by the application, so only its id goes with the command.
    Borrowed(Document),
}

/// Sends `killCursors` for a cursor that is being dropped, in the session that created it.
fn kill_cursor(client: Client, info: &CursorInformation, session: KillSession) {
    let mut command = doc! {
        "killCursors": info.ns.coll.clone(),
        "cursors": vec![info.id],
    };
    let session = match session {
        KillSession::Owned(session) => session,
        KillSession::Borrowed(lsid) => {
            command.insert("lsid", lsid);
            None
        }
    };
    let op = RunCommand::new(
        info.ns.db.clone(),
        command,
        Some(SelectionCriteria::from_address(info.address.clone())),
    );
    let Ok(op) = op else {
        return;
    };
    let cursor_id = info.id;
    runtime::try_execute(move || async move {
        let mut session = session;
        if let Err(error) = client.execute_operation(op, session.as_mut()).await {
            tracing::debug!(%error, cursor_id, "killCursors failed");
        }
    });
}
