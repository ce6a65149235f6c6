//! turn a list of queries into the minimal set of protocol exchanges and route streamed row
//! messages to the right [`Sink`].
//!
//! grounded on the host crate's `query/base.rs`/`query/simple.rs`/`query/encode.rs` message
//! dispatch over a [`crate::driver::codec::Response`] and its `body_to_affected_rows` command
//! tag parsing; generalized here to a cursor walking N queries per simple-mode command and a
//! single parameterized query per extended-protocol command.

use core::time::Duration;

use std::time::Instant;

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::oneshot;
use tracing::debug;
use xitca_io::bytes::BytesMut;

use super::{client::Client, error::Error, fault::Fault, session::LogQueryText, value::Value};

/// column name and type oid, as seen in a `RowDescription`.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
}

/// a single row's text-format column values, paired with the column list active when it
/// arrived.
pub struct RowData<'a> {
    pub columns: &'a [ColumnInfo],
    values: backend::DataRowBody,
    ranges: Vec<Option<core::ops::Range<usize>>>,
}

impl<'a> RowData<'a> {
    fn try_new(columns: &'a [ColumnInfo], body: backend::DataRowBody) -> Result<Self, Fault> {
        let mut ranges = Vec::with_capacity(columns.len());
        let mut it = body.ranges();
        while let Some(range) = it.next().map_err(|e| Fault::ParseError(e.to_string()))? {
            ranges.push(range);
        }
        Ok(RowData {
            columns,
            values: body,
            ranges,
        })
    }

    /// the raw text-format value at `idx`, or `None` for SQL NULL.
    pub fn get(&self, idx: usize) -> Option<&str> {
        let range = self.ranges.get(idx)?.clone()?;
        core::str::from_utf8(&self.values.buffer()[range]).ok()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// a row-by-row result consumer. implemented by the buffering [`Sink::Object`]/[`Sink::Array`]
/// collectors here and, for identity-mapped hydration, by `crate::store::Store`.
pub(crate) trait RowHandler: Send {
    fn row_description(&mut self, _columns: &[ColumnInfo]) {}
    fn row(&mut self, row: RowData<'_>) -> Result<(), Fault>;
    fn command_complete(&mut self, _tag: &str, _rows: u64) {}
    fn end(&mut self, error: Option<&Fault>);
}

struct EmptySink {
    rows: u64,
    reply: Option<oneshot::Sender<Result<u64, Fault>>>,
}

impl RowHandler for EmptySink {
    fn row(&mut self, _row: RowData<'_>) -> Result<(), Fault> {
        Ok(())
    }

    fn command_complete(&mut self, _tag: &str, rows: u64) {
        self.rows = rows;
    }

    fn end(&mut self, error: Option<&Fault>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(match error {
                Some(e) => Err(e.clone()),
                None => Ok(self.rows),
            });
        }
    }
}

/// one row rendered as an ordered `(column, value)` map, preserving `RowDescription` order.
pub type ObjectRow = Vec<(String, Option<String>)>;

struct ObjectSink {
    rows: Vec<ObjectRow>,
    reply: Option<oneshot::Sender<Result<Vec<ObjectRow>, Fault>>>,
}

impl RowHandler for ObjectSink {
    fn row(&mut self, row: RowData<'_>) -> Result<(), Fault> {
        let mapped = row
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), row.get(i).map(str::to_owned)))
            .collect();
        self.rows.push(mapped);
        Ok(())
    }

    fn end(&mut self, error: Option<&Fault>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(match error {
                Some(e) => Err(e.clone()),
                None => Ok(core::mem::take(&mut self.rows)),
            });
        }
    }
}

/// one row rendered positionally, in `RowDescription` order.
pub type ArrayRow = Vec<Option<String>>;

struct ArraySink {
    rows: Vec<ArrayRow>,
    reply: Option<oneshot::Sender<Result<Vec<ArrayRow>, Fault>>>,
}

impl RowHandler for ArraySink {
    fn row(&mut self, row: RowData<'_>) -> Result<(), Fault> {
        let values = (0..row.len()).map(|i| row.get(i).map(str::to_owned)).collect();
        self.rows.push(values);
        Ok(())
    }

    fn end(&mut self, error: Option<&Fault>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(match error {
                Some(e) => Err(e.clone()),
                None => Ok(core::mem::take(&mut self.rows)),
            });
        }
    }
}

/// a result-routing destination for one query within a [`Command`].
pub(crate) enum Sink {
    Empty(EmptySink),
    Object(ObjectSink),
    Array(ArraySink),
    /// caller-supplied row consumer, e.g. a one-off scan or a streaming export.
    Custom(Box<dyn RowHandler>),
    /// identity-mapped model hydration, implemented by `crate::store::Store`.
    Model(Box<dyn RowHandler>),
}

impl Sink {
    pub(crate) fn empty() -> (Self, oneshot::Receiver<Result<u64, Fault>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Empty(EmptySink {
                rows: 0,
                reply: Some(tx),
            }),
            rx,
        )
    }

    pub(crate) fn object() -> (Self, oneshot::Receiver<Result<Vec<ObjectRow>, Fault>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Object(ObjectSink {
                rows: Vec::new(),
                reply: Some(tx),
            }),
            rx,
        )
    }

    pub(crate) fn array() -> (Self, oneshot::Receiver<Result<Vec<ArrayRow>, Fault>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Array(ArraySink {
                rows: Vec::new(),
                reply: Some(tx),
            }),
            rx,
        )
    }

    pub(crate) fn custom(handler: Box<dyn RowHandler>) -> Self {
        Self::Custom(handler)
    }

    pub(crate) fn model(handler: Box<dyn RowHandler>) -> Self {
        Self::Model(handler)
    }

    fn row_description(&mut self, columns: &[ColumnInfo]) {
        if let Self::Custom(h) | Self::Model(h) = self {
            h.row_description(columns);
        }
    }

    fn row(&mut self, row: RowData<'_>) -> Result<(), Fault> {
        match self {
            Self::Empty(s) => s.row(row),
            Self::Object(s) => s.row(row),
            Self::Array(s) => s.row(row),
            Self::Custom(h) | Self::Model(h) => h.row(row),
        }
    }

    fn command_complete(&mut self, tag: &str, rows: u64) {
        match self {
            Self::Empty(s) => s.command_complete(tag, rows),
            Self::Object(s) => s.command_complete(tag, rows),
            Self::Array(s) => s.command_complete(tag, rows),
            Self::Custom(h) | Self::Model(h) => h.command_complete(tag, rows),
        }
    }

    fn end(&mut self, error: Option<&Fault>) {
        match self {
            Self::Empty(s) => s.end(error),
            Self::Object(s) => s.end(error),
            Self::Array(s) => s.end(error),
            Self::Custom(h) | Self::Model(h) => h.end(error),
        }
    }
}

struct Query {
    text: String,
    sink: Sink,
    /// `mask = single`: only the first row is handed to the sink; every row after it is
    /// dropped before parsing, not merely after.
    single: bool,
    rows_seen: u32,
    /// rows-affected as reported by this query's `CommandComplete` tag; `0` until then.
    /// carried onto this query's trace event as `row_count`.
    affected: u64,
}

/// a batch of queries submitted together on one client.
///
/// invariant: either every query carries no parameters (simple mode, any count ≥ 1) or there
/// is exactly one query and it owns `param_values` (extended/parameterized mode). `add()`
/// enforces this at construction time instead of leaving it to `submit()` to discover.
pub(crate) struct Command {
    /// process-unique id correlating this command's trace events; see `crate::next_id`.
    id: usize,
    text: String,
    param_values: Vec<Value>,
    queries: Vec<Query>,
    cursor: usize,
    canceled: Option<Fault>,
    log_query_text: LogQueryText,
}

fn command_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z]+)(?: (\d+))?(?: (\d+))?").unwrap())
}

fn parse_command_tag(tag: &str) -> (&str, u64) {
    match command_tag_re().captures(tag) {
        Some(caps) => {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or(tag);
            let rows = caps
                .get(3)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            (name, rows)
        }
        None => (tag, 0),
    }
}

impl Command {
    pub(crate) fn new(log_query_text: LogQueryText) -> Self {
        Self {
            id: super::next_id(),
            text: String::new(),
            param_values: Vec::new(),
            queries: Vec::new(),
            cursor: 0,
            canceled: None,
            log_query_text,
        }
    }

    /// append one query. `values` non-empty switches the whole command into parameterized
    /// mode and is only legal as the first and only query added.
    pub(crate) fn add(&mut self, text: &str, values: Vec<Value>, sink: Sink, single: bool) -> Result<(), Fault> {
        let text = normalize_query_text(text)?;
        if !values.is_empty() {
            if !self.queries.is_empty() {
                return Err(Fault::session("a parameterized command must contain exactly one query"));
            }
            self.param_values = values;
        } else if !self.param_values.is_empty() {
            return Err(Fault::session("a parameterized command must contain exactly one query"));
        }
        self.text.push_str(&text);
        self.queries.push(Query {
            text,
            sink,
            single,
            rows_seen: 0,
            affected: 0,
        });
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub(crate) fn is_parameterized(&self) -> bool {
        !self.param_values.is_empty()
    }

    /// resolve every sink with `fault` without ever touching the wire. used when client
    /// acquisition fails after queries were already staged on a command.
    pub(crate) fn abort(mut self, fault: Fault) {
        for q in &mut self.queries {
            q.sink.end(Some(&fault));
        }
    }

    /// encode and send this command on `client`, then drive the response until
    /// `ReadyForQuery`. returns `Err` only for failures that happen before any sink could be
    /// reached (encode failure, send failure); server-side `ErrorResponse`s are delivered to
    /// sinks via `end(Some(fault))` and do not surface here, matching the propagation policy:
    /// a command-level error is not the same as a submission failure.
    pub(crate) async fn submit(mut self, client: &Client) -> Result<(), Fault> {
        let submitted_at = Instant::now();

        let result = if self.is_parameterized() {
            self.submit_parameterized(client).await
        } else {
            self.submit_simple(client).await
        };

        let success = result.is_ok() && self.canceled.is_none();
        self.trace(submitted_at.elapsed(), success);
        result
    }

    /// one trace event per query, carrying this command's id, the query's text (per
    /// `log_query_text`), and the row count its `CommandComplete` reported.
    fn trace(&self, duration: Duration, success: bool) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let include_text =
            matches!(self.log_query_text, LogQueryText::Always) || (matches!(self.log_query_text, LogQueryText::OnError) && !success);
        for query in &self.queries {
            if include_text {
                debug!(
                    command_id = self.id,
                    text = %query.text,
                    duration_ms,
                    success,
                    row_count = query.affected,
                    "query resolved"
                );
            } else {
                debug!(command_id = self.id, duration_ms, success, row_count = query.affected, "query resolved");
            }
        }
    }

    async fn submit_simple(&mut self, client: &Client) -> Result<(), Fault> {
        let mut buf = BytesMut::new();
        frontend::query(&self.text, &mut buf).map_err(|e| Fault::query(Error::from(e)))?;
        let mut response = client.tx().send(buf).await.map_err(Fault::connection)?;
        self.drive(&mut response).await
    }

    /// encode Parse/Bind/Describe/Execute(unlimited)/Sync as one buffer and submit it as a
    /// single request.
    ///
    /// a request's `Response` is tied one-to-one to the queue entry the driver created for it:
    /// the driver always routes inbound messages to the front of its request queue and only
    /// advances that queue on `ReadyForQuery` (`driver::generic::GenericDriver::try_decode`).
    /// sending a follow-up `Sync` as its own `client.tx().send(..)` call would therefore queue
    /// a second, never-completed entry behind this one — so the whole extended-protocol
    /// sequence, `Sync` included, has to travel in the one buffer this command already sends.
    async fn submit_parameterized(&mut self, client: &Client) -> Result<(), Fault> {
        let mut buf = BytesMut::new();
        let text = self.queries[0].text.clone();

        frontend::parse("", &text, core::iter::empty(), &mut buf).map_err(|e| Fault::query(Error::from(e)))?;
        encode_bind(&self.param_values, &mut buf)?;
        frontend::describe(b'P', "", &mut buf).map_err(|e| Fault::query(Error::from(e)))?;
        frontend::execute("", 0, &mut buf).map_err(|e| Fault::query(Error::from(e)))?;
        frontend::sync(&mut buf);

        let mut response = client.tx().send(buf).await.map_err(Fault::connection)?;
        self.drive(&mut response).await
    }

    /// dispatch backend messages to the current query's sink until `ReadyForQuery`.
    async fn drive(&mut self, response: &mut super::driver::Response) -> Result<(), Fault> {
        let mut columns: Vec<ColumnInfo> = Vec::new();

        loop {
            match response.recv().await {
                Ok(backend::Message::RowDescription(body)) => {
                    if self.cursor >= self.queries.len() {
                        self.cancel(Fault::query(Error::multiple_statements()));
                        continue;
                    }
                    columns = body
                        .fields()
                        .map(|f| {
                            Ok(ColumnInfo {
                                name: f.name().to_string(),
                                type_oid: f.type_oid(),
                            })
                        })
                        .collect()
                        .map_err(|e: std::io::Error| Fault::ParseError(e.to_string()))?;
                    if self.canceled.is_none() {
                        self.queries[self.cursor].sink.row_description(&columns);
                    }
                }
                Ok(backend::Message::DataRow(body)) => {
                    if self.canceled.is_some() || self.cursor >= self.queries.len() {
                        continue;
                    }
                    let q = &mut self.queries[self.cursor];
                    if q.single && q.rows_seen > 0 {
                        // mask = single: subsequent rows are discarded without parsing.
                        continue;
                    }
                    q.rows_seen += 1;
                    let row = RowData::try_new(&columns, body)?;
                    if let Err(e) = self.queries[self.cursor].sink.row(row) {
                        self.cancel(e);
                    }
                }
                Ok(backend::Message::CommandComplete(body)) => {
                    let (tag, rows) = body
                        .tag()
                        .map(|t| parse_command_tag(t))
                        .unwrap_or(("", 0));
                    if self.cursor < self.queries.len() {
                        self.queries[self.cursor].affected = rows;
                        if self.canceled.is_none() {
                            self.queries[self.cursor].sink.command_complete(tag, rows);
                        }
                    }
                    self.cursor += 1;
                }
                Ok(backend::Message::EmptyQueryResponse) => {
                    self.cursor += 1;
                }
                Ok(backend::Message::ReadyForQuery(_)) => {
                    let fault = self.canceled.take();
                    for q in &mut self.queries {
                        q.sink.end(fault.as_ref());
                    }
                    return match fault {
                        Some(f) => Err(f),
                        None => Ok(()),
                    };
                }
                Ok(backend::Message::PortalSuspended)
                | Ok(backend::Message::CopyInResponse(_))
                | Ok(backend::Message::CopyOutResponse(_))
                | Ok(backend::Message::CopyBothResponse(_))
                | Ok(backend::Message::CopyData(_))
                | Ok(backend::Message::CopyDone) => {
                    self.cancel(Fault::query(Error::unexpected()));
                }
                Ok(_) => {}
                Err(e) => {
                    // the driver's request channel closed (stream termination, driver task
                    // gone) without a terminating `ReadyForQuery` ever arriving. once closed,
                    // `recv` keeps returning this error with no pending `.await`, so this has
                    // to be treated as terminal here instead of looping back around: a prior
                    // row/data-level cancellation (if any) is kept as the reported cause,
                    // otherwise this connection failure becomes it.
                    self.cancel(Fault::connection(e));
                    let fault = self.canceled.take();
                    for q in &mut self.queries {
                        q.sink.end(fault.as_ref());
                    }
                    return Err(fault.expect("cancel() just set it when it wasn't already set"));
                }
            }
        }
    }

    fn cancel(&mut self, fault: Fault) {
        if self.canceled.is_none() {
            self.canceled = Some(fault);
        }
    }
}

fn encode_bind(values: &[Value], buf: &mut BytesMut) -> Result<(), Fault> {
    let formats: Vec<i16> = values.iter().map(|v| v.to_bind_param().0).collect();
    let r = frontend::bind(
        "",
        "",
        formats,
        values.iter(),
        |v: &Value, buf: &mut BytesMut| -> Result<postgres_protocol::IsNull, Box<dyn std::error::Error + Sync + Send>> {
            match v.to_bind_param().1 {
                Some(bytes) => {
                    buf.extend_from_slice(&bytes);
                    Ok(postgres_protocol::IsNull::No)
                }
                None => Ok(postgres_protocol::IsNull::Yes),
            }
        },
        Some(0i16),
        buf,
    );
    match r {
        Ok(()) => Ok(()),
        Err(frontend::BindError::Conversion(e)) => Err(Fault::query(Error::from(e))),
        Err(frontend::BindError::Serialization(e)) => Err(Fault::query(Error::from(e))),
    }
}

/// verify non-empty, trim, and ensure a trailing `;` so queries can be concatenated for
/// simple-mode submission.
fn normalize_query_text(text: &str) -> Result<String, Fault> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Fault::session("query text must not be empty"));
    }
    if trimmed.ends_with(';') {
        Ok(format!("{trimmed} "))
    } else {
        Ok(format!("{trimmed}; "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_tag_parses_two_group_form() {
        assert_eq!(parse_command_tag("INSERT 0 3"), ("INSERT", 3));
    }

    #[test]
    fn command_tag_parses_one_group_form() {
        assert_eq!(parse_command_tag("SELECT 5"), ("SELECT", 5));
    }

    #[test]
    fn command_tag_defaults_rows_to_zero() {
        assert_eq!(parse_command_tag("BEGIN"), ("BEGIN", 0));
    }

    #[test]
    fn normalize_appends_missing_semicolon() {
        assert_eq!(normalize_query_text("select 1").unwrap(), "select 1; ");
    }

    #[test]
    fn normalize_rejects_blank_text() {
        assert!(normalize_query_text("   ").is_err());
    }

    #[test]
    fn add_rejects_a_second_query_after_a_parameterized_one() {
        let mut cmd = Command::new(LogQueryText::Never);
        let (sink, _rx) = Sink::empty();
        cmd.add("select $1", vec![Value::Int(1)], sink, false).unwrap();
        let (sink2, _rx2) = Sink::empty();
        assert!(cmd.add("select 2", Vec::new(), sink2, false).is_err());
    }

    #[test]
    fn add_rejects_parameters_after_a_non_parameterized_query() {
        let mut cmd = Command::new(LogQueryText::Never);
        let (sink, _rx) = Sink::empty();
        cmd.add("select 1", Vec::new(), sink, false).unwrap();
        let (sink2, _rx2) = Sink::empty();
        assert!(cmd.add("select $1", vec![Value::Int(1)], sink2, false).is_err());
    }
}
