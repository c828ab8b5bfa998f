use std::io;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value as Json, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::coalesce::{CallerPhase, Coalescer, Outcome};
use crate::engine::{Engine, EngineError};
use crate::invalidation::{Invalidator, InvalidatorError, InvalidatorId, Scope};
use crate::limits::MAX_LINE_LEN;
use crate::model::AvailabilityQuery;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::source::{InMemoryStore, SourceError};
use crate::sql::{self, Command, SqlError};

/// Replies buffered per connection before a slow reader drops notifications.
const OUTBOX: usize = 1024;

/// Which stream of availability work a coalescer slot belongs to. A
/// connection's own queries and the refreshes pushed to it never replace
/// each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Query,
    Refresh,
}

/// Everything connections share.
pub struct Server {
    engine: Arc<Engine>,
    store: Arc<InMemoryStore>,
    coalescer: Coalescer<(Ulid, Lane)>,
    look_ahead_days: u32,
}

impl Server {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<InMemoryStore>,
        debounce: Duration,
        look_ahead_days: u32,
    ) -> Self {
        Self {
            engine,
            store,
            coalescer: Coalescer::new(debounce),
            look_ahead_days,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

// ── Errors on the wire ───────────────────────────────────

struct Failure {
    code: &'static str,
    message: String,
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<SqlError> for Failure {
    fn from(e: SqlError) -> Self {
        Failure {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<SourceError> for Failure {
    fn from(e: SourceError) -> Self {
        let code = match e {
            SourceError::Unavailable(_) => "data_source_unavailable",
            SourceError::NotFound(_) => "not_found",
            SourceError::Invalid(_) => "invalid_query",
        };
        Failure {
            code,
            message: e.to_string(),
        }
    }
}

fn ok_line(seq: u64, command: &str, data: Json) -> String {
    json!({ "seq": seq, "ok": true, "command": command, "data": data }).to_string()
}

fn error_line(seq: u64, failure: &Failure) -> String {
    json!({ "seq": seq, "ok": false, "code": failure.code, "message": failure.message }).to_string()
}

fn scope_json(scope: &Scope) -> Json {
    match scope {
        Scope::All => json!({ "scope": "all" }),
        Scope::Service(id) => json!({ "scope": "service", "serviceId": id }),
        Scope::Dates {
            start,
            end,
            service_id,
        } => json!({ "scope": "dates", "start": start, "end": end, "serviceId": service_id }),
    }
}

fn record(command: &'static str, ok: bool, started: Instant) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(QUERIES_TOTAL, "command" => command, "status" => status).increment(1);
    metrics::histogram!(QUERY_DURATION_SECONDS, "command" => command)
        .record(started.elapsed().as_secs_f64());
}

// ── Connection ───────────────────────────────────────────

/// State shared between a connection's reader, its spawned queries, and its
/// `LISTEN` invalidator.
struct Peer {
    id: Ulid,
    tx: mpsc::Sender<String>,
    /// Last availability query delivered to this connection.
    displayed: Mutex<Option<AvailabilityQuery>>,
}

impl Peer {
    async fn send(&self, line: String) {
        if self.tx.send(line).await.is_err() {
            debug!("connection {} writer gone", self.id);
        }
    }

    fn displayed(&self) -> Option<AvailabilityQuery> {
        self.displayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_displayed(&self, query: AvailabilityQuery) {
        *self.displayed.lock().unwrap_or_else(PoisonError::into_inner) = Some(query);
    }
}

/// Pushes invalidations to a listening connection and re-runs the query it
/// is showing when that query's date and service were touched. No refresh is
/// started while the connection has a query of its own outstanding; that
/// query answers with fresh data instead.
struct ListenInvalidator {
    peer: Arc<Peer>,
    server: Weak<Server>,
}

impl Invalidator for ListenInvalidator {
    fn invalidate(&self, scope: &Scope) -> Result<(), InvalidatorError> {
        let mut note = scope_json(scope);
        note["notify"] = json!(sql::AVAILABILITY_CHANNEL);
        self.peer
            .tx
            .try_send(note.to_string())
            .map_err(|e| InvalidatorError(format!("connection {}: {e}", self.peer.id)))?;

        if let Some(query) = self.peer.displayed()
            && scope.covers(query.date, query.date, query.service_id)
            && let Some(server) = self.server.upgrade()
            && server.coalescer.phase(&(self.peer.id, Lane::Query)) == CallerPhase::Idle
            && tokio::runtime::Handle::try_current().is_ok()
        {
            spawn_availability(server, self.peer.clone(), None, query);
        }
        Ok(())
    }
}

/// Run `query` through the peer's coalescer on its own task. `seq` is the
/// request line being answered; `None` marks a refresh push. A request line
/// also abandons any refresh still pending for the peer, and only request
/// lines change what the peer is displaying.
fn spawn_availability(
    server: Arc<Server>,
    peer: Arc<Peer>,
    seq: Option<u64>,
    query: AvailabilityQuery,
) {
    let lane = match seq {
        Some(_) => {
            server.coalescer.cancel(&(peer.id, Lane::Refresh));
            Lane::Query
        }
        None => Lane::Refresh,
    };
    tokio::spawn(async move {
        let started = Instant::now();
        let command = "select_availability";
        let engine = server.engine.clone();
        let work_query = query.clone();
        let outcome = server
            .coalescer
            .request((peer.id, lane), move |token| async move {
                engine.get_availability_cancellable(&work_query, &token).await
            })
            .await;

        match outcome {
            Ok(Outcome::Delivered(Some(result))) => {
                record(command, true, started);
                let data = json!(&*result);
                let line = match seq {
                    Some(seq) => {
                        peer.set_displayed(query);
                        ok_line(seq, command, data)
                    }
                    None => json!({ "notify": "refresh", "data": data }).to_string(),
                };
                peer.send(line).await;
            }
            // Replaced by a newer query; the newer one answers.
            Ok(Outcome::Delivered(None)) | Ok(Outcome::Superseded) => {}
            Err(e) => {
                record(command, false, started);
                let failure = Failure::from(e);
                match seq {
                    Some(seq) => peer.send(error_line(seq, &failure)).await,
                    None => warn!("refresh for connection {} failed: {}", peer.id, failure.message),
                }
            }
        }
    });
}

struct Connection {
    server: Arc<Server>,
    peer: Arc<Peer>,
    listener: Option<InvalidatorId>,
}

impl Connection {
    async fn handle(&mut self, seq: u64, line: &str) {
        let started = Instant::now();
        let cmd = match sql::parse_sql(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                record("unparsed", false, started);
                self.peer.send(error_line(seq, &Failure::from(e))).await;
                return;
            }
        };

        let label = command_label(&cmd);
        let reply = match self.execute(seq, cmd).await {
            // Answered by the spawned query.
            Ok(None) => return,
            Ok(Some(data)) => {
                record(label, true, started);
                ok_line(seq, label, data)
            }
            Err(failure) => {
                record(label, false, started);
                error_line(seq, &failure)
            }
        };
        self.peer.send(reply).await;
    }

    /// `Ok(None)` means the reply is sent later by a spawned task.
    async fn execute(&mut self, seq: u64, cmd: Command) -> Result<Option<Json>, Failure> {
        let engine = &self.server.engine;
        let store = &self.server.store;
        let data: Result<Json, Failure> = match cmd {
            Command::SelectAvailability { query } => {
                spawn_availability(self.server.clone(), self.peer.clone(), Some(seq), query);
                return Ok(None);
            }
            Command::SelectNextAvailable { query } => {
                let slot = engine.next_available(&query).await?;
                Ok(json!({ "date": query.date, "slot": slot }))
            }
            Command::SelectBulk {
                dates,
                service_id,
                duration_minutes,
            } => {
                let days = engine
                    .get_bulk_availability(&dates, service_id, duration_minutes)
                    .await?;
                Ok(json!(&*days))
            }
            Command::SelectPreload {
                service_id,
                duration_minutes,
                days,
            } => {
                let today = chrono::Local::now().date_naive();
                let days = days.unwrap_or(self.server.look_ahead_days);
                let report = engine.preload(service_id, duration_minutes, days, today).await;
                Ok(json!(report))
            }
            Command::SelectCacheStats => {
                let stats = engine.cache_stats();
                Ok(json!({
                    "entries": stats.entries,
                    "hits": stats.hits,
                    "misses": stats.misses,
                    "invalidators": engine.bus().len(),
                    "bookings": store.booking_count(),
                }))
            }
            Command::SelectCacheKeys => Ok(json!(engine.cache_keys())),
            Command::InsertService(service) => {
                let id = service.id;
                store.upsert_service(service);
                Ok(json!({ "id": id }))
            }
            Command::InsertBookings(bookings) => {
                let mut applied = 0;
                for booking in bookings {
                    store.upsert_booking(booking)?;
                    applied += 1;
                }
                Ok(json!({ "rows": applied }))
            }
            Command::DeleteBooking { id } => {
                let booking = store.cancel_booking(id)?;
                Ok(json!(booking))
            }
            Command::DeleteCache { dates, service_id } => {
                let failed = match dates {
                    None => engine.bus().invalidate(None, service_id),
                    Some((start, end)) => engine.bus().invalidate_range(start, end, service_id),
                };
                Ok(json!({ "failedInvalidators": failed }))
            }
            Command::Listen => {
                if self.listener.is_none() {
                    let invalidator = Arc::new(ListenInvalidator {
                        peer: self.peer.clone(),
                        server: Arc::downgrade(&self.server),
                    });
                    let id = engine
                        .bus()
                        .register(invalidator)
                        .ok_or(EngineError::LimitExceeded("too many listeners"))?;
                    self.listener = Some(id);
                }
                Ok(json!({ "listening": true }))
            }
            Command::Unlisten => {
                if let Some(id) = self.listener.take() {
                    engine.bus().unregister(id);
                }
                Ok(json!({ "listening": false }))
            }
        };
        data.map(Some)
    }

    fn close(&mut self) {
        if let Some(id) = self.listener.take() {
            self.server.engine.bus().unregister(id);
        }
        self.server.coalescer.cancel(&(self.peer.id, Lane::Query));
        self.server.coalescer.cancel(&(self.peer.id, Lane::Refresh));
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            debug!("write failed: {e}");
            break;
        }
    }
}

/// Serve one client over the line protocol: one SQL statement per line in,
/// one JSON object per line out. Replies carry the statement's sequence
/// number; availability queries are answered asynchronously through the
/// connection's coalescer, so a reply can be skipped when a newer query
/// replaces it. After `LISTEN`, invalidation notices and refreshes of the
/// displayed query are pushed on the same stream.
pub async fn process_connection<S>(stream: S, server: Arc<Server>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (tx, rx) = mpsc::channel(OUTBOX);
    let writer = tokio::spawn(write_loop(FramedWrite::new(writer, LinesCodec::new()), rx));

    let peer = Arc::new(Peer {
        id: Ulid::new(),
        tx,
        displayed: Mutex::new(None),
    });
    let mut conn = Connection {
        server,
        peer,
        listener: None,
    };

    let mut seq = 0u64;
    let mut outcome = Ok(());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                seq += 1;
                let failure = Failure {
                    code: "syntax_error",
                    message: format!("line longer than {MAX_LINE_LEN} bytes"),
                };
                conn.peer.send(error_line(seq, &failure)).await;
                // The framed reader ends after a decode error.
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                outcome = Err(e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        seq += 1;
        conn.handle(seq, &line).await;
    }

    conn.close();
    drop(conn);
    // Flushes whatever is still queued once every sender is gone.
    if let Err(e) = writer.await {
        warn!("writer task failed: {e}");
    }
    outcome
}
