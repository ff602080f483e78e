use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::LessondAuthSource;
use crate::engine::{Admission, Engine, EngineError, LessonPatch};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::studio::StudioManager;

pub struct LessondHandler {
    studios: Arc<StudioManager>,
    query_parser: Arc<LessondQueryParser>,
}

impl LessondHandler {
    pub fn new(studios: Arc<StudioManager>) -> Self {
        Self {
            studios,
            query_parser: Arc::new(LessondQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.studios.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("studio error: {e}"),
            )))
        })
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertLesson {
                id,
                start,
                end,
                capacity,
                deadline_hours,
                status,
                details,
            } => {
                engine
                    .create_lesson(id, Span { start, end }, capacity, deadline_hours, status, details)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateLesson {
                id,
                start,
                end,
                capacity,
                deadline_hours,
                title,
                description,
                category,
                instructor,
                location,
                level,
            } => {
                let patch = LessonPatch {
                    start,
                    end,
                    max_capacity: capacity,
                    cancellation_deadline_hours: deadline_hours,
                    title,
                    description,
                    category,
                    instructor,
                    location,
                    level,
                };
                engine.update_lesson(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateLessonStatus { id, status } => {
                engine.set_lesson_status(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteLesson { id } => {
                engine.delete_lesson(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking { id, lesson_id, user_id } => {
                let admission = engine
                    .request_booking(id, lesson_id, user_id)
                    .await
                    .map_err(engine_err)?;

                // The admission outcome comes back as a row, RETURNING-style:
                // the caller needs to know seat vs. queue position.
                let schema = Arc::new(admission_schema());
                let (status, position) = match admission {
                    Admission::Confirmed => ("confirmed", None),
                    Admission::Waitlisted { position } => ("waitlisted", Some(position as i32)),
                };
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                encoder.encode_field(&status)?;
                encoder.encode_field(&position)?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::CancelBooking { id, reason } => {
                engine.cancel_booking(id, reason).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::MarkAttendance { ids, attended } => {
                let marked = engine
                    .mark_attendance(&ids, attended)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(marked))])
            }
            Command::Rollover { lesson_id } => {
                let rollover = engine
                    .rollover_for_next_week(lesson_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(rollover_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&rollover.successor_id.to_string())?;
                encoder.encode_field(&(rollover.completed as i32))?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::SelectLessons { start, end } => {
                let window = match (start, end) {
                    (Some(s), Some(e)) if s < e => Some(Span { start: s, end: e }),
                    _ => None,
                };
                let lessons = engine.list_lessons(window).await.map_err(engine_err)?;

                let schema = Arc::new(lessons_schema());
                let rows: Vec<PgWireResult<_>> = lessons
                    .into_iter()
                    .map(|l| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&l.id.to_string())?;
                        encoder.encode_field(&l.start)?;
                        encoder.encode_field(&l.end)?;
                        encoder.encode_field(&(l.max_capacity as i32))?;
                        encoder.encode_field(&(l.cancellation_deadline_hours as i32))?;
                        encoder.encode_field(&l.status.as_str())?;
                        encoder.encode_field(&l.title)?;
                        encoder.encode_field(&(l.active_count as i32))?;
                        encoder.encode_field(&(l.waitlist_len as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { lesson_id, user_id } => {
                let bookings = match (lesson_id, user_id) {
                    (Some(lid), _) => engine.get_bookings(lid).await.map_err(engine_err)?,
                    (None, Some(uid)) => {
                        engine.get_bookings_for_user(uid).await.map_err(engine_err)?
                    }
                    (None, None) => vec![],
                };
                let filtered: Vec<BookingRow> = bookings
                    .into_iter()
                    .filter(|b| user_id.is_none_or(|uid| b.user_id == uid))
                    .collect();

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = filtered
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.lesson_id.to_string())?;
                        encoder.encode_field(&b.user_id.to_string())?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.waitlisted)?;
                        encoder.encode_field(&b.position.map(|p| p as i32))?;
                        encoder.encode_field(&b.booked_at)?;
                        encoder.encode_field(&b.cancelled_at)?;
                        encoder.encode_field(&b.cancellation_reason.map(|r| r.as_str()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectWaitlist { lesson_id } => {
                let queue = engine.get_waitlist(lesson_id).await.map_err(engine_err)?;

                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = queue
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.booking_id.to_string())?;
                        encoder.encode_field(&w.lesson_id.to_string())?;
                        encoder.encode_field(&w.user_id.to_string())?;
                        encoder.encode_field(&(w.position as i32))?;
                        encoder.encode_field(&w.booked_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectStats => {
                let stats = engine.booking_stats().await.map_err(engine_err)?;

                let schema = Arc::new(stats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.total as i64))?;
                encoder.encode_field(&(stats.confirmed as i64))?;
                encoder.encode_field(&(stats.pending as i64))?;
                encoder.encode_field(&(stats.cancelled as i64))?;
                encoder.encode_field(&(stats.completed as i64))?;
                encoder.encode_field(&(stats.no_show as i64))?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn int4_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn admission_schema() -> Vec<FieldInfo> {
    vec![text_field("booking_id"), text_field("status"), int4_field("position")]
}

fn rollover_schema() -> Vec<FieldInfo> {
    vec![text_field("successor_id"), int4_field("completed")]
}

fn lessons_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int8_field("start"),
        int8_field("end"),
        int4_field("capacity"),
        int4_field("deadline_hours"),
        text_field("status"),
        text_field("title"),
        int4_field("active_count"),
        int4_field("waitlist_len"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("lesson_id"),
        text_field("user_id"),
        text_field("status"),
        bool_field("waitlisted"),
        int4_field("position"),
        int8_field("booked_at"),
        int8_field("cancelled_at"),
        text_field("reason"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id"),
        text_field("lesson_id"),
        text_field("user_id"),
        int4_field("position"),
        int8_field("booked_at"),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        int8_field("total"),
        int8_field("confirmed"),
        int8_field("pending"),
        int8_field("cancelled"),
        int8_field("completed"),
        int8_field("no_show"),
    ]
}

/// Result schema for a statement, best-effort from its text. Used by both
/// Describe paths of the extended protocol.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("ROLLOVER") {
        rollover_schema()
    } else if upper.contains("INSERT") && upper.contains("BOOKINGS") {
        admission_schema()
    } else if upper.contains("SELECT") && upper.contains("BOOKING_STATS") {
        stats_schema()
    } else if upper.contains("SELECT") && upper.contains("WAITLIST") {
        waitlist_schema()
    } else if upper.contains("SELECT") && upper.contains("LESSONS") {
        lessons_schema()
    } else if upper.contains("SELECT") && upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for LessondHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LessondQueryParser;

#[async_trait]
impl QueryParser for LessondQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LessondHandler {
    type Statement = String;
    type QueryParser = LessondQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder appearing in the statement text.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0
            && let Ok(n) = rest[..digits].parse::<usize>() {
                max = max.max(n);
            }
    }
    max
}

/// Inline the portal's bound parameters (text format) over their `$N`
/// placeholders. Highest index first, so `$12` is never clobbered by `$1`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LessondFactory {
    handler: Arc<LessondHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LessondAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LessondFactory {
    pub fn new(studios: Arc<StudioManager>, password: String) -> Self {
        let auth_source = LessondAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LessondHandler::new(studios)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LessondFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Drive one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    studios: Arc<StudioManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = LessondFactory::new(studios, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    // ConcurrentConflict is the one retryable failure; serialization_failure
    // tells drivers exactly that.
    let code = match e {
        EngineError::ConcurrentConflict => "40001",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
