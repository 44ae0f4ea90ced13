use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user.
#[derive(Debug)]
pub struct TimetableAuthSource {
    password: String,
}

impl TimetableAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TimetableAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct TimetableHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TimetableQueryParser>,
}

impl TimetableHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TimetableQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBooking { booking, returning } => {
                let booking = engine.create_booking(booking).await.map_err(engine_err)?;
                affected("INSERT", booking, returning)
            }
            Command::UpdateBooking {
                id,
                changes,
                returning,
            } => {
                let booking = engine.update_booking(id, changes).await.map_err(engine_err)?;
                affected("UPDATE", booking, returning)
            }
            Command::DeleteBooking { id, returning } => {
                let booking = engine.delete_booking(id).await.map_err(engine_err)?;
                affected("DELETE", booking, returning)
            }
            Command::SelectBookings(filter) => {
                let bookings = engine.list_bookings(&filter).await.map_err(engine_err)?;
                bookings_response(&bookings)
            }
            Command::SelectWeekdays => {
                Ok(names_response(Weekday::ALL.iter().map(|d| d.as_str())))
            }
            Command::SelectClassKinds => {
                Ok(names_response(ClassKind::ALL.iter().map(|k| k.as_str())))
            }
        }
    }
}

/// Command tag for a single-row write, or the row itself under `RETURNING`.
fn affected(tag: &str, booking: Booking, returning: bool) -> PgWireResult<Response> {
    if returning {
        bookings_response(std::slice::from_ref(&booking))
    } else {
        Ok(Response::Execution(Tag::new(tag).with_rows(1)))
    }
}

fn bookings_schema() -> Vec<FieldInfo> {
    let col = |name: &str, ty: Type| FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text);
    vec![
        col("id", Type::VARCHAR),
        col("room_id", Type::INT8),
        col("course_id", Type::INT8),
        col("instructor_id", Type::INT8),
        col("academic_unit_id", Type::INT8),
        col("weekday", Type::VARCHAR),
        col("start_time", Type::VARCHAR),
        col("end_time", Type::VARCHAR),
        col("class_kind", Type::VARCHAR),
        col("created_at", Type::INT8),
        col("updated_at", Type::INT8),
    ]
}

fn names_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "name".into(),
        None,
        None,
        Type::VARCHAR,
        FieldFormat::Text,
    )]
}

/// Identifiers are stored unsigned but travel as BIGINT.
fn bigint(v: u64) -> PgWireResult<i64> {
    i64::try_from(v).map_err(|_| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22003".into(),
            format!("{v} out of BIGINT range"),
        )))
    })
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&bigint(b.room_id)?)?;
    encoder.encode_field(&bigint(b.course_id)?)?;
    encoder.encode_field(&bigint(b.instructor_id)?)?;
    encoder.encode_field(&bigint(b.academic_unit_id)?)?;
    encoder.encode_field(&b.window.weekday.as_str())?;
    encoder.encode_field(&b.window.start.to_string())?;
    encoder.encode_field(&b.window.end.to_string())?;
    encoder.encode_field(&b.kind.as_str())?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    Ok(encoder.take_row())
}

fn bookings_response(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<DataRow>> = bookings
        .iter()
        .map(|b| encode_booking(&schema, b))
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn names_response<'a>(names: impl Iterator<Item = &'a str>) -> Response {
    let schema = Arc::new(names_schema());
    let rows: Vec<PgWireResult<DataRow>> = names
        .map(|name| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") || (upper.contains("SELECT") && upper.contains("BOOKINGS")) {
        bookings_schema()
    } else if upper.contains("SELECT")
        && (upper.contains("WEEKDAYS") || upper.contains("CLASS_KINDS"))
    {
        names_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TimetableHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TimetableQueryParser;

#[async_trait]
impl QueryParser for TimetableQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TimetableHandler {
    type Statement = String;
    type QueryParser = TimetableQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

/// Single left-to-right pass over the statement text. Placeholders inside
/// quoted literals or identifiers are left alone, and substituted values are
/// never scanned again. Indexes with no bound value stay as written.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), _) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '$') => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match bound {
                    Some(param) => out.push_str(&param_literal(*param)),
                    None => out.push_str(&sql[i..end]),
                }
            }
            (None, _) => out.push(c),
        }
    }
    out
}

fn param_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TimetableFactory {
    handler: Arc<TimetableHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TimetableAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TimetableFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TimetableAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TimetableHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TimetableFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(TimetableFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine rejection.
pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Parse(_) => "22007",
        EngineError::InvalidWindow(_) => "23514",
        EngineError::RoomConflict { .. } | EngineError::InstructorConflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Busy => "55P03",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageUnavailable(_) => "58000",
    }
}

/// SQLSTATE for a statement the parser refused.
pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Literal(_) => "22007",
        SqlError::TooLong(_) => "54000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sql_sqlstate(&e).into(),
        e.to_string(),
    )))
}
