use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::GuestDirectory;
use crate::config::Credentials;
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, BookingInsert, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = InnkeepFactory::new(tenant_manager, credentials);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

pub struct InnkeepHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    /// The property engine this session works against, named by its database.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let property = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&property).map_err(|e| {
            user_error("08006", format!("property {property} unavailable: {e}"))
        })
    }

    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let user = session_user(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &user, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        user: &str,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRoom { id, name, total_units, price_per_night, discount } => {
                engine
                    .create_room(id, name, total_units, price_per_night, discount)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking { booking, returning } => {
                let req = booking_request(booking, user)?;
                let reservation = engine.admit_booking(req).await.map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(bookings_schema(format));
                    let rows = vec![encode_booking(&schema, &reservation)];
                    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectAvailability { room_id, checkin, checkout } => {
                let snapshot = engine
                    .compute_availability(room_id, checkin, checkout)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&room_id.to_string())?;
                encoder.encode_field(&i64::from(snapshot.available_quantity))?;
                encoder.encode_field(&i64::from(snapshot.total_quantity))?;
                encoder.encode_field(&i64::from(snapshot.committed_quantity))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBlockedDates { room_id, from, to } => {
                let nights = engine
                    .fully_booked_dates(room_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blocked_dates_schema(format));
                let room = room_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = nights
                    .into_iter()
                    .map(|night| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room)?;
                        encoder.encode_field(&night.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRooms { stay: None } => {
                let rooms = engine.list_rooms().await;
                let schema = Arc::new(rooms_schema(format, false));
                let rows: Vec<_> = rooms
                    .iter()
                    .map(|info| encode_room(&schema, info, None))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRooms { stay: Some((checkin, checkout)) } => {
                let rooms = engine
                    .list_rooms_for_stay(checkin, checkout)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(rooms_schema(format, true));
                let rows: Vec<_> = rooms
                    .iter()
                    .map(|(info, snapshot)| encode_room(&schema, info, Some(snapshot)))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { filter } => {
                let reservations = match filter {
                    BookingFilter::Room(room_id) => {
                        engine.reservations_for_room(room_id).await.map_err(engine_err)?
                    }
                    BookingFilter::Guest(guest) => {
                        if guest != user {
                            return Err(engine_err(EngineError::Unauthorized));
                        }
                        engine.reservations_by_guest(&guest).await
                    }
                    BookingFilter::Id(id) => match engine.get_reservation(id).await {
                        Ok(r) => vec![r],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                let schema = Arc::new(bookings_schema(format));
                let rows: Vec<_> = reservations
                    .iter()
                    .map(|r| encode_booking(&schema, r))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

/// Authenticated user name of the session; bookings are made under it.
fn session_user<C: ClientInfo>(client: &C) -> PgWireResult<String> {
    client
        .metadata()
        .get("user")
        .filter(|u| !u.is_empty())
        .cloned()
        .ok_or_else(|| engine_err(EngineError::Unauthorized))
}

fn booking_request(booking: BookingInsert, user: &str) -> PgWireResult<BookingRequest> {
    if let Some(claimed) = &booking.created_by
        && claimed != user
    {
        return Err(engine_err(EngineError::Unauthorized));
    }
    Ok(BookingRequest {
        id: booking.id,
        room_id: booking.room_id,
        checkin: booking.checkin,
        checkout: booking.checkout,
        quantity: booking.quantity,
        created_by: user.to_string(),
        guests: booking.guests,
    })
}

// ── Result schemas ──────────────────────────────────────

fn field(format: &Format, idx: usize, name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, format.format_for(idx))
}

fn fields(format: &Format, columns: &[(&str, Type)]) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| field(format, idx, name, ty.clone()))
        .collect()
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("room_id", Type::VARCHAR),
            ("available_quantity", Type::INT8),
            ("total_quantity", Type::INT8),
            ("committed_quantity", Type::INT8),
        ],
    )
}

fn blocked_dates_schema(format: &Format) -> Vec<FieldInfo> {
    fields(format, &[("room_id", Type::VARCHAR), ("night", Type::VARCHAR)])
}

fn rooms_schema(format: &Format, with_availability: bool) -> Vec<FieldInfo> {
    let mut columns = vec![
        ("id", Type::VARCHAR),
        ("name", Type::VARCHAR),
        ("total_units", Type::INT8),
        ("price_per_night", Type::INT8),
        ("discount", Type::INT8),
    ];
    if with_availability {
        columns.push(("available_quantity", Type::INT8));
    }
    fields(format, &columns)
}

fn bookings_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("checkin", Type::VARCHAR),
            ("checkout", Type::VARCHAR),
            ("quantity", Type::INT8),
            ("created_by", Type::VARCHAR),
            ("adults", Type::INT8),
            ("children", Type::INT8),
            ("total_price", Type::INT8),
            ("discount", Type::INT8),
        ],
    )
}

fn schema_for(shape: ResultShape, format: &Format) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Availability => availability_schema(format),
        ResultShape::BlockedDates => blocked_dates_schema(format),
        ResultShape::Rooms { with_availability } => rooms_schema(format, with_availability),
        ResultShape::Bookings => bookings_schema(format),
        ResultShape::NoRows => vec![],
    }
}

fn encode_room(
    schema: &Arc<Vec<FieldInfo>>,
    info: &RoomInfo,
    snapshot: Option<&AvailabilitySnapshot>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&info.id.to_string())?;
    encoder.encode_field(&info.name)?;
    encoder.encode_field(&i64::from(info.total_units))?;
    encoder.encode_field(&info.price_per_night)?;
    encoder.encode_field(&i64::from(info.discount))?;
    if let Some(snapshot) = snapshot {
        encoder.encode_field(&i64::from(snapshot.available_quantity))?;
    }
    Ok(encoder.take_row())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, r: &Reservation) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&r.stay.checkin.to_string())?;
    encoder.encode_field(&r.stay.checkout.to_string())?;
    encoder.encode_field(&i64::from(r.quantity))?;
    encoder.encode_field(&r.created_by)?;
    encoder.encode_field(&i64::from(r.guests.adults))?;
    encoder.encode_field(&i64::from(r.guests.children))?;
    encoder.encode_field(&r.guests.total_price)?;
    encoder.encode_field(&i64::from(r.guests.discount))?;
    Ok(encoder.take_row())
}

// ── Simple query protocol ───────────────────────────────

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended query protocol ─────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(schema_for(sql::result_shape(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql, &portal.result_column_format).await
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
        let schema = schema_for(sql::result_shape(&target.statement), &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let shape = sql::result_shape(&target.statement.statement);
        Ok(DescribePortalResponse::new(schema_for(
            shape,
            &target.result_column_format,
        )))
    }
}

/// Highest `$n` placeholder in `sql`.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(i + 1);
    }
    max
}

/// Replace `$1..$n` with bound text parameters as quoted literals in a single
/// pass over `sql`. Substituted text is never rescanned; a `$n` inside a string
/// literal of the statement, or without a bound value, is left as written.
fn substitute_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let bytes = sql.as_bytes();
    let mut result = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = bound {
                    result.push_str(&sql[copied..i]);
                    match param {
                        Some(value) => {
                            let text = String::from_utf8_lossy(value.as_ref());
                            result.push('\'');
                            result.push_str(&text.replace('\'', "''"));
                            result.push('\'');
                        }
                        None => result.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Errors ──────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::TooLong => "54000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

// ── Factory ─────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<GuestDirectory, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, credentials: Credentials) -> Self {
        Self {
            handler: Arc::new(InnkeepHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                GuestDirectory::new(credentials),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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
