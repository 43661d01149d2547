use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// One row of `INSERT INTO bookings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInsert {
    pub id: Option<Ulid>,
    pub room_id: Ulid,
    pub checkin: Night,
    pub checkout: Night,
    pub quantity: u32,
    /// Must match the session user when present.
    pub created_by: Option<String>,
    pub guests: GuestDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Room(Ulid),
    Guest(String),
    Id(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        discount: u8,
    },
    InsertBooking {
        booking: BookingInsert,
        returning: bool,
    },
    SelectAvailability {
        room_id: Ulid,
        checkin: Night,
        checkout: Night,
    },
    SelectBlockedDates {
        room_id: Ulid,
        from: Option<Night>,
        to: Option<Night>,
    },
    SelectRooms {
        stay: Option<(Night, Night)>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
}

const ROOM_COLUMNS: &[&str] = &["id", "name", "total_units", "price_per_night", "discount"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "room_id",
    "checkin",
    "checkout",
    "quantity",
    "created_by",
    "adults",
    "children",
    "total_price",
    "discount",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(statement_kind(other))),
    }
}

fn statement_kind(stmt: &Statement) -> String {
    let text = stmt.to_string();
    text.split_whitespace().next().unwrap_or("statement").to_uppercase()
}

/// Columns a statement returns, known before parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Availability,
    BlockedDates,
    Rooms { with_availability: bool },
    Bookings,
    NoRows,
}

/// Result shape of a possibly parameterized statement. Used to describe
/// prepared statements; unparseable text describes as no columns.
pub fn result_shape(sql: &str) -> ResultShape {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return ResultShape::NoRows;
    };
    match stmts.first() {
        Some(Statement::Query(query)) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::NoRows;
            };
            let table = select.from.first().and_then(|from| match &from.relation {
                TableFactor::Table { name, .. } => object_name_last(name),
                _ => None,
            });
            match table.as_deref() {
                Some("availability") => ResultShape::Availability,
                Some("blocked_dates") => ResultShape::BlockedDates,
                Some("rooms") => ResultShape::Rooms {
                    with_availability: select.selection.is_some(),
                },
                Some("bookings") => ResultShape::Bookings,
                _ => ResultShape::NoRows,
            }
        }
        Some(Statement::Insert(insert))
            if insert.returning.is_some() && insert_table(insert).as_deref() == Some("bookings") =>
        {
            ResultShape::Bookings
        }
        _ => ResultShape::NoRows,
    }
}

// ── INSERT ──────────────────────────────────────────────

/// Column name → value for the single VALUES row, in declared or canonical order.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied().filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn insert_row<'a>(insert: &'a ast::Insert, allowed: &[&str]) -> Result<Row<'a>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let rows = match source.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Unsupported("INSERT ... SELECT".into())),
    };
    let row = match rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        allowed.iter().take(row.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }

    let mut values = HashMap::with_capacity(columns.len());
    for (column, expr) in columns.into_iter().zip(row) {
        if !allowed.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        if values.insert(column.clone(), expr).is_some() {
            return Err(SqlError::Parse(format!("column {column} given twice")));
        }
    }
    Ok(Row { values })
}

fn insert_table(insert: &ast::Insert) -> Option<String> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table(insert)
        .ok_or_else(|| SqlError::Parse("unsupported table in INSERT".into()))?;

    match table.as_str() {
        "rooms" => {
            let row = insert_row(insert, ROOM_COLUMNS)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(row.require("id")?)?,
                name: row.get("name").map(parse_string).transpose()?,
                total_units: parse_u32(row.require("total_units")?)?,
                price_per_night: row.get("price_per_night").map(parse_i64).transpose()?.unwrap_or(0),
                discount: row.get("discount").map(parse_percent).transpose()?.unwrap_or(0),
            })
        }
        "bookings" => {
            let row = insert_row(insert, BOOKING_COLUMNS)?;
            let defaults = GuestDetails::default();
            let booking = BookingInsert {
                id: row.get("id").map(parse_ulid).transpose()?,
                room_id: parse_ulid(row.require("room_id")?)?,
                checkin: parse_date(row.require("checkin")?)?,
                checkout: parse_date(row.require("checkout")?)?,
                quantity: parse_u32(row.require("quantity")?)?,
                created_by: row.get("created_by").map(parse_string).transpose()?,
                guests: GuestDetails {
                    adults: row.get("adults").map(parse_u32).transpose()?.unwrap_or(defaults.adults),
                    children: row.get("children").map(parse_u32).transpose()?.unwrap_or(defaults.children),
                    total_price: row.get("total_price").map(parse_i64).transpose()?.unwrap_or(defaults.total_price),
                    discount: row.get("discount").map(parse_percent).transpose()?.unwrap_or(defaults.discount),
                },
            };
            Ok(Command::InsertBooking {
                booking,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// `column <op> value`, one conjunct of a WHERE clause.
struct Predicate<'a> {
    column: String,
    op: CmpOp,
    value: &'a Expr,
}

/// Flatten an AND-tree of simple comparisons. Anything else is unsupported.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => CmpOp::Eq,
                BinaryOperator::Lt => CmpOp::Lt,
                BinaryOperator::LtEq => CmpOp::LtEq,
                BinaryOperator::Gt => CmpOp::Gt,
                BinaryOperator::GtEq => CmpOp::GtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Predicate { column, op, value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

struct Filters<'a> {
    table: &'static str,
    predicates: Vec<Predicate<'a>>,
}

impl<'a> Filters<'a> {
    fn new(table: &'static str, selection: Option<&'a Expr>, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut predicates)?;
        }
        if let Some(p) = predicates.iter().find(|p| !allowed.contains(&p.column.as_str())) {
            return Err(SqlError::UnknownColumn(p.column.clone()));
        }
        Ok(Self { table, predicates })
    }

    fn find(&self, column: &str, op: CmpOp) -> Option<&'a Expr> {
        self.predicates
            .iter()
            .find(|p| p.column == column && p.op == op)
            .map(|p| p.value)
    }

    fn eq(&self, column: &'static str) -> Option<&'a Expr> {
        self.find(column, CmpOp::Eq)
    }

    fn require_eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(self.table, column))
    }

    /// Every predicate must be one this table understands with this operator.
    fn only(&self, accepted: &[(&str, CmpOp)]) -> Result<(), SqlError> {
        match self
            .predicates
            .iter()
            .find(|p| !accepted.contains(&(p.column.as_str(), p.op)))
        {
            Some(p) => Err(SqlError::Unsupported(format!(
                "{} filter on {} with {:?}",
                self.table, p.column, p.op
            ))),
            None => Ok(()),
        }
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("compound query".into())),
    };
    let from = match select.from.as_slice() {
        [from] if from.joins.is_empty() => from,
        [] => return Err(SqlError::Parse("SELECT without FROM".into())),
        _ => return Err(SqlError::Unsupported("joins".into())),
    };
    let table = match &from.relation {
        TableFactor::Table { name, .. } => object_name_last(name),
        _ => None,
    }
    .ok_or_else(|| SqlError::Parse("complex table expression".into()))?;
    let selection = select.selection.as_ref();

    match table.as_str() {
        "availability" => {
            let f = Filters::new("availability", selection, &["room_id", "checkin", "checkout"])?;
            f.only(&[("room_id", CmpOp::Eq), ("checkin", CmpOp::Eq), ("checkout", CmpOp::Eq)])?;
            Ok(Command::SelectAvailability {
                room_id: parse_ulid(f.require_eq("room_id")?)?,
                checkin: parse_date(f.require_eq("checkin")?)?,
                checkout: parse_date(f.require_eq("checkout")?)?,
            })
        }
        "blocked_dates" => {
            let f = Filters::new("blocked_dates", selection, &["room_id", "night"])?;
            f.only(&[("room_id", CmpOp::Eq), ("night", CmpOp::GtEq), ("night", CmpOp::Lt), ("night", CmpOp::LtEq)])?;
            let to = match (f.find("night", CmpOp::Lt), f.find("night", CmpOp::LtEq)) {
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("two upper bounds on night".into()));
                }
                (Some(end), None) => Some(parse_date(end)?),
                (None, Some(last)) => Some(
                    parse_date(last)?
                        .succ_opt()
                        .ok_or_else(|| SqlError::Parse("night out of range".into()))?,
                ),
                (None, None) => None,
            };
            Ok(Command::SelectBlockedDates {
                room_id: parse_ulid(f.require_eq("room_id")?)?,
                from: f.find("night", CmpOp::GtEq).map(parse_date).transpose()?,
                to,
            })
        }
        "rooms" => {
            let f = Filters::new("rooms", selection, &["checkin", "checkout"])?;
            f.only(&[("checkin", CmpOp::Eq), ("checkout", CmpOp::Eq)])?;
            let stay = match (f.eq("checkin"), f.eq("checkout")) {
                (Some(checkin), Some(checkout)) => Some((parse_date(checkin)?, parse_date(checkout)?)),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("rooms", "checkout")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("rooms", "checkin")),
            };
            Ok(Command::SelectRooms { stay })
        }
        "bookings" => {
            let f = Filters::new("bookings", selection, &["id", "room_id", "created_by"])?;
            f.only(&[("id", CmpOp::Eq), ("room_id", CmpOp::Eq), ("created_by", CmpOp::Eq)])?;
            if f.predicates.len() != 1 {
                return Err(SqlError::Unsupported(
                    "bookings need exactly one of id, room_id or created_by".into(),
                ));
            }
            let filter = if let Some(id) = f.eq("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(room) = f.eq("room_id") {
                BookingFilter::Room(parse_ulid(room)?)
            } else {
                BookingFilter::Guest(parse_string(f.require_eq("created_by")?)?)
            };
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Values ──────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// The literal behind `expr`, looking through `::type` casts.
fn literal(expr: &Expr) -> Result<&Value, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Ok(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(expr),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(literal(expr), Ok(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match literal(expr)? {
        Value::SingleQuotedString(s) => Ok(s.clone()),
        other => Err(SqlError::Parse(format!("expected a string, got {other}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

/// ISO `YYYY-MM-DD`, or a timestamp cut down to the calendar date it names.
/// An RFC 3339 offset is kept as written, so `2024-06-01T23:30:00-05:00` is June 1.
fn parse_date(expr: &Expr) -> Result<Night, SqlError> {
    let s = parse_string(expr)?;
    to_night(s.trim()).ok_or_else(|| SqlError::Parse(format!("bad date '{s}', expected YYYY-MM-DD")))
}

fn to_night(s: &str) -> Option<Night> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|ts| ts.date())
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: UnaryOperator::Minus, expr } = expr {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()));
    }
    match literal(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .trim()
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad integer '{s}'"))),
        other => Err(SqlError::Parse(format!("expected a number, got {other}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a non-negative 32-bit integer")))
}

/// 0..=100. Out-of-range values are left to the engine to reject.
fn parse_percent(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a percentage")))
}

// ── Errors ──────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    MissingFilter(&'static str, &'static str),
    WrongArity(usize, usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong => write!(f, "query too long"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing value for column {c}"),
            SqlError::MissingFilter(t, c) => write!(f, "{t} requires a filter on {c}"),
            SqlError::WrongArity(columns, values) => {
                write!(f, "{columns} columns but {values} values")
            }
        }
    }
}

impl std::error::Error for SqlError {}
