use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_BULK_DATES;
use crate::model::*;

/// The only channel `LISTEN` accepts.
pub const AVAILABILITY_CHANNEL: &str = "availability";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        query: AvailabilityQuery,
    },
    SelectNextAvailable {
        query: AvailabilityQuery,
    },
    SelectBulk {
        dates: Vec<NaiveDate>,
        service_id: Option<Ulid>,
        duration_minutes: u32,
    },
    SelectPreload {
        service_id: Option<Ulid>,
        duration_minutes: u32,
        days: Option<u32>,
    },
    SelectCacheStats,
    SelectCacheKeys,
    InsertService(ServiceRecord),
    /// Upsert by id: create, reschedule, or change status.
    InsertBookings(Vec<BookingRecord>),
    DeleteBooking {
        id: Ulid,
    },
    /// Explicit invalidation. No filter clears everything.
    DeleteCache {
        dates: Option<(NaiveDate, NaiveDate)>,
        service_id: Option<Ulid>,
    },
    Listen,
    Unlisten,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if let Some(channel) = upper.strip_prefix("UNLISTEN ") {
        return listen_channel(channel).map(|_| Command::Unlisten);
    }
    if let Some(channel) = upper.strip_prefix("LISTEN ") {
        return listen_channel(channel).map(|_| Command::Listen);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn listen_channel(channel: &str) -> Result<(), SqlError> {
    let channel = channel.trim().to_lowercase();
    if channel == AVAILABILITY_CHANNEL {
        Ok(())
    } else {
        Err(SqlError::Unsupported(format!("channel {channel}")))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "services" => {
            let values = &rows[0];
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            Ok(Command::InsertService(ServiceRecord {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string_expr(&values[1])?,
                base_price: parse_price(&values[2])?,
                price_per_hour: parse_price(&values[3])?,
            }))
        }
        "bookings" => {
            let mut bookings = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let booking = parse_booking_row(row).map_err(|e| match e {
                    SqlError::Parse(msg) if rows.len() > 1 => SqlError::Parse(format!("row {i}: {msg}")),
                    other => other,
                })?;
                bookings.push(booking);
            }
            Ok(Command::InsertBookings(bookings))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, service_id, date, start, "end"[, status])`
fn parse_booking_row(row: &[Expr]) -> Result<BookingRecord, SqlError> {
    if row.len() < 5 {
        return Err(SqlError::WrongArity("bookings", 5, row.len()));
    }
    let status = match row.get(5) {
        Some(expr) => {
            let s = parse_string_expr(expr)?;
            BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?
        }
        None => BookingStatus::Confirmed,
    };
    Ok(BookingRecord {
        id: parse_ulid_expr(&row[0])?,
        service_id: parse_ulid_expr(&row[1])?,
        date: parse_date_expr(&row[2])?,
        start: parse_time_expr(&row[3])?,
        end: parse_time_expr(&row[4])?,
        status,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "cache" => {
            let dates = match filters.date {
                None => None,
                Some(DateFilter::One(d)) => Some((d, d)),
                Some(DateFilter::Range(a, b)) => Some((a.min(b), a.max(b))),
                Some(DateFilter::List(_)) => {
                    return Err(SqlError::Unsupported("date IN (...) on cache".into()));
                }
            };
            Ok(Command::DeleteCache {
                dates,
                service_id: filters.service_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            query: filters.single_query()?,
        }),
        "next_available" => Ok(Command::SelectNextAvailable {
            query: filters.single_query()?,
        }),
        "bulk_availability" => {
            let dates = match filters.date.take() {
                Some(DateFilter::One(d)) => vec![d],
                Some(DateFilter::List(dates)) => dates,
                Some(DateFilter::Range(a, b)) => {
                    let (first, last) = (a.min(b), a.max(b));
                    // One past the limit so the engine reports it.
                    first
                        .iter_days()
                        .take_while(|d| *d <= last)
                        .take(MAX_BULK_DATES + 1)
                        .collect()
                }
                None => return Err(SqlError::MissingFilter("date")),
            };
            Ok(Command::SelectBulk {
                dates,
                service_id: filters.service_id,
                duration_minutes: filters.duration()?,
            })
        }
        "preload" => Ok(Command::SelectPreload {
            service_id: filters.service_id,
            duration_minutes: filters.duration()?,
            days: filters.days,
        }),
        "cache_stats" => Ok(Command::SelectCacheStats),
        "cache_keys" => Ok(Command::SelectCacheKeys),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum DateFilter {
    One(NaiveDate),
    List(Vec<NaiveDate>),
    Range(NaiveDate, NaiveDate),
}

#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    date: Option<DateFilter>,
    service_id: Option<Ulid>,
    duration_minutes: Option<u32>,
    exclude_booking_id: Option<Ulid>,
    days: Option<u32>,
}

impl Filters {
    fn duration(&self) -> Result<u32, SqlError> {
        self.duration_minutes.ok_or(SqlError::MissingFilter("duration"))
    }

    fn single_query(&self) -> Result<AvailabilityQuery, SqlError> {
        let date = match &self.date {
            Some(DateFilter::One(d)) => *d,
            Some(_) => return Err(SqlError::Unsupported("expected date = '...'".into())),
            None => return Err(SqlError::MissingFilter("date")),
        };
        Ok(AvailabilityQuery {
            date,
            service_id: self.service_id,
            duration_minutes: self.duration()?,
            exclude_booking_id: self.exclude_booking_id,
        })
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("{left}")))?;
            match col.as_str() {
                "id" => filters.id = Some(parse_ulid_expr(right)?),
                "date" => filters.date = Some(DateFilter::One(parse_date_expr(right)?)),
                "service_id" => filters.service_id = Some(parse_ulid_expr(right)?),
                "exclude_booking_id" => filters.exclude_booking_id = Some(parse_ulid_expr(right)?),
                "duration" => filters.duration_minutes = Some(parse_duration_expr(right)?),
                "days" => filters.days = Some(parse_u32(right)?),
                _ => return Err(SqlError::UnknownColumn(col)),
            }
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } if expr_column_name(expr).as_deref() == Some("date") => {
            let dates = list.iter().map(parse_date_expr).collect::<Result<Vec<_>, _>>()?;
            filters.date = Some(DateFilter::List(dates));
            Ok(())
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } if expr_column_name(expr).as_deref() == Some("date") => {
            filters.date = Some(DateFilter::Range(parse_date_expr(low)?, parse_date_expr(high)?));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// String or bare number literal, as text.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.as_str()),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    parse_date(s).ok_or_else(|| SqlError::Invalid(format!("malformed date: {s}")))
}

fn parse_time_expr(expr: &Expr) -> Result<chrono::NaiveTime, SqlError> {
    let s = literal_text(expr)?;
    parse_time(s).ok_or_else(|| SqlError::Parse(format!("bad time: {s}")))
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64_expr(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}")))
}

/// Hours on the wire, whole minutes inside. Zero passes through so the
/// engine reports it as an invalid query; negative hours are rejected here.
fn parse_duration_expr(expr: &Expr) -> Result<u32, SqlError> {
    let hours = parse_f64_expr(expr)?;
    if hours == 0.0 {
        return Ok(0);
    }
    minutes_from_hours(hours)
        .ok_or_else(|| SqlError::Invalid(format!("duration must be positive, got {hours}")))
}

fn parse_price(expr: &Expr) -> Result<f64, SqlError> {
    let v = parse_f64_expr(expr)?;
    if v.is_finite() && v >= 0.0 {
        Ok(v)
    } else {
        Err(SqlError::Parse(format!("bad price: {v}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal_text(expr)?;
    s.parse()
        .map_err(|_| SqlError::Parse(format!("{s} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    /// Well-formed command with a value no query can accept.
    Invalid(String),
}

impl SqlError {
    pub fn code(&self) -> &'static str {
        match self {
            SqlError::Invalid(_) => "invalid_query",
            _ => "syntax_error",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Invalid(s) => write!(f, "invalid query: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
