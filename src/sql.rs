use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
///
/// `returning` is set when the statement carries a `RETURNING` clause; the
/// affected row is then sent back in full whatever the projection.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        booking: NewBooking,
        returning: bool,
    },
    UpdateBooking {
        id: BookingId,
        changes: BookingChanges,
        returning: bool,
    },
    DeleteBooking {
        id: BookingId,
        returning: bool,
    },
    SelectBookings(BookingFilter),
    SelectWeekdays,
    SelectClassKinds,
}

/// Columns a client may write, in positional order for an INSERT without a
/// column list.
const WRITABLE_COLUMNS: [&str; 9] = [
    "id",
    "room_id",
    "course_id",
    "instructor_id",
    "academic_unit_id",
    "weekday",
    "start_time",
    "end_time",
    "class_kind",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() < 8 || values.len() > WRITABLE_COLUMNS.len() {
            return Err(SqlError::WrongArity("bookings", 8, values.len()));
        }
        // Without a column list a trailing `class_kind` may be left off.
        WRITABLE_COLUMNS
            .iter()
            .take(values.len())
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let mut id = None;
    let (mut room_id, mut course_id, mut instructor_id, mut academic_unit_id) = (None, None, None, None);
    let (mut weekday, mut start_time, mut end_time, mut kind) = (None, None, None, None);
    for (column, value) in columns.iter().zip(&values) {
        match column.as_str() {
            "id" => id = parse_ulid_or_null(value)?,
            "room_id" => room_id = Some(parse_u64(value)?),
            "course_id" => course_id = Some(parse_u64(value)?),
            "instructor_id" => instructor_id = Some(parse_u64(value)?),
            "academic_unit_id" => academic_unit_id = Some(parse_u64(value)?),
            "weekday" => weekday = Some(parse_string(value)?),
            "start_time" => start_time = Some(parse_string(value)?),
            "end_time" => end_time = Some(parse_string(value)?),
            "class_kind" => kind = parse_string_or_null(value)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    let booking = NewBooking {
        id,
        room_id: room_id.ok_or(SqlError::MissingColumn("room_id"))?,
        course_id: course_id.ok_or(SqlError::MissingColumn("course_id"))?,
        instructor_id: instructor_id.ok_or(SqlError::MissingColumn("instructor_id"))?,
        academic_unit_id: academic_unit_id.ok_or(SqlError::MissingColumn("academic_unit_id"))?,
        weekday: weekday.ok_or(SqlError::MissingColumn("weekday"))?,
        start_time: start_time.ok_or(SqlError::MissingColumn("start_time"))?,
        end_time: end_time.ok_or(SqlError::MissingColumn("end_time"))?,
        kind,
    };
    Ok(Command::InsertBooking {
        booking,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "bookings" {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_id(selection)?;

    let mut changes = BookingChanges::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "room_id" => changes.room_id = Some(parse_u64(value)?),
            "course_id" => changes.course_id = Some(parse_u64(value)?),
            "instructor_id" => changes.instructor_id = Some(parse_u64(value)?),
            "academic_unit_id" => changes.academic_unit_id = Some(parse_u64(value)?),
            "weekday" => changes.weekday = Some(parse_string(value)?),
            "start_time" => changes.start_time = Some(parse_string(value)?),
            "end_time" => changes.end_time = Some(parse_string(value)?),
            "class_kind" => changes.kind = Some(parse_string(value)?),
            "id" | "created_at" | "updated_at" => {
                return Err(SqlError::Unsupported(format!("{column} cannot be updated")));
            }
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::UpdateBooking {
        id,
        changes,
        returning,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBooking {
        id,
        returning: delete.returning.is_some(),
    })
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

    match table.as_str() {
        "bookings" => {
            let mut filter = BookingFilter::default();
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectBookings(filter))
        }
        "weekdays" => Ok(Command::SelectWeekdays),
        "class_kinds" => Ok(Command::SelectClassKinds),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_booking_filters(expr: &Expr, filter: &mut BookingFilter) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_booking_filters(inner, filter),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, filter)?;
                extract_booking_filters(right, filter)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                match col.as_str() {
                    "id" => filter.id = Some(parse_ulid_expr(right)?),
                    "room_id" => filter.room_id = Some(parse_u64(right)?),
                    "course_id" => filter.course_id = Some(parse_u64(right)?),
                    "instructor_id" => filter.instructor_id = Some(parse_u64(right)?),
                    "academic_unit_id" => filter.academic_unit_id = Some(parse_u64(right)?),
                    "weekday" => {
                        let literal = parse_string(right)?;
                        filter.weekday = Some(literal.parse().map_err(SqlError::Literal)?);
                    }
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|_| SqlError::Parse(format!("expected unsigned integer, got {s}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    Literal(ParseError),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(len) => write!(f, "query too long ({len} bytes)"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Literal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_with_columns() {
        let sql = "INSERT INTO bookings (room_id, course_id, instructor_id, academic_unit_id, weekday, start_time, end_time) \
                   VALUES (101, 7, 42, 3, 'Monday', '08:00:00', '09:30:00')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertBooking { booking: b, returning } => {
                assert!(!returning);
                assert_eq!(b.id, None);
                assert_eq!(b.room_id, 101);
                assert_eq!(b.course_id, 7);
                assert_eq!(b.instructor_id, 42);
                assert_eq!(b.academic_unit_id, 3);
                assert_eq!(b.weekday, "Monday");
                assert_eq!(b.start_time, "08:00:00");
                assert_eq!(b.end_time, "09:30:00");
                assert_eq!(b.kind, None);
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_column_order_is_honored() {
        let sql = format!(
            "INSERT INTO bookings (class_kind, end_time, start_time, weekday, academic_unit_id, instructor_id, course_id, room_id, id) \
             VALUES ('Lab', '12:00:00', '10:00:00', 'friday', 1, 2, 3, 4, '{ID}')"
        );
        let Command::InsertBooking { booking: b, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(b.id.unwrap().to_string(), ID);
        assert_eq!(b.room_id, 4);
        assert_eq!(b.instructor_id, 2);
        assert_eq!(b.weekday, "friday");
        assert_eq!(b.kind.as_deref(), Some("Lab"));
    }

    #[test]
    fn parse_insert_positional() {
        let sql = "INSERT INTO bookings VALUES (NULL, 1, 2, 3, 4, 'Tuesday', '14:00:00', '15:00:00', 'Practice')";
        let Command::InsertBooking { booking: b, .. } = parse_sql(sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(b.id, None);
        assert_eq!(b.kind.as_deref(), Some("Practice"));
    }

    #[test]
    fn parse_insert_missing_column_errors() {
        let sql = "INSERT INTO bookings (room_id, course_id, instructor_id, academic_unit_id, weekday, start_time) \
                   VALUES (1, 2, 3, 4, 'Monday', '08:00:00')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("end_time"))));
    }

    #[test]
    fn parse_insert_arity_mismatch_errors() {
        let sql = "INSERT INTO bookings (room_id, course_id) VALUES (1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("bookings", 2, 1))));
    }

    #[test]
    fn parse_update_partial() {
        let sql = format!("UPDATE bookings SET start_time = '10:00:00', room_id = 9 WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { id, changes, .. } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(changes.start_time.as_deref(), Some("10:00:00"));
                assert_eq!(changes.room_id, Some(9));
                assert_eq!(changes.end_time, None);
                assert_eq!(changes.instructor_id, None);
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_positional_insert_without_class_kind() {
        let sql = "INSERT INTO bookings VALUES (NULL, 1, 2, 3, 4, 'Monday', '08:00:00', '09:00:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking { booking, returning } => {
                assert_eq!(booking.id, None);
                assert_eq!(booking.room_id, 1);
                assert_eq!(booking.academic_unit_id, 4);
                assert_eq!(booking.end_time, "09:00:00");
                assert_eq!(booking.kind, None);
                assert!(!returning);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }

        let short = "INSERT INTO bookings VALUES (NULL, 1, 2, 3, 4, 'Monday', '08:00:00')";
        assert!(matches!(parse_sql(short), Err(SqlError::WrongArity("bookings", 8, 7))));
    }

    #[test]
    fn parse_returning_clause() {
        let sql = "INSERT INTO bookings VALUES (NULL, 1, 2, 3, 4, 'Monday', '08:00:00', '09:00:00') RETURNING *";
        assert!(matches!(parse_sql(sql).unwrap(), Command::InsertBooking { returning: true, .. }));

        let sql = format!("DELETE FROM bookings WHERE id = '{ID}' RETURNING id");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteBooking { returning: true, .. }));
    }

    #[test]
    fn parse_update_requires_id_filter() {
        let sql = "UPDATE bookings SET room_id = 9 WHERE room_id = 1";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_update_rejects_id_change() {
        let sql = format!("UPDATE bookings SET id = '{ID}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::DeleteBooking { id, returning } => {
                assert_eq!(id.to_string(), ID);
                assert!(!returning);
            }
            cmd => panic!("expected DeleteBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_all_bookings() {
        let cmd = parse_sql("SELECT * FROM bookings").unwrap();
        assert_eq!(cmd, Command::SelectBookings(BookingFilter::default()));
    }

    #[test]
    fn parse_select_bookings_with_filters() {
        let sql = "SELECT * FROM bookings WHERE room_id = 5 AND weekday = 'WEDNESDAY' AND (instructor_id = 8)";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings(BookingFilter {
                room_id: Some(5),
                instructor_id: Some(8),
                weekday: Some(Weekday::Wednesday),
                ..Default::default()
            })
        );
    }

    #[test]
    fn parse_select_bad_weekday_is_literal_error() {
        let sql = "SELECT * FROM bookings WHERE weekday = 'Lunes'";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::Literal(ParseError::Weekday(_)))
        ));
    }

    #[test]
    fn parse_select_range_filter_unsupported() {
        let sql = "SELECT * FROM bookings WHERE room_id > 5";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_enumerations() {
        assert_eq!(parse_sql("SELECT * FROM weekdays").unwrap(), Command::SelectWeekdays);
        assert_eq!(parse_sql("select * from class_kinds").unwrap(), Command::SelectClassKinds);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("DELETE FROM rooms WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "rooms"));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_oversized_errors() {
        let sql = format!("SELECT * FROM bookings WHERE room_id = {}", "1".repeat(MAX_SQL_LEN));
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooLong(_))));
    }
}
