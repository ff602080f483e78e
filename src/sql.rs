use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLesson {
        id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
        deadline_hours: u32,
        status: LessonStatus,
        details: LessonDetails,
    },
    UpdateLesson {
        id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
        capacity: Option<u32>,
        deadline_hours: Option<u32>,
        title: Option<String>,
        description: Option<String>,
        category: Option<String>,
        instructor: Option<String>,
        location: Option<String>,
        level: Option<String>,
    },
    UpdateLessonStatus {
        id: Ulid,
        status: LessonStatus,
    },
    DeleteLesson {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        lesson_id: Ulid,
        user_id: Ulid,
    },
    CancelBooking {
        id: Ulid,
        reason: CancellationReason,
    },
    MarkAttendance {
        ids: Vec<Ulid>,
        attended: bool,
    },
    Rollover {
        lesson_id: Ulid,
    },
    SelectLessons {
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectBookings {
        lesson_id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    SelectWaitlist {
        lesson_id: Ulid,
    },
    SelectStats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    // ROLLOVER is not SQL; recognize it before the parser runs.
    if trimmed.to_uppercase().starts_with("ROLLOVER ") {
        let arg = trimmed[9..].trim().trim_matches(';').trim().trim_matches('\'');
        let lesson_id =
            Ulid::from_string(arg).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
        return Ok(Command::Rollover { lesson_id });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "lessons" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("lessons", 5, values.len()));
            }
            let status = if values.len() >= 6 {
                let s = parse_string(&values[5])?;
                match LessonStatus::parse(&s) {
                    Some(LessonStatus::Archived) | None => {
                        return Err(SqlError::Parse(format!("bad lesson status: {s}")));
                    }
                    Some(status) => status,
                }
            } else {
                LessonStatus::Published
            };
            let text_at = |i: usize| -> Result<Option<String>, SqlError> {
                if values.len() > i {
                    parse_string_or_null(&values[i])
                } else {
                    Ok(None)
                }
            };
            Ok(Command::InsertLesson {
                id: parse_ulid_expr(&values[0])?,
                start: parse_i64_expr(&values[1])?,
                end: parse_i64_expr(&values[2])?,
                capacity: parse_u32(&values[3])?,
                deadline_hours: parse_u32(&values[4])?,
                status,
                details: LessonDetails {
                    title: text_at(6)?,
                    description: text_at(7)?,
                    category: text_at(8)?,
                    instructor: text_at(9)?,
                    location: text_at(10)?,
                    level: text_at(11)?,
                },
            })
        }
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(&values[0])?,
                lesson_id: parse_ulid_expr(&values[1])?,
                user_id: parse_ulid_expr(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    match table.as_str() {
        "lessons" => parse_update_lesson(assignments, selection),
        "bookings" => parse_update_booking(assignments, selection),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update_lesson(
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;

    let mut status = None;
    let (mut start, mut end, mut capacity, mut deadline_hours) = (None, None, None, None);
    let (mut title, mut description, mut category) = (None, None, None);
    let (mut instructor, mut location, mut level) = (None, None, None);

    for a in assignments {
        let col = assignment_column(a)?;
        match col.as_str() {
            "status" => {
                let s = parse_string(&a.value)?;
                status = Some(
                    LessonStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad lesson status: {s}")))?,
                );
            }
            "start" => start = Some(parse_i64_expr(&a.value)?),
            "end" => end = Some(parse_i64_expr(&a.value)?),
            "capacity" => capacity = Some(parse_u32(&a.value)?),
            "deadline_hours" => deadline_hours = Some(parse_u32(&a.value)?),
            "title" => title = parse_string_or_null(&a.value)?,
            "description" => description = parse_string_or_null(&a.value)?,
            "category" => category = parse_string_or_null(&a.value)?,
            "instructor" => instructor = parse_string_or_null(&a.value)?,
            "location" => location = parse_string_or_null(&a.value)?,
            "level" => level = parse_string_or_null(&a.value)?,
            other => return Err(SqlError::Parse(format!("unknown lesson column: {other}"))),
        }
    }

    if let Some(status) = status {
        if assignments.len() > 1 {
            return Err(SqlError::Unsupported(
                "status cannot be combined with other lesson updates".into(),
            ));
        }
        return Ok(Command::UpdateLessonStatus { id, status });
    }
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    Ok(Command::UpdateLesson {
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
    })
}

fn parse_update_booking(
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let mut attended = None;
    let mut status = None;
    let mut reason = None;

    for a in assignments {
        let col = assignment_column(a)?;
        match col.as_str() {
            "attended" => attended = Some(parse_bool(&a.value)?),
            "status" => status = Some(parse_string(&a.value)?),
            "reason" => {
                let s = parse_string(&a.value)?;
                reason = Some(
                    CancellationReason::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad cancellation reason: {s}")))?,
                );
            }
            other => return Err(SqlError::Parse(format!("unknown booking column: {other}"))),
        }
    }

    match (attended, status) {
        (Some(attended), None) => {
            if reason.is_some() {
                return Err(SqlError::Unsupported(
                    "reason only applies to cancellation".into(),
                ));
            }
            let ids = extract_where_ids(selection)?;
            Ok(Command::MarkAttendance { ids, attended })
        }
        (None, Some(status)) => {
            if status != "cancelled" {
                return Err(SqlError::Unsupported(format!(
                    "bookings can only be set to status 'cancelled', got '{status}'"
                )));
            }
            let id = extract_where_id(selection)?;
            Ok(Command::CancelBooking {
                id,
                reason: reason.unwrap_or(CancellationReason::UserCancelled),
            })
        }
        (Some(_), Some(_)) => Err(SqlError::Unsupported(
            "attended and status cannot be combined".into(),
        )),
        (None, None) => Err(SqlError::Parse("UPDATE bookings without attended or status".into())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "lessons" => Ok(Command::DeleteLesson { id }),
        // A plain DELETE is a user-initiated cancellation; bookings are
        // history and are never removed.
        "bookings" => Ok(Command::CancelBooking {
            id,
            reason: CancellationReason::UserCancelled,
        }),
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

    match table.as_str() {
        "lessons" => {
            let (mut start, mut end) = (None, None);
            if let Some(selection) = &select.selection {
                extract_lesson_filters(selection, &mut start, &mut end)?;
            }
            Ok(Command::SelectLessons { start, end })
        }
        "bookings" => {
            let (mut lesson_id, mut user_id) = (None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut lesson_id, &mut user_id)?;
            }
            if lesson_id.is_none() && user_id.is_none() {
                return Err(SqlError::MissingFilter("lesson_id"));
            }
            Ok(Command::SelectBookings { lesson_id, user_id })
        }
        "waitlist" => {
            let (mut lesson_id, mut user_id) = (None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut lesson_id, &mut user_id)?;
            }
            Ok(Command::SelectWaitlist {
                lesson_id: lesson_id.ok_or(SqlError::MissingFilter("lesson_id"))?,
            })
        }
        "booking_stats" => Ok(Command::SelectStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_lesson_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_lesson_filters(left, start, end)?;
                extract_lesson_filters(right, start, end)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_booking_filters(
    expr: &Expr,
    lesson_id: &mut Option<Ulid>,
    user_id: &mut Option<Ulid>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, lesson_id, user_id)?;
                extract_booking_filters(right, lesson_id, user_id)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("lesson_id") {
                    *lesson_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("user_id") {
                    *user_id = Some(parse_ulid_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
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
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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

/// `WHERE id = '…'` or `WHERE id IN ('…', '…')`.
fn extract_where_ids(selection: &Option<Expr>) -> Result<Vec<Ulid>, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            if expr_column_name(expr).as_deref() != Some("id") {
                return Err(SqlError::MissingFilter("id"));
            }
            list.iter().map(parse_ulid_expr).collect()
        }
        _ => Ok(vec![extract_where_id(selection)?]),
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_string(expr)?))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const U: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_lesson_minimal() {
        let sql = format!(
            r#"INSERT INTO lessons (id, start, "end", capacity, deadline_hours) VALUES ('{U}', 1000, 2000, 20, 24)"#
        );
        let cmd = parse_sql(&sql).unwrap();
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
                assert_eq!(id.to_string(), U);
                assert_eq!(start, 1000);
                assert_eq!(end, 2000);
                assert_eq!(capacity, 20);
                assert_eq!(deadline_hours, 24);
                assert_eq!(status, LessonStatus::Published);
                assert_eq!(details, LessonDetails::default());
            }
            _ => panic!("expected InsertLesson, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_lesson_with_status_and_details() {
        let sql = format!(
            r#"INSERT INTO lessons (id, start, "end", capacity, deadline_hours, status, title, description)
               VALUES ('{U}', 1000, 2000, 8, 48, 'draft', 'Beginner surf', NULL)"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertLesson { status, details, .. } => {
                assert_eq!(status, LessonStatus::Draft);
                assert_eq!(details.title.as_deref(), Some("Beginner surf"));
                assert_eq!(details.description, None);
            }
            _ => panic!("expected InsertLesson, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_lesson_rejects_archived() {
        let sql = format!(
            r#"INSERT INTO lessons (id, start, "end", capacity, deadline_hours, status) VALUES ('{U}', 1000, 2000, 8, 48, 'archived')"#
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_insert_lesson_wrong_arity() {
        let sql = format!("INSERT INTO lessons (id) VALUES ('{U}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("lessons", 5, 1))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (id, lesson_id, user_id) VALUES ('{U}', '{U}', '{U}')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::InsertBooking { .. }));
    }

    #[test]
    fn parse_delete_booking_is_user_cancellation() {
        let sql = format!("DELETE FROM bookings WHERE id = '{U}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CancelBooking { id, reason } => {
                assert_eq!(id.to_string(), U);
                assert_eq!(reason, CancellationReason::UserCancelled);
            }
            _ => panic!("expected CancelBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_cancel_with_reason() {
        let sql = format!(
            "UPDATE bookings SET status = 'cancelled', reason = 'weather' WHERE id = '{U}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CancelBooking { reason, .. } => {
                assert_eq!(reason, CancellationReason::Weather);
            }
            _ => panic!("expected CancelBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_cancel_rejects_other_statuses() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{U}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_cancel_bad_reason() {
        let sql = format!(
            "UPDATE bookings SET status = 'cancelled', reason = 'felt_like_it' WHERE id = '{U}'"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_mark_attendance_single() {
        let sql = format!("UPDATE bookings SET attended = true WHERE id = '{U}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::MarkAttendance { ids, attended } => {
                assert_eq!(ids.len(), 1);
                assert!(attended);
            }
            _ => panic!("expected MarkAttendance, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_mark_attendance_in_list() {
        let sql = format!("UPDATE bookings SET attended = false WHERE id IN ('{U}', '{U}')");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::MarkAttendance { ids, attended } => {
                assert_eq!(ids.len(), 2);
                assert!(!attended);
            }
            _ => panic!("expected MarkAttendance, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_lesson_fields() {
        let sql = format!(
            r#"UPDATE lessons SET capacity = 25, "end" = 3000, title = 'Intermediate' WHERE id = '{U}'"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateLesson {
                capacity,
                start,
                end,
                title,
                ..
            } => {
                assert_eq!(capacity, Some(25));
                assert_eq!(start, None);
                assert_eq!(end, Some(3000));
                assert_eq!(title.as_deref(), Some("Intermediate"));
            }
            _ => panic!("expected UpdateLesson, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_lesson_status() {
        let sql = format!("UPDATE lessons SET status = 'published' WHERE id = '{U}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateLessonStatus { status, .. } => {
                assert_eq!(status, LessonStatus::Published);
            }
            _ => panic!("expected UpdateLessonStatus, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_lesson_status_not_combinable() {
        let sql = format!("UPDATE lessons SET status = 'published', capacity = 5 WHERE id = '{U}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_rollover() {
        let sql = format!("ROLLOVER '{U}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::Rollover { lesson_id } => assert_eq!(lesson_id.to_string(), U),
            _ => panic!("expected Rollover, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_rollover_unquoted_with_semicolon() {
        let sql = format!("ROLLOVER {U};");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::Rollover { .. }));
    }

    #[test]
    fn parse_select_lessons_window() {
        let sql = r#"SELECT * FROM lessons WHERE start >= 1000 AND "end" <= 2000"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectLessons { start, end } => {
                assert_eq!(start, Some(1000));
                assert_eq!(end, Some(2000));
            }
            _ => panic!("expected SelectLessons, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_lessons_no_filters() {
        let cmd = parse_sql("SELECT * FROM lessons").unwrap();
        assert_eq!(cmd, Command::SelectLessons { start: None, end: None });
    }

    #[test]
    fn parse_select_bookings_requires_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter("lesson_id"))
        ));
        let sql = format!("SELECT * FROM bookings WHERE lesson_id = '{U}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectBookings { .. }));
        let sql = format!("SELECT * FROM bookings WHERE user_id = '{U}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings { lesson_id, user_id } => {
                assert!(lesson_id.is_none());
                assert!(user_id.is_some());
            }
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_waitlist() {
        let sql = format!("SELECT * FROM waitlist WHERE lesson_id = '{U}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectWaitlist { .. }));
    }

    #[test]
    fn parse_select_stats() {
        assert_eq!(parse_sql("SELECT * FROM booking_stats").unwrap(), Command::SelectStats);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{U}')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
