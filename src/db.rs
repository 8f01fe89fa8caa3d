use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::{now_millis, StoredSession, StoredUser};

pub type DbPool = Arc<Mutex<Connection>>;

pub type Row = Map<String, Value>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        access_token TEXT PRIMARY KEY,
        refresh_token TEXT UNIQUE NOT NULL,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at INTEGER DEFAULT (strftime('%s', 'now')),
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS lists (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        color TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        list_id TEXT NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        position INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        completed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS lists_by_user ON lists (user_id, position);
    CREATE INDEX IF NOT EXISTS tasks_by_user ON tasks (user_id, position);
";

pub fn init_db(path: impl AsRef<Path>) -> rusqlite::Result<DbPool> {
    setup(Connection::open(path)?)
}

pub fn init_memory_db() -> rusqlite::Result<DbPool> {
    setup(Connection::open_in_memory()?)
}

fn setup(conn: Connection) -> rusqlite::Result<DbPool> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn lock(pool: &DbPool) -> Result<MutexGuard<'_, Connection>, AppError> {
    pool.lock()
        .map_err(|_| AppError::Database("database lock poisoned".to_string()))
}

fn unix_now() -> i64 {
    now_millis() / 1000
}

// User operations
pub fn create_user(pool: &DbPool, user: &StoredUser) -> Result<(), AppError> {
    let conn = lock(pool)?;
    conn.execute(
        "INSERT INTO users (id, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        (&user.id, &user.email, &user.password_hash, user.created_at),
    )?;
    Ok(())
}

fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredUser> {
    Ok(StoredUser {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn get_user_by_email(pool: &DbPool, email: &str) -> Result<Option<StoredUser>, AppError> {
    let conn = lock(pool)?;
    let user = conn
        .query_row(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = ?1 COLLATE NOCASE",
            [email],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn get_user(pool: &DbPool, id: &str) -> Result<Option<StoredUser>, AppError> {
    let conn = lock(pool)?;
    let user = conn
        .query_row(
            "SELECT id, email, password_hash, created_at FROM users WHERE id = ?1",
            [id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

// Session operations
pub fn create_session(pool: &DbPool, session: &StoredSession) -> Result<(), AppError> {
    let conn = lock(pool)?;
    conn.execute(
        "INSERT INTO sessions (access_token, refresh_token, user_id, expires_at) VALUES (?1, ?2, ?3, ?4)",
        (
            &session.access_token,
            &session.refresh_token,
            &session.user_id,
            session.expires_at,
        ),
    )?;
    Ok(())
}

fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredSession> {
    Ok(StoredSession {
        access_token: row.get(0)?,
        refresh_token: row.get(1)?,
        user_id: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

/// Live session for an access token; expired sessions are not returned.
pub fn get_session(pool: &DbPool, access_token: &str) -> Result<Option<StoredSession>, AppError> {
    let conn = lock(pool)?;
    let session = conn
        .query_row(
            "SELECT access_token, refresh_token, user_id, expires_at FROM sessions
             WHERE access_token = ?1 AND expires_at > ?2",
            (access_token, unix_now()),
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

/// Remove and return the session a refresh token belongs to.
pub fn take_session_by_refresh(
    pool: &DbPool,
    refresh_token: &str,
) -> Result<Option<StoredSession>, AppError> {
    let conn = lock(pool)?;
    let session = conn
        .query_row(
            "SELECT access_token, refresh_token, user_id, expires_at FROM sessions
             WHERE refresh_token = ?1 AND expires_at > ?2",
            (refresh_token, unix_now()),
            session_from_row,
        )
        .optional()?;
    if let Some(session) = &session {
        conn.execute(
            "DELETE FROM sessions WHERE access_token = ?1",
            [&session.access_token],
        )?;
    }
    Ok(session)
}

pub fn delete_session(pool: &DbPool, access_token: &str) -> Result<(), AppError> {
    let conn = lock(pool)?;
    conn.execute("DELETE FROM sessions WHERE access_token = ?1", [access_token])?;
    Ok(())
}

pub fn cleanup_expired_sessions(pool: &DbPool) -> Result<usize, AppError> {
    let conn = lock(pool)?;
    let removed = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [unix_now()])?;
    Ok(removed)
}

// Table store

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Integer,
    Boolean,
}

/// What an insert without the column stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    Required,
    Null,
    Zero,
    Now,
}

#[derive(Debug)]
struct Column {
    name: &'static str,
    kind: Kind,
    fallback: Fallback,
}

const fn col(name: &'static str, kind: Kind, fallback: Fallback) -> Column {
    Column {
        name,
        kind,
        fallback,
    }
}

const LIST_COLUMNS: &[Column] = &[
    col("id", Kind::Text, Fallback::Required),
    col("user_id", Kind::Text, Fallback::Required),
    col("name", Kind::Text, Fallback::Required),
    col("color", Kind::Text, Fallback::Required),
    col("position", Kind::Integer, Fallback::Zero),
    col("created_at", Kind::Integer, Fallback::Now),
];

const TASK_COLUMNS: &[Column] = &[
    col("id", Kind::Text, Fallback::Required),
    col("list_id", Kind::Text, Fallback::Required),
    col("user_id", Kind::Text, Fallback::Required),
    col("content", Kind::Text, Fallback::Required),
    col("completed", Kind::Boolean, Fallback::Zero),
    col("position", Kind::Integer, Fallback::Zero),
    col("created_at", Kind::Integer, Fallback::Now),
    col("completed_at", Kind::Integer, Fallback::Null),
];

/// The user-scoped tables exposed over the REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Lists,
    Tasks,
}

impl Table {
    pub fn from_name(name: &str) -> Option<Table> {
        match name {
            "lists" => Some(Table::Lists),
            "tasks" => Some(Table::Tasks),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Lists => "lists",
            Table::Tasks => "tasks",
        }
    }

    fn columns(self) -> &'static [Column] {
        match self {
            Table::Lists => LIST_COLUMNS,
            Table::Tasks => TASK_COLUMNS,
        }
    }

    fn column(self, name: &str) -> Result<&'static Column, AppError> {
        self.columns()
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                AppError::BadRequest(format!("unknown column {name} on {}", self.name()))
            })
    }

    fn column_list(self) -> String {
        self.columns()
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// `column = value` condition from a `column=eq.value` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

fn filter_value(column: &Column, raw: &str) -> Result<SqlValue, AppError> {
    let invalid = || AppError::BadRequest(format!("invalid value for {}: {raw}", column.name));
    match column.kind {
        Kind::Text => Ok(SqlValue::Text(raw.to_string())),
        Kind::Integer => raw.parse().map(SqlValue::Integer).map_err(|_| invalid()),
        Kind::Boolean => match raw {
            "true" => Ok(SqlValue::Integer(1)),
            "false" => Ok(SqlValue::Integer(0)),
            _ => Err(invalid()),
        },
    }
}

fn json_value(column: &Column, value: &Value) -> Result<SqlValue, AppError> {
    let invalid = || AppError::BadRequest(format!("invalid value for {}", column.name));
    match (column.kind, value) {
        (_, Value::Null) if column.fallback == Fallback::Null => Ok(SqlValue::Null),
        (Kind::Text, Value::String(s)) => {
            if s.trim().is_empty() && column.fallback == Fallback::Required {
                return Err(AppError::BadRequest(format!("{} cannot be empty", column.name)));
            }
            Ok(SqlValue::Text(s.clone()))
        }
        (Kind::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer).ok_or_else(invalid),
        (Kind::Boolean, Value::Bool(b)) => Ok(SqlValue::Integer(i64::from(*b))),
        _ => Err(invalid()),
    }
}

fn read_row(table: Table, row: &rusqlite::Row) -> rusqlite::Result<Row> {
    let mut out = Row::new();
    for (i, column) in table.columns().iter().enumerate() {
        let value = match column.kind {
            Kind::Text => row.get::<_, Option<String>>(i)?.map(Value::from),
            Kind::Integer => row.get::<_, Option<i64>>(i)?.map(Value::from),
            Kind::Boolean => row.get::<_, Option<i64>>(i)?.map(|v| Value::Bool(v != 0)),
        };
        out.insert(column.name.to_string(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

/// `user_id = ?1 AND col = ?2 ...` with the bound values in order.
fn where_clause(table: Table, user_id: &str, filters: &[Filter]) -> Result<(String, Vec<SqlValue>), AppError> {
    let mut clause = "user_id = ?1".to_string();
    let mut values = vec![SqlValue::Text(user_id.to_string())];
    for filter in filters {
        let column = table.column(&filter.column)?;
        values.push(filter_value(column, &filter.value)?);
        clause.push_str(&format!(" AND {} = ?{}", column.name, values.len()));
    }
    Ok((clause, values))
}

fn owner_of(tx: &Transaction, table: Table, id: &str) -> Result<Option<String>, AppError> {
    let owner = tx
        .query_row(
            &format!("SELECT user_id FROM {} WHERE id = ?1", table.name()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner)
}

fn check_user_id(value: Option<&Value>, user_id: &str) -> Result<(), AppError> {
    match value {
        None => Ok(()),
        Some(Value::String(owner)) if owner == user_id => Ok(()),
        Some(_) => Err(AppError::Forbidden),
    }
}

/// Tasks may only point at lists of the same user.
fn check_list_owner(tx: &Transaction, list_id: &Value, user_id: &str) -> Result<(), AppError> {
    let Some(list_id) = list_id.as_str() else {
        return Err(AppError::BadRequest("invalid value for list_id".to_string()));
    };
    match owner_of(tx, Table::Lists, list_id)? {
        Some(owner) if owner == user_id => Ok(()),
        Some(_) => Err(AppError::Forbidden),
        None => Err(AppError::BadRequest(format!("unknown list {list_id}"))),
    }
}

pub fn select_rows(
    pool: &DbPool,
    table: Table,
    user_id: &str,
    filters: &[Filter],
    order: Option<&Order>,
) -> Result<Vec<Row>, AppError> {
    let (clause, values) = where_clause(table, user_id, filters)?;
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}",
        table.column_list(),
        table.name(),
        clause
    );
    if let Some(order) = order {
        let column = table.column(&order.column)?;
        let direction = if order.ascending { "ASC" } else { "DESC" };
        sql.push_str(&format!(" ORDER BY {} {}", column.name, direction));
    }

    let conn = lock(pool)?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| read_row(table, row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert rows owned by `user_id`. With `upsert`, rows whose id already exists
/// are updated in place instead of failing with a conflict.
pub fn insert_rows(
    pool: &DbPool,
    table: Table,
    user_id: &str,
    rows: &[Row],
    upsert: bool,
) -> Result<Vec<Row>, AppError> {
    let columns = table.columns();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        table.column_list(),
        placeholders.join(", ")
    );
    if upsert {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| c.name != "id")
            .map(|c| format!("{0} = excluded.{0}", c.name))
            .collect();
        sql.push_str(&format!(" ON CONFLICT(id) DO UPDATE SET {}", updates.join(", ")));
    }

    let mut conn = lock(pool)?;
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        for key in row.keys() {
            table.column(key)?;
        }
        check_user_id(row.get("user_id"), user_id)?;
        if let Some(list_id) = row.get("list_id") {
            check_list_owner(&tx, list_id, user_id)?;
        }

        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let value = match (column.name, row.get(column.name)) {
                ("user_id", _) => SqlValue::Text(user_id.to_string()),
                (_, Some(value)) => json_value(column, value)?,
                (name, None) => match column.fallback {
                    Fallback::Required => {
                        return Err(AppError::BadRequest(format!("missing column {name}")))
                    }
                    Fallback::Null => SqlValue::Null,
                    Fallback::Zero => SqlValue::Integer(0),
                    Fallback::Now => SqlValue::Integer(now_millis()),
                },
            };
            values.push(value);
        }

        let id = match &values[0] {
            SqlValue::Text(id) => id.clone(),
            _ => return Err(AppError::BadRequest("invalid value for id".to_string())),
        };
        if upsert {
            if let Some(owner) = owner_of(&tx, table, &id)? {
                if owner != user_id {
                    return Err(AppError::Forbidden);
                }
            }
        }
        tx.execute(&sql, params_from_iter(values))?;
        ids.push(id);
    }

    let mut inserted = Vec::with_capacity(ids.len());
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM {} WHERE id = ?1",
            table.column_list(),
            table.name()
        ))?;
        for id in &ids {
            inserted.push(stmt.query_row([id], |row| read_row(table, row))?);
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Apply a partial row to every matching row of the caller; returns the updated rows.
pub fn update_rows(
    pool: &DbPool,
    table: Table,
    user_id: &str,
    filters: &[Filter],
    patch: &Row,
) -> Result<Vec<Row>, AppError> {
    let (clause, mut values) = where_clause(table, user_id, filters)?;

    let mut conn = lock(pool)?;
    let tx = conn.transaction()?;

    let mut assignments = Vec::new();
    for (key, value) in patch {
        let column = table.column(key)?;
        match column.name {
            "id" => return Err(AppError::BadRequest("id cannot be changed".to_string())),
            "user_id" => {
                check_user_id(Some(value), user_id)?;
                continue;
            }
            "list_id" => check_list_owner(&tx, value, user_id)?,
            _ => {}
        }
        values.push(json_value(column, value)?);
        assignments.push(format!("{} = ?{}", column.name, values.len()));
    }
    if assignments.is_empty() {
        return Err(AppError::BadRequest("nothing to update".to_string()));
    }

    let ids: Vec<String> = {
        let (select_clause, select_values) = where_clause(table, user_id, filters)?;
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM {} WHERE {}",
            table.name(),
            select_clause
        ))?;
        let ids = stmt
            .query_map(params_from_iter(select_values), |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    tx.execute(
        &format!(
            "UPDATE {} SET {} WHERE {}",
            table.name(),
            assignments.join(", "),
            clause
        ),
        params_from_iter(values),
    )?;

    let mut updated = Vec::with_capacity(ids.len());
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM {} WHERE id = ?1",
            table.column_list(),
            table.name()
        ))?;
        for id in &ids {
            updated.push(stmt.query_row([id], |row| read_row(table, row))?);
        }
    }
    tx.commit()?;
    Ok(updated)
}

/// Delete matching rows of the caller. Deleting a list removes its tasks.
pub fn delete_rows(
    pool: &DbPool,
    table: Table,
    user_id: &str,
    filters: &[Filter],
) -> Result<usize, AppError> {
    let (clause, values) = where_clause(table, user_id, filters)?;
    let conn = lock(pool)?;
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE {}", table.name(), clause),
        params_from_iter(values),
    )?;
    Ok(removed)
}
