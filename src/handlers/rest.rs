use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::info;

use crate::db::{delete_rows, insert_rows, select_rows, update_rows, Filter, Order, Row, Table};
use crate::error::AppError;
use crate::middleware::AuthUser;
use crate::AppState;

/// Filters and ordering parsed from the query string.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RowQuery {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl RowQuery {
    pub fn parse(params: &[(String, String)]) -> Result<Self, AppError> {
        let mut query = RowQuery::default();
        for (key, value) in params {
            match key.as_str() {
                "select" => {
                    if value != "*" {
                        return Err(AppError::BadRequest("only select=* is supported".to_string()));
                    }
                }
                "order" => {
                    let (column, direction) = value.split_once('.').unwrap_or((value, "asc"));
                    let ascending = match direction {
                        "asc" => true,
                        "desc" => false,
                        _ => return Err(AppError::BadRequest(format!("invalid order {value}"))),
                    };
                    query.order = Some(Order {
                        column: column.to_string(),
                        ascending,
                    });
                }
                column => {
                    let Some(value) = value.strip_prefix("eq.") else {
                        return Err(AppError::BadRequest(format!(
                            "unsupported filter on {column}"
                        )));
                    };
                    query.filters.push(Filter {
                        column: column.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(query)
    }
}

/// Options from the `Prefer` header.
#[derive(Debug, Default, PartialEq, Eq)]
struct Preferences {
    merge_duplicates: bool,
    minimal: bool,
}

fn preferences(headers: &HeaderMap) -> Preferences {
    let mut prefs = Preferences::default();
    let options = headers
        .get_all("prefer")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim);
    for option in options {
        match option {
            "resolution=merge-duplicates" => prefs.merge_duplicates = true,
            "return=minimal" => prefs.minimal = true,
            _ => {}
        }
    }
    prefs
}

fn table(name: &str) -> Result<Table, AppError> {
    Table::from_name(name).ok_or(AppError::NotFound)
}

fn rows_from_body(body: Value) -> Result<Vec<Row>, AppError> {
    let not_rows = || AppError::BadRequest("body must be a row or an array of rows".to_string());
    match body {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                _ => Err(not_rows()),
            })
            .collect(),
        _ => Err(not_rows()),
    }
}

pub async fn select(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Row>>, AppError> {
    let table = table(&name)?;
    let query = RowQuery::parse(&params)?;
    let rows = select_rows(
        &state.db,
        table,
        &auth.user.id,
        &query.filters,
        query.order.as_ref(),
    )?;
    info!(table = table.name(), count = rows.len(), "Selected rows");
    Ok(Json(rows))
}

pub async fn insert(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let table = table(&name)?;
    let prefs = preferences(&headers);
    let rows = rows_from_body(body)?;
    let inserted = insert_rows(&state.db, table, &auth.user.id, &rows, prefs.merge_duplicates)?;
    info!(
        table = table.name(),
        count = inserted.len(),
        upsert = prefs.merge_duplicates,
        "Inserted rows"
    );

    if prefs.minimal {
        Ok(StatusCode::CREATED.into_response())
    } else {
        Ok((StatusCode::CREATED, Json(inserted)).into_response())
    }
}

pub async fn update(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    Json(patch): Json<Row>,
) -> Result<Json<Vec<Row>>, AppError> {
    let table = table(&name)?;
    let query = RowQuery::parse(&params)?;
    let rows = update_rows(&state.db, table, &auth.user.id, &query.filters, &patch)?;
    info!(table = table.name(), count = rows.len(), "Updated rows");
    Ok(Json(rows))
}

pub async fn delete(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, AppError> {
    let table = table(&name)?;
    let query = RowQuery::parse(&params)?;
    let removed = delete_rows(&state.db, table, &auth.user.id, &query.filters)?;
    info!(table = table.name(), count = removed, "Deleted rows");
    Ok(StatusCode::NO_CONTENT)
}
