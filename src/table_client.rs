//! Thin client for the hosted table store (`/rest/v1/{table}`).

use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::PersistError;
use crate::session::SessionHandle;

const UPSERT_PREFERENCE: &str = "resolution=merge-duplicates,return=minimal";

/// Equality filters plus an optional ordering column.
#[derive(Debug, Clone, Default)]
pub struct Query {
    filters: Vec<(String, String)>,
    order: Option<(String, bool)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push((column.to_string(), value.to_string()));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), true));
        self
    }

    fn apply(&self, url: &mut Url) {
        let mut pairs = url.query_pairs_mut();
        for (column, value) in &self.filters {
            pairs.append_pair(column, &format!("eq.{value}"));
        }
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            pairs.append_pair("order", &format!("{column}.{direction}"));
        }
    }
}

#[derive(Clone)]
pub struct TableClient {
    http: Client,
    base_url: String,
    api_key: String,
    session: SessionHandle,
}

impl TableClient {
    pub fn new(config: &RemoteConfig, session: SessionHandle) -> Self {
        TableClient {
            http: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.anon_key.clone(),
            session,
        }
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query,
    ) -> Result<Vec<T>, PersistError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("select", "*");
        query.apply(&mut url);

        let resp = self.authorized(self.http.get(url)).send().await?;
        let rows = check(resp).await?.json::<Vec<T>>().await?;
        debug!(table, count = rows.len(), "Selected rows");
        Ok(rows)
    }

    pub async fn insert<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<(), PersistError> {
        let url = self.table_url(table)?;
        let resp = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// Insert-or-update on the primary key in one call.
    pub async fn upsert<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<(), PersistError> {
        let url = self.table_url(table)?;
        let resp = self
            .authorized(self.http.post(url))
            .header("Prefer", UPSERT_PREFERENCE)
            .json(rows)
            .send()
            .await?;
        check(resp).await?;
        debug!(table, count = rows.len(), "Upserted rows");
        Ok(())
    }

    pub async fn update(&self, table: &str, query: &Query, patch: &Value) -> Result<(), PersistError> {
        let mut url = self.table_url(table)?;
        query.apply(&mut url);
        let resp = self
            .authorized(self.http.patch(url))
            .json(patch)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn delete(&self, table: &str, query: &Query) -> Result<(), PersistError> {
        let mut url = self.table_url(table)?;
        query.apply(&mut url);
        let resp = self.authorized(self.http.delete(url)).send().await?;
        check(resp).await?;
        Ok(())
    }

    fn table_url(&self, table: &str) -> Result<Url, PersistError> {
        Url::parse(&format!("{}/rest/v1/{}", self.base_url, table))
            .map_err(|e| PersistError::Network(format!("invalid url: {e}")))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self
            .session
            .access_token()
            .unwrap_or_else(|| self.api_key.clone());
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }
}

/// Map a non-success response onto the persistence error taxonomy.
pub(crate) async fn check(resp: Response) -> Result<Response, PersistError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = error_message(resp).await.unwrap_or_else(|| status.to_string());
    Err(match status.as_u16() {
        401 | 403 => PersistError::Unauthorized,
        400 | 404 | 409 | 422 => PersistError::Validation(message),
        code => PersistError::Server {
            status: code,
            message,
        },
    })
}

/// Pull `error` or `message` out of a JSON error payload.
pub(crate) async fn error_message(resp: Response) -> Option<String> {
    let body = resp.json::<Value>().await.ok()?;
    body.get("error")
        .or_else(|| body.get("message"))
        .or_else(|| body.get("error_description"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
