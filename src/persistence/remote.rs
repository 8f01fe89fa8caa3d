use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{Change, Granularity, Persistence, TaskPatch, Write};
use crate::error::PersistError;
use crate::models::{AppData, List, ListColor, ListRow, TaskRow};
use crate::session::SessionHandle;
use crate::table_client::{Query, TableClient};

const LISTS: &str = "lists";
const TASKS: &str = "tasks";

/// Row-level persistence against the hosted table store, scoped by the
/// signed-in user.
#[derive(Clone)]
pub struct RemoteStore {
    client: TableClient,
    session: SessionHandle,
}

impl RemoteStore {
    pub fn new(client: TableClient, session: SessionHandle) -> Self {
        RemoteStore { client, session }
    }

    fn user_id(&self) -> Result<String, PersistError> {
        self.session.user_id().ok_or(PersistError::Unauthorized)
    }

    async fn apply(&self, change: &Change) -> Result<(), PersistError> {
        let user_id = self.user_id()?;
        match change {
            Change::InsertList(list) => {
                self.client
                    .insert(LISTS, &[ListRow::from_list(list, &user_id)])
                    .await
            }
            Change::UpdateList { id, name, color } => {
                let patch = json!({ "name": name, "color": color.hex() });
                self.client
                    .update(LISTS, &Query::new().eq("id", id), &patch)
                    .await
            }
            Change::DeleteList { id } => self.client.delete(LISTS, &Query::new().eq("id", id)).await,
            Change::UpsertLists(lists) => {
                let rows: Vec<ListRow> = lists
                    .iter()
                    .map(|l| ListRow::from_list(l, &user_id))
                    .collect();
                self.client.upsert(LISTS, &rows).await
            }
            Change::InsertTask { list_id, task } => {
                self.client
                    .insert(TASKS, &[TaskRow::from_task(task, list_id, &user_id)])
                    .await
            }
            Change::UpdateTask { id, patch } => {
                self.client
                    .update(TASKS, &Query::new().eq("id", id), &patch_body(patch))
                    .await
            }
            Change::DeleteTask { id } => self.client.delete(TASKS, &Query::new().eq("id", id)).await,
            Change::UpsertTasks { list_id, tasks } => {
                if tasks.is_empty() {
                    return Ok(());
                }
                let rows: Vec<TaskRow> = tasks
                    .iter()
                    .map(|t| TaskRow::from_task(t, list_id, &user_id))
                    .collect();
                self.client.upsert(TASKS, &rows).await
            }
        }
    }
}

fn patch_body(patch: &TaskPatch) -> Value {
    let mut body = Map::new();
    if let Some(content) = &patch.content {
        body.insert("content".into(), json!(content));
    }
    if let Some(completed) = patch.completed {
        body.insert("completed".into(), json!(completed));
    }
    if let Some(completed_at) = patch.completed_at {
        body.insert("completed_at".into(), json!(completed_at));
    }
    Value::Object(body)
}

/// Rebuild the list tree from rows already ordered by position.
pub fn assemble(list_rows: Vec<ListRow>, task_rows: Vec<TaskRow>) -> Vec<List> {
    let mut lists: Vec<List> = list_rows
        .into_iter()
        .map(|row| {
            let color = row.color.parse().unwrap_or_else(|_| {
                warn!(list_id = %row.id, color = %row.color, "Unknown list color, using default");
                ListColor::default()
            });
            List {
                id: row.id,
                name: row.name,
                color,
                position: row.position,
                created_at: row.created_at,
                tasks: Vec::new(),
            }
        })
        .collect();

    let index: HashMap<String, usize> = lists
        .iter()
        .enumerate()
        .map(|(i, l)| (l.id.clone(), i))
        .collect();

    for row in task_rows {
        match index.get(&row.list_id) {
            Some(&i) => lists[i].tasks.push(row.into_task()),
            None => debug!(task_id = %row.id, list_id = %row.list_id, "Dropping orphaned task"),
        }
    }
    lists
}

#[async_trait]
impl Persistence for RemoteStore {
    fn granularity(&self) -> Granularity {
        Granularity::Row
    }

    async fn load(&self) -> Result<AppData, PersistError> {
        let user_id = self.user_id()?;
        let list_rows: Vec<ListRow> = self
            .client
            .select(LISTS, &Query::new().eq("user_id", &user_id).order_asc("position"))
            .await?;
        let task_rows: Vec<TaskRow> = self
            .client
            .select(TASKS, &Query::new().eq("user_id", &user_id).order_asc("position"))
            .await?;

        Ok(AppData {
            lists: assemble(list_rows, task_rows),
            current_list_id: None,
        })
    }

    async fn write(&self, write: &Write) -> Result<(), PersistError> {
        match write {
            Write::Row(change) => self.apply(change).await,
            Write::Snapshot(_) => {
                debug!("Remote store ignores snapshot write");
                Ok(())
            }
        }
    }
}
