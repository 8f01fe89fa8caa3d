//! Persistence capability with a local and a remote implementation.
//!
//! The local variant stores the whole snapshot as one blob; the remote variant
//! maps every change onto single-row calls against the table store, except
//! position upserts which are batched.

pub mod local;
pub mod remote;

use async_trait::async_trait;

use crate::error::PersistError;
use crate::models::{AppData, List, ListColor, Task};

pub use local::LocalStore;
pub use remote::RemoteStore;

/// Which unit of state a backend wants written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Snapshot,
    Row,
}

/// A single remote delta produced by a store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InsertList(List),
    UpdateList {
        id: String,
        name: String,
        color: ListColor,
    },
    DeleteList {
        id: String,
    },
    /// Full rows of every list, carrying renumbered positions.
    UpsertLists(Vec<List>),
    InsertTask {
        list_id: String,
        task: Task,
    },
    UpdateTask {
        id: String,
        patch: TaskPatch,
    },
    DeleteTask {
        id: String,
    },
    /// Full rows of the tasks currently owned by `list_id`.
    UpsertTasks {
        list_id: String,
        tasks: Vec<Task>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub content: Option<String>,
    pub completed: Option<bool>,
    /// Outer `Some` means the field is written; inner `None` clears it.
    pub completed_at: Option<Option<i64>>,
}

impl TaskPatch {
    pub fn completion(task: &Task) -> Self {
        TaskPatch {
            completed: Some(task.completed),
            completed_at: Some(task.completed_at),
            ..Default::default()
        }
    }

    pub fn content(content: &str) -> Self {
        TaskPatch {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }
}

/// Collection a positional write covers. A newer write with the same key
/// supersedes an older one that has not started yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoalesceKey {
    Snapshot,
    ListPositions,
    TaskPositions(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Snapshot(AppData),
    Row(Change),
}

impl Write {
    pub fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self {
            Write::Snapshot(_) => Some(CoalesceKey::Snapshot),
            Write::Row(Change::UpsertLists(_)) => Some(CoalesceKey::ListPositions),
            Write::Row(Change::UpsertTasks { list_id, .. }) => {
                Some(CoalesceKey::TaskPositions(list_id.clone()))
            }
            Write::Row(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Write::Snapshot(_) => "snapshot",
            Write::Row(Change::InsertList(_)) => "insert_list",
            Write::Row(Change::UpdateList { .. }) => "update_list",
            Write::Row(Change::DeleteList { .. }) => "delete_list",
            Write::Row(Change::UpsertLists(_)) => "upsert_lists",
            Write::Row(Change::InsertTask { .. }) => "insert_task",
            Write::Row(Change::UpdateTask { .. }) => "update_task",
            Write::Row(Change::DeleteTask { .. }) => "delete_task",
            Write::Row(Change::UpsertTasks { .. }) => "upsert_tasks",
        }
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    fn granularity(&self) -> Granularity;

    /// Whether writes are reported through the sync status indicator.
    fn reports_status(&self) -> bool {
        self.granularity() == Granularity::Row
    }

    async fn load(&self) -> Result<AppData, PersistError>;

    async fn write(&self, write: &Write) -> Result<(), PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_writes_coalesce_per_collection() {
        let a = Write::Row(Change::UpsertTasks {
            list_id: "a".into(),
            tasks: vec![],
        });
        let b = Write::Row(Change::UpsertTasks {
            list_id: "b".into(),
            tasks: vec![],
        });
        assert_ne!(a.coalesce_key(), b.coalesce_key());
        assert_eq!(
            Write::Row(Change::UpsertLists(vec![])).coalesce_key(),
            Some(CoalesceKey::ListPositions)
        );
        assert_eq!(
            Write::Row(Change::DeleteTask { id: "t".into() }).coalesce_key(),
            None
        );
    }
}
