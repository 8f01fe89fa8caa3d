use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Granularity, Persistence, Write};
use crate::error::PersistError;
use crate::kv::KeyValueStore;
use crate::models::AppData;
use crate::ordering;

pub const STORAGE_KEY: &str = "todo-pwa-data";

/// Whole-snapshot persistence in a single key of a local byte store.
#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        LocalStore { kv }
    }

    /// Read the saved snapshot. A missing, unreadable or malformed record
    /// yields empty state; the failure is only logged.
    pub fn read(&self) -> AppData {
        let raw = match self.kv.get(STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return AppData::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read local state");
                return AppData::default();
            }
        };

        let mut data: AppData = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to load state, starting empty");
                return AppData::default();
            }
        };

        // array order is authoritative locally
        ordering::renumber_lists(&mut data.lists);
        for list in &mut data.lists {
            ordering::renumber_active_tasks(&mut list.tasks);
        }
        debug!(lists = data.lists.len(), "Loaded local state");
        data
    }

    pub fn save(&self, data: &AppData) -> Result<(), PersistError> {
        let raw = serde_json::to_string(data).map_err(|e| PersistError::Decode(e.to_string()))?;
        self.kv.set(STORAGE_KEY, &raw)?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for LocalStore {
    fn granularity(&self) -> Granularity {
        Granularity::Snapshot
    }

    async fn load(&self) -> Result<AppData, PersistError> {
        Ok(self.read())
    }

    async fn write(&self, write: &Write) -> Result<(), PersistError> {
        match write {
            Write::Snapshot(data) => self.save(data),
            Write::Row(change) => {
                debug!(?change, "Local store ignores row change");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::models::{List, ListColor, Task};

    fn store() -> (LocalStore, MemoryKv) {
        let kv = MemoryKv::new();
        (LocalStore::new(Arc::new(kv.clone())), kv)
    }

    #[test]
    fn missing_record_is_empty_state() {
        let (local, _) = store();
        assert_eq!(local.read(), AppData::default());
    }

    #[test]
    fn corrupt_record_falls_back_to_empty_state() {
        let (local, kv) = store();
        kv.set(STORAGE_KEY, "{lists: [oops").unwrap();
        let data = local.read();
        assert!(data.lists.is_empty());
        assert!(data.current_list_id.is_none());
    }

    #[test]
    fn shape_mismatch_falls_back_to_empty_state() {
        let (local, kv) = store();
        kv.set(STORAGE_KEY, r#"{"lists":[{"id":1}],"currentListId":null}"#)
            .unwrap();
        assert_eq!(local.read(), AppData::default());
    }

    #[test]
    fn empty_record_loads() {
        let (local, kv) = store();
        kv.set(STORAGE_KEY, r#"{"lists":[],"currentListId":null}"#)
            .unwrap();
        assert_eq!(local.read(), AppData::default());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_write() {
        let (local, _) = store();
        let mut list = List::new("Work", ListColor::Slate);
        list.tasks.push(Task::new("Review"));
        let data = AppData {
            current_list_id: Some(list.id.clone()),
            lists: vec![list],
        };

        local.write(&Write::Snapshot(data.clone())).await.unwrap();
        assert_eq!(local.load().await.unwrap(), data);
    }

    #[test]
    fn positions_are_rebuilt_from_array_order() {
        let (local, kv) = store();
        kv.set(
            STORAGE_KEY,
            r##"{"lists":[
                {"id":"a","name":"A","color":"#FFB74D","createdAt":1,"tasks":[
                    {"id":"t1","content":"one","completed":false,"createdAt":1,"completedAt":null},
                    {"id":"t2","content":"two","completed":true,"createdAt":2,"completedAt":3},
                    {"id":"t3","content":"three","completed":false,"createdAt":4,"completedAt":null}]},
                {"id":"b","name":"B","color":"#9575CD","createdAt":2,"tasks":[]}],
              "currentListId":"a"}"##,
        )
        .unwrap();

        let data = local.read();
        assert_eq!(data.lists[1].position, 1);
        let positions: Vec<i64> = data.lists[0].tasks.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 0, 1]);
        assert_eq!(data.current_list_id.as_deref(), Some("a"));
    }
}
