//! In-memory lists and tasks. No I/O happens here; every mutation is
//! synchronous and leaves list and task positions consistent.

use tracing::debug;

use crate::error::ValidationError;
use crate::models::{now_millis, AppData, List, ListColor, Task, User};
use crate::ordering;

#[derive(Debug, Clone, PartialEq)]
pub struct Toggled {
    pub list_id: String,
    pub task: Task,
    /// Unchecking left active positions out of array order, so every active
    /// task of the list was renumbered and needs writing back.
    pub renumbered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    data: AppData,
    user: Option<User>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: AppData) -> Self {
        let mut store = Store { data, user: None };
        store.drop_dangling_current_list();
        store
    }

    pub fn data(&self) -> &AppData {
        &self.data
    }

    pub fn lists(&self) -> &[List] {
        &self.data.lists
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, user: Option<User>) {
        self.user = user;
    }

    pub fn current_list_id(&self) -> Option<&str> {
        self.data.current_list_id.as_deref()
    }

    pub fn current_list(&self) -> Option<&List> {
        self.current_list_id().and_then(|id| self.find_list(id))
    }

    /// Select the list being viewed. Unknown ids are ignored.
    pub fn set_current_list(&mut self, list_id: Option<&str>) -> bool {
        match list_id {
            Some(id) if self.find_list(id).is_none() => false,
            other => {
                self.data.current_list_id = other.map(str::to_string);
                true
            }
        }
    }

    pub fn find_list(&self, list_id: &str) -> Option<&List> {
        self.data.lists.iter().find(|l| l.id == list_id)
    }

    fn find_list_mut(&mut self, list_id: &str) -> Option<&mut List> {
        self.data.lists.iter_mut().find(|l| l.id == list_id)
    }

    /// Find a task anywhere, together with its owning list.
    pub fn find_task(&self, task_id: &str) -> Option<(&List, &Task)> {
        self.data.lists.iter().find_map(|list| {
            list.tasks
                .iter()
                .find(|t| t.id == task_id)
                .map(|task| (list, task))
        })
    }

    fn find_task_mut(&mut self, task_id: &str) -> Option<(&mut List, usize)> {
        self.data.lists.iter_mut().find_map(|list| {
            let idx = list.tasks.iter().position(|t| t.id == task_id)?;
            Some((list, idx))
        })
    }

    /// Empty for an unknown list.
    pub fn active_tasks(&self, list_id: &str) -> Vec<&Task> {
        self.find_list(list_id)
            .map(|l| l.active_tasks().collect())
            .unwrap_or_default()
    }

    /// Completed tasks of a list, most recently completed first.
    pub fn completed_tasks(&self, list_id: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .find_list(list_id)
            .map(|l| l.completed_tasks().collect())
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        tasks
    }

    pub fn insert_list(&mut self, name: &str, color: ListColor) -> Result<&List, ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let mut list = List::new(name, color);
        list.position = ordering::next_list_position(&self.data.lists);
        debug!(list_id = %list.id, position = list.position, "Inserted list");
        self.data.lists.push(list);
        Ok(&self.data.lists[self.data.lists.len() - 1])
    }

    /// Rename and recolor a list. `Ok(None)` when the list does not exist.
    pub fn update_list(
        &mut self,
        list_id: &str,
        name: &str,
        color: ListColor,
    ) -> Result<Option<&List>, ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let Some(list) = self.find_list_mut(list_id) else {
            return Ok(None);
        };
        list.name = name.trim().to_string();
        list.color = color;
        Ok(Some(&*list))
    }

    /// Remove a list and all of its tasks. Positions of the remaining lists stay ordered.
    pub fn remove_list(&mut self, list_id: &str) -> Option<List> {
        let idx = self.data.lists.iter().position(|l| l.id == list_id)?;
        let list = self.data.lists.remove(idx);
        if self.data.current_list_id.as_deref() == Some(list_id) {
            self.data.current_list_id = None;
        }
        Some(list)
    }

    pub fn reorder_lists(&mut self, from: usize, to: usize) -> bool {
        ordering::reorder_lists(&mut self.data.lists, from, to)
    }

    /// Prepend a task to a list. `Ok(None)` when the list does not exist.
    pub fn insert_task(
        &mut self,
        list_id: &str,
        content: &str,
    ) -> Result<Option<&Task>, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let Some(list) = self.find_list_mut(list_id) else {
            return Ok(None);
        };
        list.tasks.insert(0, Task::new(content));
        ordering::renumber_active_tasks(&mut list.tasks);
        Ok(list.tasks.first())
    }

    pub fn edit_task(
        &mut self,
        task_id: &str,
        content: &str,
    ) -> Result<Option<&Task>, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let Some((list, idx)) = self.find_task_mut(task_id) else {
            return Ok(None);
        };
        list.tasks[idx].content = content.trim().to_string();
        Ok(Some(&list.tasks[idx]))
    }

    /// Flip completion. Completing stamps `completed_at`; un-completing clears it
    /// and renumbers the active tasks only if the returning task breaks their order.
    pub fn toggle_task(&mut self, task_id: &str) -> Option<Toggled> {
        let (list, idx) = self.find_task_mut(task_id)?;
        let task = &mut list.tasks[idx];
        task.completed = !task.completed;
        task.completed_at = if task.completed { Some(now_millis()) } else { None };

        let renumbered = !task.completed && !ordering::active_positions_ordered(&list.tasks);
        if renumbered {
            ordering::renumber_active_tasks(&mut list.tasks);
        }

        Some(Toggled {
            list_id: list.id.clone(),
            task: list.tasks[idx].clone(),
            renumbered,
        })
    }

    /// Remove a task, returning its former list id.
    pub fn remove_task(&mut self, task_id: &str) -> Option<(String, Task)> {
        let (list, idx) = self.find_task_mut(task_id)?;
        let task = list.tasks.remove(idx);
        Some((list.id.clone(), task))
    }

    pub fn reorder_tasks(&mut self, list_id: &str, from: usize, to: usize) -> bool {
        match self.find_list_mut(list_id) {
            Some(list) => ordering::reorder_active_tasks(list, from, to),
            None => false,
        }
    }

    pub fn move_task(&mut self, task_id: &str, from_list_id: &str, to_list_id: &str) -> bool {
        ordering::move_task_between_lists(&mut self.data.lists, task_id, from_list_id, to_list_id)
    }

    /// Swap in a freshly loaded collection, keeping the open list if it still exists.
    pub fn replace_lists(&mut self, lists: Vec<List>) {
        self.data.lists = lists;
        self.drop_dangling_current_list();
    }

    pub fn clear_lists(&mut self) {
        self.data.lists.clear();
        self.data.current_list_id = None;
    }

    fn drop_dangling_current_list(&mut self) {
        if let Some(id) = self.data.current_list_id.clone() {
            if self.find_list(&id).is_none() {
                self.data.current_list_id = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_list(name: &str) -> (Store, String) {
        let mut store = Store::new();
        let id = store.insert_list(name, ListColor::Coral).unwrap().id.clone();
        (store, id)
    }

    #[test]
    fn empty_names_are_refused() {
        let mut store = Store::new();
        assert_eq!(
            store.insert_list("   ", ListColor::Sky).unwrap_err(),
            ValidationError::EmptyName
        );
        assert!(store.lists().is_empty());
    }

    #[test]
    fn new_lists_append_with_increasing_positions() {
        let mut store = Store::new();
        store.insert_list("One", ListColor::Coral).unwrap();
        store.insert_list("  Two ", ListColor::Amber).unwrap();
        let names: Vec<&str> = store.lists().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["One", "Two"]);
        assert_eq!(store.lists()[1].position, 1);
    }

    #[test]
    fn empty_content_is_refused() {
        let (mut store, id) = store_with_list("Home");
        assert_eq!(
            store.insert_task(&id, "  ").unwrap_err(),
            ValidationError::EmptyContent
        );
        assert!(store.find_list(&id).unwrap().tasks.is_empty());
    }

    #[test]
    fn tasks_are_prepended() {
        let (mut store, id) = store_with_list("Home");
        store.insert_task(&id, "first").unwrap();
        store.insert_task(&id, "second").unwrap();
        let active: Vec<(&str, i64)> = store
            .active_tasks(&id)
            .iter()
            .map(|t| (t.content.as_str(), t.position))
            .collect();
        assert_eq!(active, vec![("second", 0), ("first", 1)]);
    }

    #[test]
    fn task_on_missing_list_is_none() {
        let mut store = Store::new();
        assert!(store.insert_task("nope", "x").unwrap().is_none());
    }

    #[test]
    fn toggle_twice_restores_task() {
        let (mut store, id) = store_with_list("Home");
        store.insert_task(&id, "a").unwrap();
        let task_id = store.insert_task(&id, "b").unwrap().unwrap().id.clone();
        let before = store.find_task(&task_id).unwrap().1.clone();

        let done = store.toggle_task(&task_id).unwrap();
        assert!(done.task.completed);
        assert!(done.task.completed_at.is_some());

        let undone = store.toggle_task(&task_id).unwrap();
        assert!(!undone.renumbered);
        assert_eq!(store.find_task(&task_id).unwrap().1, &before);
    }

    #[test]
    fn uncompleting_after_reorder_renumbers() {
        let (mut store, id) = store_with_list("Home");
        for name in ["c", "b", "a"] {
            store.insert_task(&id, name).unwrap();
        }
        let a = store.active_tasks(&id)[0].id.clone();
        store.toggle_task(&a).unwrap();
        // a keeps its stale position 0 while completed
        assert!(store.reorder_tasks(&id, 1, 0));
        let toggled = store.toggle_task(&a).unwrap();
        assert!(toggled.renumbered);
        let positions: Vec<i64> = store.active_tasks(&id).iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn completed_tasks_sort_most_recent_first() {
        let (mut store, id) = store_with_list("Home");
        let a = store.insert_task(&id, "a").unwrap().unwrap().id.clone();
        let b = store.insert_task(&id, "b").unwrap().unwrap().id.clone();
        store.toggle_task(&a).unwrap();
        store.toggle_task(&b).unwrap();
        // force distinct stamps
        for list in &mut store.data.lists {
            for task in &mut list.tasks {
                task.completed_at = Some(if task.id == a { 10 } else { 20 });
            }
        }
        let completed: Vec<&str> = store
            .completed_tasks(&id)
            .iter()
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(completed, vec!["b", "a"]);
    }

    #[test]
    fn removing_current_list_clears_selection() {
        let (mut store, id) = store_with_list("Home");
        assert!(store.set_current_list(Some(&id)));
        assert!(store.remove_list(&id).is_some());
        assert!(store.current_list_id().is_none());
    }

    #[test]
    fn selecting_unknown_list_is_refused() {
        let (mut store, _) = store_with_list("Home");
        assert!(!store.set_current_list(Some("missing")));
        assert!(store.current_list_id().is_none());
    }

    #[test]
    fn replace_keeps_current_list_only_if_present() {
        let (mut store, id) = store_with_list("Home");
        store.set_current_list(Some(&id));
        let kept = store.lists().to_vec();
        store.replace_lists(kept);
        assert_eq!(store.current_list_id(), Some(id.as_str()));
        store.replace_lists(Vec::new());
        assert!(store.current_list_id().is_none());
    }

    #[test]
    fn groceries_scenario() {
        let mut store = Store::new();
        let list_id = store
            .insert_list("Groceries", "#E57373".parse().unwrap())
            .unwrap()
            .id
            .clone();
        let milk = store.insert_task(&list_id, "Milk").unwrap().unwrap().id.clone();
        store.insert_task(&list_id, "Eggs").unwrap();
        store.toggle_task(&milk).unwrap();

        let active: Vec<&str> = store
            .active_tasks(&list_id)
            .iter()
            .map(|t| t.content.as_str())
            .collect();
        let completed = store.completed_tasks(&list_id);
        assert_eq!(active, vec!["Eggs"]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].content, "Milk");
        assert!(completed[0].completed_at.is_some());
    }
}
