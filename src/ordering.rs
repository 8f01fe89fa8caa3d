//! Position bookkeeping for lists and tasks.
//!
//! Lists are ordered by `position` across the whole collection. Tasks carry a
//! `position` among the *active* tasks of their list only; completed tasks
//! keep whatever position they had and are displayed by `completed_at`.

use crate::models::{List, Task};

/// Remove the item at `from` and reinsert it at `to`, where `to` indexes the
/// collection after the removal. Returns `false` when `from` is out of range.
pub fn splice_move<T>(items: &mut Vec<T>, from: usize, to: usize) -> bool {
    if from >= items.len() {
        return false;
    }
    let item = items.remove(from);
    let to = to.min(items.len());
    items.insert(to, item);
    true
}

/// Assign every list its 0-based index as position.
pub fn renumber_lists(lists: &mut [List]) {
    for (index, list) in lists.iter_mut().enumerate() {
        list.position = index as i64;
    }
}

/// Assign active tasks their 0-based index among active tasks. Completed tasks are untouched.
pub fn renumber_active_tasks(tasks: &mut [Task]) {
    for (index, task) in tasks.iter_mut().filter(|t| !t.completed).enumerate() {
        task.position = index as i64;
    }
}

/// Whether active task positions strictly increase in array order.
pub fn active_positions_ordered(tasks: &[Task]) -> bool {
    let mut active = tasks.iter().filter(|t| !t.completed).map(|t| t.position);
    let Some(mut previous) = active.next() else {
        return true;
    };
    for position in active {
        if position <= previous {
            return false;
        }
        previous = position;
    }
    true
}

/// Position for a list appended after the current last one.
pub fn next_list_position(lists: &[List]) -> i64 {
    lists.last().map(|l| l.position + 1).unwrap_or(0)
}

pub fn reorder_lists(lists: &mut Vec<List>, from: usize, to: usize) -> bool {
    if !splice_move(lists, from, to) {
        return false;
    }
    renumber_lists(lists);
    true
}

/// Reorder within the active tasks of `list`. `from` and `to` index the active
/// tasks only. The list's tasks end up as active tasks followed by completed ones.
pub fn reorder_active_tasks(list: &mut List, from: usize, to: usize) -> bool {
    if from >= list.active_tasks().count() {
        return false;
    }
    let (mut active, completed): (Vec<Task>, Vec<Task>) =
        std::mem::take(&mut list.tasks).into_iter().partition(|t| !t.completed);

    let moved = splice_move(&mut active, from, to);
    active.extend(completed);
    list.tasks = active;

    if moved {
        renumber_active_tasks(&mut list.tasks);
    }
    moved
}

/// Move a task to the head of another list and renumber both lists.
pub fn move_task_between_lists(
    lists: &mut [List],
    task_id: &str,
    from_list_id: &str,
    to_list_id: &str,
) -> bool {
    if from_list_id == to_list_id {
        return false;
    }
    let Some(from_idx) = lists.iter().position(|l| l.id == from_list_id) else {
        return false;
    };
    let Some(to_idx) = lists.iter().position(|l| l.id == to_list_id) else {
        return false;
    };
    let Some(task_idx) = lists[from_idx].tasks.iter().position(|t| t.id == task_id) else {
        return false;
    };

    let task = lists[from_idx].tasks.remove(task_idx);
    lists[to_idx].tasks.insert(0, task);

    renumber_active_tasks(&mut lists[from_idx].tasks);
    renumber_active_tasks(&mut lists[to_idx].tasks);
    true
}
