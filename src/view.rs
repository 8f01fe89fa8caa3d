//! Display-ready queries for a rendering layer.

use time::{Duration, OffsetDateTime};

use crate::models::{ListColor, Task};
use crate::store::Store;

const PREVIEW_LEN: usize = 3;

pub const NO_ACTIVE_TASKS: &str = "No active tasks";

#[derive(Debug, Clone, PartialEq)]
pub struct ListCard {
    pub id: String,
    pub name: String,
    pub color: ListColor,
    pub count_label: String,
    /// Contents of the first active tasks.
    pub preview: Vec<String>,
    /// `+N more` when there are more active tasks than the preview shows.
    pub more: Option<String>,
}

impl ListCard {
    /// Text shown in place of the preview when the list has no active tasks.
    pub fn placeholder(&self) -> Option<&'static str> {
        self.preview.is_empty().then_some(NO_ACTIVE_TASKS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HomeView {
    pub cards: Vec<ListCard>,
}

impl HomeView {
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    pub task: Task,
    pub completed_label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListDetail {
    pub id: String,
    pub name: String,
    pub color: ListColor,
    pub active: Vec<Task>,
    pub completed: Vec<CompletedTask>,
}

pub fn task_count_label(count: usize) -> String {
    if count == 1 {
        "1 task".to_string()
    } else {
        format!("{count} tasks")
    }
}

pub fn home(store: &Store) -> HomeView {
    let cards = store
        .lists()
        .iter()
        .map(|list| {
            let active: Vec<&Task> = list.active_tasks().collect();
            let more = active.len().saturating_sub(PREVIEW_LEN);
            ListCard {
                id: list.id.clone(),
                name: list.name.clone(),
                color: list.color,
                count_label: task_count_label(active.len()),
                preview: active
                    .iter()
                    .take(PREVIEW_LEN)
                    .map(|t| t.content.clone())
                    .collect(),
                more: (more > 0).then(|| format!("+{more} more")),
            }
        })
        .collect();
    HomeView { cards }
}

pub fn list_detail(store: &Store, list_id: &str, now: OffsetDateTime) -> Option<ListDetail> {
    let list = store.find_list(list_id)?;
    Some(ListDetail {
        id: list.id.clone(),
        name: list.name.clone(),
        color: list.color,
        active: store.active_tasks(list_id).into_iter().cloned().collect(),
        completed: store
            .completed_tasks(list_id)
            .into_iter()
            .map(|task| CompletedTask {
                completed_label: task
                    .completed_at
                    .map(|ts| format_completed_at(ts, now))
                    .unwrap_or_default(),
                task: task.clone(),
            })
            .collect(),
    })
}

/// Confirmation text shown before deleting a list.
pub fn delete_prompt(store: &Store, list_id: &str) -> Option<String> {
    let list = store.find_list(list_id)?;
    let count = list.tasks.len();
    Some(if count > 0 {
        format!(
            "This will delete \"{}\" and all {} in it.",
            list.name,
            task_count_label(count)
        )
    } else {
        format!("This will delete \"{}\".", list.name)
    })
}

/// List that quick add puts new tasks into; `None` means a list must be created first.
pub fn quick_add_target(store: &Store) -> Option<&str> {
    store.lists().first().map(|l| l.id.as_str())
}

/// Relative label for a completion time, in the offset of `now`.
pub fn format_completed_at(millis: i64, now: OffsetDateTime) -> String {
    let Ok(at) = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000) else {
        return String::new();
    };
    let at = at.to_offset(now.offset());
    let age = now - at;

    if at.date() == now.date() {
        return format!("Today at {}", clock(at));
    }
    if now.date().previous_day() == Some(at.date()) {
        return format!("Yesterday at {}", clock(at));
    }
    if age < Duration::days(7) {
        return format!("{} at {}", at.weekday(), clock(at));
    }
    let month = at.month().to_string();
    format!("{} {}", &month[..3], at.day())
}

fn clock(at: OffsetDateTime) -> String {
    let hour = match at.hour() % 12 {
        0 => 12,
        h => h,
    };
    let meridiem = if at.hour() < 12 { "AM" } else { "PM" };
    format!("{hour}:{:02} {meridiem}", at.minute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str) -> OffsetDateTime {
        // "YYYY-MM-DD HH:MM" in UTC
        let (day, time) = date.split_once(' ').unwrap();
        let mut d = day.split('-').map(|p| p.parse::<i32>().unwrap());
        let mut t = time.split(':').map(|p| p.parse::<u8>().unwrap());
        let date = time::Date::from_calendar_date(
            d.next().unwrap(),
            time::Month::try_from(d.next().unwrap() as u8).unwrap(),
            d.next().unwrap() as u8,
        )
        .unwrap();
        date.with_hms(t.next().unwrap(), t.next().unwrap(), 0)
            .unwrap()
            .assume_utc()
    }

    fn millis(dt: OffsetDateTime) -> i64 {
        (dt.unix_timestamp_nanos() / 1_000_000) as i64
    }

    #[test]
    fn empty_store_renders_empty_home() {
        let view = home(&Store::new());
        assert!(view.is_empty());
        assert!(quick_add_target(&Store::new()).is_none());
    }

    #[test]
    fn card_counts_and_previews_active_tasks() {
        let mut store = Store::new();
        let id = store.insert_list("Chores", ListColor::Sage).unwrap().id.clone();
        for name in ["e", "d", "c", "b", "a"] {
            store.insert_task(&id, name).unwrap();
        }
        let done = store.active_tasks(&id)[4].id.clone();
        store.toggle_task(&done).unwrap();

        let card = &home(&store).cards[0];
        assert_eq!(card.count_label, "4 tasks");
        assert_eq!(card.preview, vec!["a", "b", "c"]);
        assert_eq!(card.more.as_deref(), Some("+1 more"));
        assert!(card.placeholder().is_none());
    }

    #[test]
    fn card_without_active_tasks_shows_placeholder() {
        let mut store = Store::new();
        let id = store.insert_list("Done", ListColor::Teal).unwrap().id.clone();
        let task = store.insert_task(&id, "all of it").unwrap().unwrap().id.clone();
        store.toggle_task(&task).unwrap();

        let card = &home(&store).cards[0];
        assert_eq!(card.count_label, "0 tasks");
        assert_eq!(card.placeholder(), Some(NO_ACTIVE_TASKS));
    }

    #[test]
    fn groceries_card_shows_one_task() {
        let mut store = Store::new();
        let id = store
            .insert_list("Groceries", ListColor::Coral)
            .unwrap()
            .id
            .clone();
        let milk = store.insert_task(&id, "Milk").unwrap().unwrap().id.clone();
        store.insert_task(&id, "Eggs").unwrap();
        store.toggle_task(&milk).unwrap();

        let card = &home(&store).cards[0];
        assert_eq!(card.count_label, "1 task");
        assert_eq!(card.preview, vec!["Eggs"]);
        assert!(card.more.is_none());

        let detail = list_detail(&store, &id, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(detail.completed.len(), 1);
        assert!(detail.completed[0].completed_label.starts_with("Today at "));
    }

    #[test]
    fn delete_prompt_mentions_task_count() {
        let mut store = Store::new();
        let id = store.insert_list("Work", ListColor::Slate).unwrap().id.clone();
        assert_eq!(
            delete_prompt(&store, &id).unwrap(),
            "This will delete \"Work\"."
        );
        store.insert_task(&id, "Report").unwrap();
        assert_eq!(
            delete_prompt(&store, &id).unwrap(),
            "This will delete \"Work\" and all 1 task in it."
        );
    }

    #[test]
    fn completion_labels_are_relative() {
        let now = at("2024-03-14 18:30");
        assert_eq!(
            format_completed_at(millis(at("2024-03-14 15:07")), now),
            "Today at 3:07 PM"
        );
        assert_eq!(
            format_completed_at(millis(at("2024-03-13 00:05")), now),
            "Yesterday at 12:05 AM"
        );
        assert_eq!(
            format_completed_at(millis(at("2024-03-10 09:00")), now),
            "Sunday at 9:00 AM"
        );
        assert_eq!(format_completed_at(millis(at("2024-03-05 09:00")), now), "Mar 5");
    }
}
