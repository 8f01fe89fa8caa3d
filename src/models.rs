use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// The fixed palette a list can be tagged with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ListColor {
    #[default]
    Coral,
    Amber,
    Sage,
    Sky,
    Lavender,
    Rose,
    Teal,
    Slate,
}

impl ListColor {
    pub const ALL: [ListColor; 8] = [
        ListColor::Coral,
        ListColor::Amber,
        ListColor::Sage,
        ListColor::Sky,
        ListColor::Lavender,
        ListColor::Rose,
        ListColor::Teal,
        ListColor::Slate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ListColor::Coral => "coral",
            ListColor::Amber => "amber",
            ListColor::Sage => "sage",
            ListColor::Sky => "sky",
            ListColor::Lavender => "lavender",
            ListColor::Rose => "rose",
            ListColor::Teal => "teal",
            ListColor::Slate => "slate",
        }
    }

    pub fn hex(self) -> &'static str {
        match self {
            ListColor::Coral => "#E57373",
            ListColor::Amber => "#FFB74D",
            ListColor::Sage => "#81C784",
            ListColor::Sky => "#64B5F6",
            ListColor::Lavender => "#9575CD",
            ListColor::Rose => "#F06292",
            ListColor::Teal => "#4DB6AC",
            ListColor::Slate => "#78909C",
        }
    }
}

impl fmt::Display for ListColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown list color: {0}")]
pub struct UnknownColor(pub String);

/// Accepts either the hex value (any case) or the palette name.
impl FromStr for ListColor {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ListColor::ALL
            .into_iter()
            .find(|c| c.hex().eq_ignore_ascii_case(s) || c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownColor(s.to_string()))
    }
}

impl Serialize for ListColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.hex())
    }
}

impl<'de> Deserialize<'de> for ListColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub content: String,
    pub completed: bool,
    #[serde(default)]
    pub position: i64,
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(content: &str) -> Self {
        Task {
            id: new_id(),
            content: content.trim().to_string(),
            completed: false,
            position: 0,
            created_at: now_millis(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: String,
    pub name: String,
    pub color: ListColor,
    #[serde(default)]
    pub position: i64,
    pub created_at: i64,
    pub tasks: Vec<Task>,
}

impl List {
    pub fn new(name: &str, color: ListColor) -> Self {
        List {
            id: new_id(),
            name: name.trim().to_string(),
            color,
            position: 0,
            created_at: now_millis(),
            tasks: Vec::new(),
        }
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.completed)
    }

    pub fn completed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.completed)
    }
}

/// The persisted part of the application state.
///
/// This is also the shape of the local storage record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    pub lists: Vec<List>,
    pub current_list_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Tokens issued by the auth API together with the user they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Row of the remote `lists` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub position: i64,
    pub created_at: i64,
}

impl ListRow {
    pub fn from_list(list: &List, user_id: &str) -> Self {
        ListRow {
            id: list.id.clone(),
            user_id: user_id.to_string(),
            name: list.name.clone(),
            color: list.color.hex().to_string(),
            position: list.position,
            created_at: list.created_at,
        }
    }
}

/// Row of the remote `tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub list_id: String,
    pub user_id: String,
    pub content: String,
    pub completed: bool,
    pub position: i64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl TaskRow {
    pub fn from_task(task: &Task, list_id: &str, user_id: &str) -> Self {
        TaskRow {
            id: task.id.clone(),
            list_id: list_id.to_string(),
            user_id: user_id.to_string(),
            content: task.content.clone(),
            completed: task.completed,
            position: task.position,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            content: self.content,
            completed: self.completed,
            position: self.position,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

// Backend request bodies

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub user: User,
    pub session: Option<AuthSession>,
}

/// Backend-side session record.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub expires_at: i64,
}

/// Backend-side user record.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: i64,
}

impl StoredUser {
    pub fn public(&self) -> User {
        User {
            id: self.id.clone(),
            email: self.email.clone(),
            created_at: self.created_at,
        }
    }
}

/// Client-generated identifier: base-36 millisecond clock followed by random characters.
pub fn new_id() -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut millis = now_millis().max(0) as u64;
    let mut clock = Vec::new();
    while millis > 0 {
        clock.push(CHARSET[(millis % 36) as usize] as char);
        millis /= 36;
    }
    let mut id: String = clock.into_iter().rev().collect();
    let mut rng = rand::rng();
    id.extend((0..10).map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char));
    id
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
