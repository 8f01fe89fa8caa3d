//! The owned application object: store mutations, the active persistence
//! backend, and the session lifecycle.
//!
//! Every operation mutates the [`Store`] first and returns immediately; the
//! matching persistence writes run on the [`WriteQueue`]. Failures surface
//! only through [`SyncStatus`] and are never rolled back.

pub mod queue;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth_client::AuthClient;
use crate::config::ClientConfig;
use crate::error::{AuthError, PersistError, StorageError, ValidationError};
use crate::kv::{KeyValueStore, SqliteKv};
use crate::models::{AuthSession, List, ListColor, Task, User};
use crate::persistence::{Change, Granularity, LocalStore, Persistence, RemoteStore, TaskPatch, Write};
use crate::session::{AuthEvent, AuthState, SessionHandle, SessionManager, SignUpOutcome};
use crate::store::Store;
use crate::table_client::TableClient;

pub use queue::{StatusReporter, SyncStatus, WriteQueue};

/// Auth transitions reported from outside the running operation, e.g. a
/// redirect completing in another browsing context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthNotification {
    SessionInvalidated,
    SignedIn(AuthSession),
    OAuthRedirect(String),
}

struct RemoteSide {
    session: SessionManager,
    backend: Arc<dyn Persistence>,
}

pub struct TodoApp {
    store: Store,
    local: Arc<LocalStore>,
    remote: Option<RemoteSide>,
    queue: WriteQueue,
    notify_tx: mpsc::UnboundedSender<AuthNotification>,
    notify_rx: mpsc::UnboundedReceiver<AuthNotification>,
}

impl TodoApp {
    /// Application without remote sync; state lives in `kv` only.
    pub fn local_only(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::build(kv, None)
    }

    /// Application that switches to `remote` while `session` is signed in.
    pub fn with_remote(
        kv: Arc<dyn KeyValueStore>,
        session: SessionManager,
        remote: Arc<dyn Persistence>,
    ) -> Self {
        Self::build(
            kv,
            Some(RemoteSide {
                session,
                backend: remote,
            }),
        )
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, StorageError> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::open(&config.storage_path)?);
        let Some(remote) = &config.remote else {
            return Ok(Self::local_only(kv));
        };
        let session = SessionManager::new(Arc::new(AuthClient::new(remote)), kv.clone());
        let handle = session.handle();
        let backend = RemoteStore::new(TableClient::new(remote, handle.clone()), handle);
        Ok(Self::with_remote(kv, session, Arc::new(backend)))
    }

    fn build(kv: Arc<dyn KeyValueStore>, remote: Option<RemoteSide>) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        TodoApp {
            store: Store::new(),
            local: Arc::new(LocalStore::new(kv)),
            remote,
            queue: WriteQueue::new(StatusReporter::new()),
            notify_tx,
            notify_rx,
        }
    }

    /// Restore the session, then load lists from whichever backend it selects.
    pub async fn start(&mut self) {
        let signed_in = match &mut self.remote {
            Some(remote) => {
                remote.session.restore().await;
                remote.session.user().cloned()
            }
            None => None,
        };
        match signed_in {
            Some(user) => self.enter_signed_in(user).await,
            None => {
                self.store = Store::from_data(self.local.read());
                info!(lists = self.store.lists().len(), "Started with local state");
            }
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn status(&self) -> SyncStatus {
        self.queue.status().current()
    }

    pub fn status_updates(&self) -> watch::Receiver<SyncStatus> {
        self.queue.status().subscribe()
    }

    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub fn auth_state(&self) -> AuthState {
        match &self.remote {
            Some(remote) => remote.session.state().clone(),
            None => AuthState::SignedOut,
        }
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.remote.as_ref().map(|r| r.session.handle())
    }

    pub fn auth_events(&self) -> Option<broadcast::Receiver<AuthEvent>> {
        self.remote.as_ref().map(|r| r.session.subscribe())
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.is_some()
    }

    fn backend(&self) -> Arc<dyn Persistence> {
        match &self.remote {
            Some(remote) if remote.session.is_signed_in() => remote.backend.clone(),
            _ => self.local.clone(),
        }
    }

    /// Queue the writes for a mutation that already happened in the store.
    fn persist(&self, changes: Vec<Change>) {
        let backend = self.backend();
        match backend.granularity() {
            Granularity::Snapshot => {
                self.queue
                    .push(backend, Write::Snapshot(self.store.data().clone()));
            }
            Granularity::Row => {
                for change in changes {
                    self.queue.push(backend.clone(), Write::Row(change));
                }
            }
        }
    }

    fn active_snapshot(&self, list_id: &str) -> Change {
        Change::UpsertTasks {
            list_id: list_id.to_string(),
            tasks: self
                .store
                .active_tasks(list_id)
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    // Lists

    pub fn create_list(&mut self, name: &str, color: ListColor) -> Result<String, ValidationError> {
        let list = self.store.insert_list(name, color)?.clone();
        info!(list_id = %list.id, name = %list.name, "Created list");
        let id = list.id.clone();
        self.persist(vec![Change::InsertList(list)]);
        Ok(id)
    }

    pub fn update_list(
        &mut self,
        list_id: &str,
        name: &str,
        color: ListColor,
    ) -> Result<bool, ValidationError> {
        let Some(list) = self.store.update_list(list_id, name, color)? else {
            return Ok(false);
        };
        let change = Change::UpdateList {
            id: list.id.clone(),
            name: list.name.clone(),
            color: list.color,
        };
        info!(list_id, "Updated list");
        self.persist(vec![change]);
        Ok(true)
    }

    pub fn delete_list(&mut self, list_id: &str) -> bool {
        let Some(list) = self.store.remove_list(list_id) else {
            return false;
        };
        info!(list_id, tasks = list.tasks.len(), "Deleted list");
        self.persist(vec![Change::DeleteList { id: list.id }]);
        true
    }

    pub fn reorder_lists(&mut self, from: usize, to: usize) -> bool {
        if !self.store.reorder_lists(from, to) {
            return false;
        }
        debug!(from, to, "Reordered lists");
        self.persist(vec![Change::UpsertLists(self.store.lists().to_vec())]);
        true
    }

    pub fn open_list(&mut self, list_id: &str) -> bool {
        if !self.store.set_current_list(Some(list_id)) {
            return false;
        }
        self.persist(Vec::new());
        true
    }

    pub fn close_list(&mut self) {
        self.store.set_current_list(None);
        self.persist(Vec::new());
    }

    pub fn current_list(&self) -> Option<&List> {
        self.store.current_list()
    }

    // Tasks

    /// Add a task to the head of a list. `Ok(None)` when the list does not exist.
    pub fn add_task(&mut self, list_id: &str, content: &str) -> Result<Option<String>, ValidationError> {
        let Some(task) = self.store.insert_task(list_id, content)?.cloned() else {
            return Ok(None);
        };
        info!(list_id, task_id = %task.id, "Added task");
        let id = task.id.clone();
        let positions = self.active_snapshot(list_id);
        self.persist(vec![
            Change::InsertTask {
                list_id: list_id.to_string(),
                task,
            },
            positions,
        ]);
        Ok(Some(id))
    }

    pub fn edit_task(&mut self, task_id: &str, content: &str) -> Result<bool, ValidationError> {
        let Some(task) = self.store.edit_task(task_id, content)? else {
            return Ok(false);
        };
        let change = Change::UpdateTask {
            id: task.id.clone(),
            patch: TaskPatch::content(&task.content),
        };
        debug!(task_id, "Edited task");
        self.persist(vec![change]);
        Ok(true)
    }

    pub fn toggle_task(&mut self, task_id: &str) -> bool {
        let Some(toggled) = self.store.toggle_task(task_id) else {
            return false;
        };
        debug!(task_id, completed = toggled.task.completed, "Toggled task");
        let mut changes = vec![Change::UpdateTask {
            id: toggled.task.id.clone(),
            patch: TaskPatch::completion(&toggled.task),
        }];
        if toggled.renumbered {
            changes.push(self.active_snapshot(&toggled.list_id));
        }
        self.persist(changes);
        true
    }

    pub fn delete_task(&mut self, task_id: &str) -> bool {
        let Some((list_id, task)) = self.store.remove_task(task_id) else {
            return false;
        };
        info!(list_id = %list_id, task_id, "Deleted task");
        self.persist(vec![Change::DeleteTask { id: task.id }]);
        true
    }

    /// Reorder among the active tasks of a list; indices count active tasks only.
    pub fn reorder_tasks(&mut self, list_id: &str, from: usize, to: usize) -> bool {
        if !self.store.reorder_tasks(list_id, from, to) {
            return false;
        }
        debug!(list_id, from, to, "Reordered tasks");
        self.persist(vec![self.active_snapshot(list_id)]);
        true
    }

    pub fn move_task(&mut self, task_id: &str, from_list_id: &str, to_list_id: &str) -> bool {
        if !self.store.move_task(task_id, from_list_id, to_list_id) {
            return false;
        }
        info!(task_id, from = from_list_id, to = to_list_id, "Moved task");
        let moved: Vec<Task> = self
            .store
            .find_list(to_list_id)
            .map(|list| {
                list.tasks
                    .iter()
                    .filter(|t| !t.completed || t.id == task_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let source = self.active_snapshot(from_list_id);
        self.persist(vec![
            source,
            Change::UpsertTasks {
                list_id: to_list_id.to_string(),
                tasks: moved,
            },
        ]);
        true
    }

    // Sync

    /// Drain pending writes, then replace all lists with the remote copy.
    /// Without a signed-in session this only drains the queue.
    pub async fn sync_now(&mut self) -> Result<(), PersistError> {
        self.queue.flush().await;
        let backend = self.backend();
        if backend.granularity() != Granularity::Row {
            return Ok(());
        }

        let status = self.queue.status().clone();
        status.syncing();
        match backend.load().await {
            Ok(data) => {
                info!(lists = data.lists.len(), "Reloaded lists from remote");
                self.store.replace_lists(data.lists);
                status.success();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Remote reload failed");
                status.error(e.to_string());
                Err(e)
            }
        }
    }

    // Auth

    fn remote_mut(&mut self) -> Result<&mut RemoteSide, AuthError> {
        self.remote.as_mut().ok_or(AuthError::NotConfigured)
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = self.remote_mut()?.session.sign_in(email, password).await?;
        self.enter_signed_in(user.clone()).await;
        Ok(user)
    }

    pub async fn sign_up(&mut self, email: &str, password: &str) -> Result<SignUpOutcome, AuthError> {
        let outcome = self.remote_mut()?.session.sign_up(email, password).await?;
        if let SignUpOutcome::SignedIn(user) = &outcome {
            self.enter_signed_in(user.clone()).await;
        }
        Ok(outcome)
    }

    pub async fn complete_oauth(&mut self, redirect_url: &str) -> Result<User, AuthError> {
        let user = self
            .remote_mut()?
            .session
            .complete_oauth_redirect(redirect_url)
            .await?;
        self.enter_signed_in(user.clone()).await;
        Ok(user)
    }

    pub async fn sign_out(&mut self) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        // pending writes would target the next backend otherwise
        self.queue.clear();
        remote.session.sign_out().await;
        self.enter_signed_out();
    }

    /// Sender other contexts use to report auth transitions to this app.
    pub fn notifier(&self) -> mpsc::UnboundedSender<AuthNotification> {
        self.notify_tx.clone()
    }

    pub async fn next_notification(&mut self) -> Option<AuthNotification> {
        self.notify_rx.recv().await
    }

    /// Handle every notification already delivered, returning how many there were.
    pub async fn process_notifications(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notification) = self.notify_rx.try_recv() {
            self.handle_notification(notification).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_notification(&mut self, notification: AuthNotification) {
        let Some(remote) = &mut self.remote else {
            debug!(?notification, "Ignoring auth notification without remote sync");
            return;
        };
        match notification {
            AuthNotification::SessionInvalidated => {
                if remote.session.is_signed_in() {
                    info!("Session invalidated elsewhere");
                    self.queue.clear();
                    remote.session.invalidate();
                    self.enter_signed_out();
                }
            }
            AuthNotification::SignedIn(session) => {
                let user = remote.session.adopt(session);
                self.enter_signed_in(user).await;
            }
            AuthNotification::OAuthRedirect(url) => {
                if let Err(e) = self.complete_oauth(&url).await {
                    warn!(error = %e, "OAuth redirect failed");
                }
            }
        }
    }

    async fn enter_signed_in(&mut self, user: User) {
        self.queue.clear();
        self.store.set_user(Some(user));
        self.store.clear_lists();

        let Some(remote) = &self.remote else {
            return;
        };
        let status = self.queue.status().clone();
        status.syncing();
        match remote.backend.load().await {
            Ok(data) => {
                info!(lists = data.lists.len(), "Loaded lists from remote");
                self.store.replace_lists(data.lists);
                status.success();
            }
            Err(e) => {
                warn!(error = %e, "Remote load failed");
                status.error(e.to_string());
            }
        }
    }

    fn enter_signed_out(&mut self) {
        self.store.set_user(None);
        self.store.clear_lists();
    }
}
