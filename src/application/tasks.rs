//! Task boards.
//!
//! A board is cached as one list of cards ordered by `(column_id, position)`.
//! Optimistic positions are a local guess; the refetch that follows every
//! confirmation brings the server's ordering.

use std::sync::Arc;

use futures::future::BoxFuture;
use hearth_api_types::{NewTask, TaskMove, TaskPatch, TaskRecord};
use time::OffsetDateTime;

use super::error::SyncError;
use super::mutation::Mutation;
use super::remote::{RemoteRequest, RemoteTransport, fetcher};
use crate::cache::{QueryIdentity, QueryKey, Resource};
use crate::domain::ids::{is_temporary, temp_id};
use crate::domain::records::{
    apply_task_patch, move_task, next_position, remove_by_id, replace_by_id, replace_temporary,
};

pub const TABLE: &str = "tasks";

const PATH: &str = "/tasks";

pub type TaskBoard = Vec<TaskRecord>;

/// `["tasks", board_id]`
pub fn board_key(board_id: &str) -> QueryKey<TaskBoard> {
    QueryKey::new(QueryIdentity::resource(Resource::Tasks).with(board_id))
}

pub fn board_filter(board_id: &str) -> String {
    format!("board_id=eq.{board_id}")
}

pub fn board_request(board_id: &str) -> RemoteRequest {
    RemoteRequest::get(PATH)
        .query("board_id", format!("eq.{board_id}"))
        .query("order", "column_id.asc,position.asc")
}

pub fn board_fetcher(
    remote: Arc<dyn RemoteTransport>,
    board_id: &str,
) -> impl Fn() -> BoxFuture<'static, Result<TaskBoard, SyncError>> + Send + Sync + 'static {
    fetcher(remote, board_request(board_id))
}

fn task_path(task_id: &str) -> String {
    format!("{PATH}/{task_id}")
}

fn require(field: &'static str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "must not be empty"));
    }
    Ok(())
}

fn require_saved(task_id: &str) -> Result<(), SyncError> {
    require("task_id", task_id)?;
    if is_temporary(task_id) {
        return Err(SyncError::validation("task_id", "task is not saved yet"));
    }
    Ok(())
}

fn tasks(current: Option<&TaskBoard>) -> &[TaskRecord] {
    current.map(Vec::as_slice).unwrap_or_default()
}

// ============================================================================
// Mutations
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateTask {
    task: NewTask,
    temp_id: String,
}

impl CreateTask {
    pub fn new(task: NewTask) -> Self {
        Self {
            task,
            temp_id: temp_id(),
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }
}

impl Mutation for CreateTask {
    type Value = TaskBoard;
    type Output = TaskRecord;

    fn name(&self) -> &'static str {
        "create_task"
    }

    fn key(&self) -> QueryKey<TaskBoard> {
        board_key(&self.task.board_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("board_id", &self.task.board_id)?;
        require("column_id", &self.task.column_id)?;
        require("title", &self.task.title)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::post(PATH).json(&self.task)
    }

    /// New cards land at the bottom of their column.
    fn optimistic(&self, current: Option<&TaskBoard>) -> TaskBoard {
        let now = OffsetDateTime::now_utc();
        let mut board = tasks(current).to_vec();
        let position = next_position(&board, &self.task.column_id);
        board.push(TaskRecord {
            id: self.temp_id.clone(),
            board_id: self.task.board_id.clone(),
            column_id: self.task.column_id.clone(),
            title: self.task.title.clone(),
            description: self.task.description.clone(),
            assignee_id: self.task.assignee_id.clone(),
            position,
            completed: false,
            created_at: now,
            updated_at: now,
        });
        board
    }

    fn confirm(&self, current: Option<&TaskBoard>, output: &TaskRecord) -> TaskBoard {
        replace_temporary(tasks(current), &self.temp_id, output)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateTask {
    pub board_id: String,
    pub task_id: String,
    pub patch: TaskPatch,
}

impl Mutation for UpdateTask {
    type Value = TaskBoard;
    type Output = TaskRecord;

    fn name(&self) -> &'static str {
        "update_task"
    }

    fn key(&self) -> QueryKey<TaskBoard> {
        board_key(&self.board_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("board_id", &self.board_id)?;
        require_saved(&self.task_id)?;
        if self.patch == TaskPatch::default() {
            return Err(SyncError::validation("patch", "no fields to update"));
        }
        if let Some(title) = self.patch.title.as_deref() {
            require("title", title)?;
        }
        Ok(())
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::patch(task_path(&self.task_id)).json(&self.patch)
    }

    fn optimistic(&self, current: Option<&TaskBoard>) -> TaskBoard {
        tasks(current)
            .iter()
            .map(|task| {
                if task.id == self.task_id {
                    apply_task_patch(task, &self.patch)
                } else {
                    task.clone()
                }
            })
            .collect()
    }

    fn confirm(&self, current: Option<&TaskBoard>, output: &TaskRecord) -> TaskBoard {
        replace_by_id(tasks(current), output)
    }
}

/// Drag a card to another column and/or position.
#[derive(Debug, Clone)]
pub struct MoveTask {
    pub board_id: String,
    pub task_id: String,
    pub to: TaskMove,
}

impl Mutation for MoveTask {
    type Value = TaskBoard;
    type Output = TaskRecord;

    fn name(&self) -> &'static str {
        "move_task"
    }

    fn key(&self) -> QueryKey<TaskBoard> {
        board_key(&self.board_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("board_id", &self.board_id)?;
        require_saved(&self.task_id)?;
        require("column_id", &self.to.column_id)?;
        if self.to.position < 0 {
            return Err(SyncError::validation("position", "must not be negative"));
        }
        Ok(())
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::post(format!("{}/move", task_path(&self.task_id))).json(&self.to)
    }

    fn optimistic(&self, current: Option<&TaskBoard>) -> TaskBoard {
        move_task(tasks(current), &self.task_id, &self.to.column_id, self.to.position)
    }

    fn confirm(&self, current: Option<&TaskBoard>, output: &TaskRecord) -> TaskBoard {
        let board = tasks(current);
        match board.iter().find(|task| task.id == output.id) {
            Some(_) => {
                let moved = move_task(board, &output.id, &output.column_id, output.position);
                replace_by_id(&moved, output)
            }
            None => board.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteTask {
    pub board_id: String,
    pub task_id: String,
}

impl Mutation for DeleteTask {
    type Value = TaskBoard;
    type Output = ();

    fn name(&self) -> &'static str {
        "delete_task"
    }

    fn key(&self) -> QueryKey<TaskBoard> {
        board_key(&self.board_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("board_id", &self.board_id)?;
        require_saved(&self.task_id)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        Ok(RemoteRequest::delete(task_path(&self.task_id)))
    }

    fn optimistic(&self, current: Option<&TaskBoard>) -> TaskBoard {
        remove_by_id(tasks(current), &self.task_id)
    }

    fn confirm(&self, current: Option<&TaskBoard>, _output: &()) -> TaskBoard {
        remove_by_id(tasks(current), &self.task_id)
    }
}
