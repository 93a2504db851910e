//! Pure list operations on cached record collections.
//!
//! Mutations use these to compute optimistic values and to fold confirmed
//! server records back into whatever the cache holds at settle time.

use hearth_api_types::{ShoppingItemPatch, ShoppingItemRecord, TaskPatch, TaskRecord};

/// Records addressable by a stable id.
pub trait Identified {
    fn id(&self) -> &str;
}

impl Identified for ShoppingItemRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for TaskRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for hearth_api_types::CategoryRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Replace the record with `temp_id` by `confirmed`.
///
/// If a record with the confirmed id is already present (a refetch raced the
/// confirmation), the temporary record is dropped instead so the id is never
/// listed twice. If the temporary record is gone (rolled back or replaced),
/// the confirmed record is appended unless already present.
pub fn replace_temporary<T: Identified + Clone>(records: &[T], temp_id: &str, confirmed: &T) -> Vec<T> {
    let already_present = records.iter().any(|record| record.id() == confirmed.id());
    let mut replaced = false;
    let mut next = Vec::with_capacity(records.len() + 1);
    for record in records {
        if record.id() == temp_id {
            if !already_present && !replaced {
                next.push(confirmed.clone());
                replaced = true;
            }
        } else if record.id() == confirmed.id() {
            next.push(confirmed.clone());
            replaced = true;
        } else {
            next.push(record.clone());
        }
    }
    if !replaced {
        next.push(confirmed.clone());
    }
    next
}

/// Replace the record with the same id, leaving the list untouched if absent.
pub fn replace_by_id<T: Identified + Clone>(records: &[T], confirmed: &T) -> Vec<T> {
    records
        .iter()
        .map(|record| {
            if record.id() == confirmed.id() {
                confirmed.clone()
            } else {
                record.clone()
            }
        })
        .collect()
}

pub fn remove_by_id<T: Identified + Clone>(records: &[T], id: &str) -> Vec<T> {
    records
        .iter()
        .filter(|record| record.id() != id)
        .cloned()
        .collect()
}

pub fn apply_shopping_patch(item: &ShoppingItemRecord, patch: &ShoppingItemPatch) -> ShoppingItemRecord {
    let mut next = item.clone();
    if let Some(name) = patch.name.as_ref() {
        next.name = name.clone();
    }
    if let Some(quantity) = patch.quantity.as_ref() {
        next.quantity = Some(quantity.clone());
    }
    if let Some(category_id) = patch.category_id.as_ref() {
        next.category_id = Some(category_id.clone());
    }
    if let Some(bought) = patch.bought {
        next.bought = bought;
    }
    next
}

pub fn apply_task_patch(task: &TaskRecord, patch: &TaskPatch) -> TaskRecord {
    let mut next = task.clone();
    if let Some(title) = patch.title.as_ref() {
        next.title = title.clone();
    }
    if let Some(description) = patch.description.as_ref() {
        next.description = Some(description.clone());
    }
    if let Some(assignee_id) = patch.assignee_id.as_ref() {
        next.assignee_id = Some(assignee_id.clone());
    }
    if let Some(completed) = patch.completed {
        next.completed = completed;
    }
    next
}

/// Move a task into `column_id` at `position`, shifting the tasks at or after
/// that position in the target column down by one.
///
/// Positions are a local guess; the post-settle refetch brings the server's
/// ordering.
pub fn move_task(tasks: &[TaskRecord], task_id: &str, column_id: &str, position: i64) -> Vec<TaskRecord> {
    let mut next: Vec<TaskRecord> = tasks.to_vec();
    let Some(index) = next.iter().position(|task| task.id == task_id) else {
        return next;
    };
    for task in next.iter_mut() {
        if task.id != task_id && task.column_id == column_id && task.position >= position {
            task.position += 1;
        }
    }
    next[index].column_id = column_id.to_string();
    next[index].position = position;
    next.sort_by(|a, b| {
        a.column_id
            .cmp(&b.column_id)
            .then(a.position.cmp(&b.position))
            .then_with(|| a.id.cmp(&b.id))
    });
    next
}

/// Next free position at the end of a column.
pub fn next_position(tasks: &[TaskRecord], column_id: &str) -> i64 {
    tasks
        .iter()
        .filter(|task| task.column_id == column_id)
        .map(|task| task.position + 1)
        .max()
        .unwrap_or(0)
}
