//! Shopping lists: query keys, fetchers and optimistic mutations.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use hearth_api_types::{NewShoppingItem, ShoppingItemPatch, ShoppingItemRecord};
use time::OffsetDateTime;

use super::error::SyncError;
use super::mutation::Mutation;
use super::remote::{RemoteRequest, RemoteTransport, fetcher};
use crate::cache::{QueryIdentity, QueryKey, Resource};
use crate::domain::ids::{is_temporary, temp_id};
use crate::domain::records::{apply_shopping_patch, remove_by_id, replace_by_id, replace_temporary};

/// Change-feed table carrying shopping item rows.
pub const TABLE: &str = "shopping_items";

const PATH: &str = "/shopping_items";

pub type ShoppingList = Vec<ShoppingItemRecord>;

/// `["shopping", list_id]`
pub fn list_key(list_id: &str) -> QueryKey<ShoppingList> {
    QueryKey::new(QueryIdentity::resource(Resource::Shopping).with(list_id))
}

/// Row filter scoping change events to one list.
pub fn list_filter(list_id: &str) -> String {
    format!("list_id=eq.{list_id}")
}

pub fn list_request(list_id: &str) -> RemoteRequest {
    RemoteRequest::get(PATH)
        .query("list_id", format!("eq.{list_id}"))
        .query("order", "created_at.asc")
}

pub fn list_fetcher(
    remote: Arc<dyn RemoteTransport>,
    list_id: &str,
) -> impl Fn() -> BoxFuture<'static, Result<ShoppingList, SyncError>> + Send + Sync + 'static {
    fetcher(remote, list_request(list_id))
}

fn item_path(item_id: &str) -> String {
    format!("{PATH}/{item_id}")
}

fn require(field: &'static str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "must not be empty"));
    }
    Ok(())
}

/// Items that only exist locally cannot be addressed on the server yet.
fn require_saved(item_id: &str) -> Result<(), SyncError> {
    require("item_id", item_id)?;
    if is_temporary(item_id) {
        return Err(SyncError::validation("item_id", "item is not saved yet"));
    }
    Ok(())
}

fn patch_items(
    current: Option<&ShoppingList>,
    item_id: &str,
    patch: &ShoppingItemPatch,
) -> ShoppingList {
    current
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    if item.id == item_id {
                        apply_shopping_patch(item, patch)
                    } else {
                        item.clone()
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Mutations
// ============================================================================

/// Append an item under a temporary id; the confirmed record replaces it.
#[derive(Debug, Clone)]
pub struct AddShoppingItem {
    item: NewShoppingItem,
    temp_id: String,
}

impl AddShoppingItem {
    pub fn new(item: NewShoppingItem) -> Self {
        Self {
            item,
            temp_id: temp_id(),
        }
    }

    /// Id of the placeholder record visible until the server answers.
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }
}

impl Mutation for AddShoppingItem {
    type Value = ShoppingList;
    type Output = ShoppingItemRecord;

    fn name(&self) -> &'static str {
        "add_shopping_item"
    }

    fn key(&self) -> QueryKey<ShoppingList> {
        list_key(&self.item.list_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("list_id", &self.item.list_id)?;
        require("name", &self.item.name)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        let mut body = self.item.clone();
        body.name = body.name.trim().to_string();
        RemoteRequest::post(PATH).json(&body)
    }

    fn optimistic(&self, current: Option<&ShoppingList>) -> ShoppingList {
        let now = OffsetDateTime::now_utc();
        let mut items = current.cloned().unwrap_or_default();
        items.push(ShoppingItemRecord {
            id: self.temp_id.clone(),
            list_id: self.item.list_id.clone(),
            name: self.item.name.trim().to_string(),
            quantity: self.item.quantity.clone(),
            category_id: self.item.category_id.clone(),
            bought: false,
            created_at: now,
            updated_at: now,
        });
        items
    }

    fn confirm(&self, current: Option<&ShoppingList>, output: &ShoppingItemRecord) -> ShoppingList {
        replace_temporary(current.map(Vec::as_slice).unwrap_or_default(), &self.temp_id, output)
    }
}

#[derive(Debug, Clone)]
pub struct ToggleBought {
    pub list_id: String,
    pub item_id: String,
    pub bought: bool,
}

impl ToggleBought {
    pub fn new(list_id: impl Into<String>, item_id: impl Into<String>, bought: bool) -> Self {
        Self {
            list_id: list_id.into(),
            item_id: item_id.into(),
            bought,
        }
    }

    fn patch(&self) -> ShoppingItemPatch {
        ShoppingItemPatch {
            bought: Some(self.bought),
            ..Default::default()
        }
    }
}

impl Mutation for ToggleBought {
    type Value = ShoppingList;
    type Output = ShoppingItemRecord;

    fn name(&self) -> &'static str {
        "toggle_bought"
    }

    fn key(&self) -> QueryKey<ShoppingList> {
        list_key(&self.list_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("list_id", &self.list_id)?;
        require_saved(&self.item_id)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::patch(item_path(&self.item_id)).json(&self.patch())
    }

    fn optimistic(&self, current: Option<&ShoppingList>) -> ShoppingList {
        patch_items(current, &self.item_id, &self.patch())
    }

    fn confirm(&self, current: Option<&ShoppingList>, output: &ShoppingItemRecord) -> ShoppingList {
        replace_by_id(current.map(Vec::as_slice).unwrap_or_default(), output)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateShoppingItem {
    pub list_id: String,
    pub item_id: String,
    pub patch: ShoppingItemPatch,
}

impl Mutation for UpdateShoppingItem {
    type Value = ShoppingList;
    type Output = ShoppingItemRecord;

    fn name(&self) -> &'static str {
        "update_shopping_item"
    }

    fn key(&self) -> QueryKey<ShoppingList> {
        list_key(&self.list_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("list_id", &self.list_id)?;
        require_saved(&self.item_id)?;
        if self.patch == ShoppingItemPatch::default() {
            return Err(SyncError::validation("patch", "no fields to update"));
        }
        if let Some(name) = self.patch.name.as_deref() {
            require("name", name)?;
        }
        Ok(())
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::patch(item_path(&self.item_id)).json(&self.patch)
    }

    fn optimistic(&self, current: Option<&ShoppingList>) -> ShoppingList {
        patch_items(current, &self.item_id, &self.patch)
    }

    fn confirm(&self, current: Option<&ShoppingList>, output: &ShoppingItemRecord) -> ShoppingList {
        replace_by_id(current.map(Vec::as_slice).unwrap_or_default(), output)
    }
}

#[derive(Debug, Clone)]
pub struct DeleteShoppingItem {
    pub list_id: String,
    pub item_id: String,
}

impl Mutation for DeleteShoppingItem {
    type Value = ShoppingList;
    type Output = ();

    fn name(&self) -> &'static str {
        "delete_shopping_item"
    }

    fn key(&self) -> QueryKey<ShoppingList> {
        list_key(&self.list_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("list_id", &self.list_id)?;
        require_saved(&self.item_id)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        Ok(RemoteRequest::delete(item_path(&self.item_id)))
    }

    fn optimistic(&self, current: Option<&ShoppingList>) -> ShoppingList {
        remove_by_id(current.map(Vec::as_slice).unwrap_or_default(), &self.item_id)
    }

    fn confirm(&self, current: Option<&ShoppingList>, _output: &()) -> ShoppingList {
        remove_by_id(current.map(Vec::as_slice).unwrap_or_default(), &self.item_id)
    }
}

/// Remove every bought item from a list. The server answers with the deleted
/// rows.
#[derive(Debug, Clone)]
pub struct ClearBought {
    pub list_id: String,
}

impl Mutation for ClearBought {
    type Value = ShoppingList;
    type Output = Vec<ShoppingItemRecord>;

    fn name(&self) -> &'static str {
        "clear_bought"
    }

    fn key(&self) -> QueryKey<ShoppingList> {
        list_key(&self.list_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        require("list_id", &self.list_id)
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        Ok(RemoteRequest::delete(PATH)
            .query("list_id", format!("eq.{}", self.list_id))
            .query("bought", "eq.true"))
    }

    fn optimistic(&self, current: Option<&ShoppingList>) -> ShoppingList {
        current
            .map(|items| items.iter().filter(|item| !item.bought).cloned().collect())
            .unwrap_or_default()
    }

    fn confirm(&self, current: Option<&ShoppingList>, output: &Vec<ShoppingItemRecord>) -> ShoppingList {
        let deleted: HashSet<&str> = output.iter().map(|item| item.id.as_str()).collect();
        current
            .map(|items| {
                items
                    .iter()
                    .filter(|item| !deleted.contains(item.id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
