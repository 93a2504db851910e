//! Shopping categories of a household.

use std::sync::Arc;

use futures::future::BoxFuture;
use hearth_api_types::{CategoryRecord, NewCategory};

use super::error::SyncError;
use super::mutation::Mutation;
use super::remote::{RemoteRequest, RemoteTransport, fetcher};
use crate::cache::{QueryIdentity, QueryKey, Resource};
use crate::domain::ids::temp_id;
use crate::domain::records::replace_temporary;

pub const TABLE: &str = "categories";

const PATH: &str = "/categories";

pub type Categories = Vec<CategoryRecord>;

/// `["categories", household_id]`
pub fn categories_key(household_id: &str) -> QueryKey<Categories> {
    QueryKey::new(QueryIdentity::resource(Resource::Categories).with(household_id))
}

pub fn household_filter(household_id: &str) -> String {
    format!("household_id=eq.{household_id}")
}

pub fn categories_request(household_id: &str) -> RemoteRequest {
    RemoteRequest::get(PATH)
        .query("household_id", format!("eq.{household_id}"))
        .query("order", "sort_order.asc")
}

pub fn categories_fetcher(
    remote: Arc<dyn RemoteTransport>,
    household_id: &str,
) -> impl Fn() -> BoxFuture<'static, Result<Categories, SyncError>> + Send + Sync + 'static {
    fetcher(remote, categories_request(household_id))
}

#[derive(Debug, Clone)]
pub struct CreateCategory {
    category: NewCategory,
    temp_id: String,
}

impl CreateCategory {
    pub fn new(category: NewCategory) -> Self {
        Self {
            category,
            temp_id: temp_id(),
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }
}

impl Mutation for CreateCategory {
    type Value = Categories;
    type Output = CategoryRecord;

    fn name(&self) -> &'static str {
        "create_category"
    }

    fn key(&self) -> QueryKey<Categories> {
        categories_key(&self.category.household_id)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.category.household_id.trim().is_empty() {
            return Err(SyncError::validation("household_id", "must not be empty"));
        }
        if self.category.name.trim().is_empty() {
            return Err(SyncError::validation("name", "must not be empty"));
        }
        Ok(())
    }

    fn request(&self) -> Result<RemoteRequest, SyncError> {
        RemoteRequest::post(PATH).json(&self.category)
    }

    fn optimistic(&self, current: Option<&Categories>) -> Categories {
        let mut categories = current.cloned().unwrap_or_default();
        let sort_order = categories
            .iter()
            .map(|category| category.sort_order + 1)
            .max()
            .unwrap_or(0);
        categories.push(CategoryRecord {
            id: self.temp_id.clone(),
            household_id: self.category.household_id.clone(),
            name: self.category.name.trim().to_string(),
            color: self.category.color.clone(),
            sort_order,
        });
        categories
    }

    fn confirm(&self, current: Option<&Categories>, output: &CategoryRecord) -> Categories {
        replace_temporary(current.map(Vec::as_slice).unwrap_or_default(), &self.temp_id, output)
    }
}
