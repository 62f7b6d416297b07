//! In-memory item store

use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A stored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Validated, trimmed input for create and update
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInput {
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
}

impl ItemInput {
    /// Check a JSON body, collecting every problem.
    ///
    /// Price may be a number or a numeric string; it must not be negative.
    pub fn validate(body: &Value) -> std::result::Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        let mut text = |field: &str, message: &str| match body.get(field).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                errors.push(message.to_string());
                String::new()
            }
        };
        let name = text("name", "Name is required");
        let description = text("description", "Description is required");
        let category = text("category", "Category is required");

        let price = match body.get("price") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|p| p.is_finite() && *p >= 0.0);
        if price.is_none() {
            errors.push("Price must be a valid positive number".to_string());
        }

        match price {
            Some(price) if errors.is_empty() => Ok(Self {
                name,
                description,
                category,
                price,
            }),
            _ => Err(errors),
        }
    }
}

/// Query filters for [`ItemStore::list`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFilter {
    pub category: Option<String>,
    pub min_price: Option<String>,
    pub max_price: Option<String>,
    pub search: Option<String>,
}

impl ItemFilter {
    fn matches(&self, item: &Item) -> bool {
        if let Some(category) = non_empty(&self.category)
            && item.category.to_lowercase() != category.to_lowercase()
        {
            return false;
        }
        // An unparsable bound matches nothing
        if let Some(min) = non_empty(&self.min_price)
            && !(item.price >= min.trim().parse::<f64>().unwrap_or(f64::NAN))
        {
            return false;
        }
        if let Some(max) = non_empty(&self.max_price)
            && !(item.price <= max.trim().parse::<f64>().unwrap_or(f64::NAN))
        {
            return false;
        }
        if let Some(search) = non_empty(&self.search) {
            let term = search.to_lowercase();
            return item.name.to_lowercase().contains(&term)
                || item.description.to_lowercase().contains(&term);
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct Inner {
    items: Vec<Item>,
    next_id: u64,
}

/// Items kept in insertion order, with ids handed out from a counter
pub struct ItemStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("len", &self.list(&ItemFilter::default()).map(|i| i.len()).ok())
            .finish()
    }
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::seeded()
    }
}

impl ItemStore {
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// The three sample items, next id 4
    pub fn seeded() -> Self {
        let created_at = now();
        let seed = |id, name: &str, description: &str, category: &str, price| Item {
            id,
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            price,
            created_at: created_at.clone(),
            updated_at: None,
        };
        let items = vec![
            seed(1, "Sample Item 1", "This is a sample item", "electronics", 99.99),
            seed(2, "Sample Item 2", "Another sample item", "books", 19.99),
            seed(3, "Sample Item 3", "Yet another sample item", "clothing", 49.99),
        ];
        Self {
            inner: Mutex::new(Inner { items, next_id: 4 }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("item store lock poisoned".to_string()))
    }

    pub fn list(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    pub fn get(&self, id: u64) -> Result<Option<Item>> {
        let inner = self.lock()?;
        Ok(inner.items.iter().find(|item| item.id == id).cloned())
    }

    pub fn create(&self, input: ItemInput) -> Result<Item> {
        let mut inner = self.lock()?;
        let timestamp = now();
        let item = Item {
            id: inner.next_id,
            name: input.name,
            description: input.description,
            category: input.category,
            price: input.price,
            created_at: timestamp.clone(),
            updated_at: Some(timestamp),
        };
        inner.next_id += 1;
        inner.items.push(item.clone());
        tracing::debug!(id = item.id, "Item created");
        Ok(item)
    }

    /// Replace an item's fields, keeping its id and creation time
    pub fn update(&self, id: u64, input: ItemInput) -> Result<Option<Item>> {
        let mut inner = self.lock()?;
        let Some(item) = inner.items.iter_mut().find(|item| item.id == id) else {
            return Ok(None);
        };
        item.name = input.name;
        item.description = input.description;
        item.category = input.category;
        item.price = input.price;
        item.updated_at = Some(now());
        tracing::debug!(id, "Item updated");
        Ok(Some(item.clone()))
    }

    pub fn delete(&self, id: u64) -> Result<Option<Item>> {
        let mut inner = self.lock()?;
        let Some(index) = inner.items.iter().position(|item| item.id == id) else {
            return Ok(None);
        };
        tracing::debug!(id, "Item deleted");
        Ok(Some(inner.items.remove(index)))
    }
}
