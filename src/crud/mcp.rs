//! The item store as MCP capabilities
//!
//! Registers five tools (`list_items`, `get_item`, `create_item`,
//! `update_item`, `delete_item`), the `items` resource, the `items/{id}`
//! template (with id completion) and the `shop_for` prompt (with category
//! completion) on a [`ToolBox`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::store::{ItemFilter, ItemInput, ItemStore};
use crate::completion::completer_fn;
use crate::error::{BoxError, Result, UserError};
use crate::prompt::{Prompt, PromptArgument};
use crate::protocol::Completion;
use crate::resource::{Resource, ResourceBody, ResourceTemplate, TemplateArgument};
use crate::tool::ToolBuilder;
use crate::toolbox::ToolBox;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ListItemsInput {
    /// Exact category, any case
    category: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    /// Substring of the name or description, any case
    search: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ItemIdInput {
    id: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ItemFields {
    name: String,
    description: String,
    category: String,
    price: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UpdateItemInput {
    id: u64,
    #[serde(flatten)]
    fields: ItemFields,
}

fn validated(fields: &ItemFields) -> std::result::Result<ItemInput, BoxError> {
    let value = serde_json::to_value(fields)?;
    ItemInput::validate(&value).map_err(|errors| {
        UserError::new(format!("Validation failed: {}", errors.join(", ")))
            .with_extras(json!({ "errors": errors }))
            .into()
    })
}

fn not_found(id: u64) -> BoxError {
    UserError::new(format!("Item not found: {}", id)).into()
}

fn to_json<T: Serialize>(value: &T) -> std::result::Result<String, BoxError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Register the item capabilities on `toolbox`
pub fn register(toolbox: &mut ToolBox, store: Arc<ItemStore>) -> Result<()> {
    let s = store.clone();
    toolbox.add_tool(
        ToolBuilder::new("list_items")
            .description("List items, optionally filtered by category, price range or search text")
            .handler(move |input: ListItemsInput| {
                let store = s.clone();
                async move {
                    let filter = ItemFilter {
                        category: input.category,
                        min_price: input.min_price.map(|p| p.to_string()),
                        max_price: input.max_price.map(|p| p.to_string()),
                        search: input.search,
                    };
                    to_json(&store.list(&filter)?)
                }
            })
            .build()?,
    )?;

    let s = store.clone();
    toolbox.add_tool(
        ToolBuilder::new("get_item")
            .description("Fetch one item by id")
            .handler(move |input: ItemIdInput| {
                let store = s.clone();
                async move {
                    let item = store.get(input.id)?.ok_or_else(|| not_found(input.id))?;
                    to_json(&item)
                }
            })
            .build()?,
    )?;

    let s = store.clone();
    toolbox.add_tool(
        ToolBuilder::new("create_item")
            .description("Create an item")
            .handler_with_context(move |ctx, input: ItemFields| {
                let store = s.clone();
                async move {
                    let item = store.create(validated(&input)?)?;
                    ctx.log()
                        .info("Item created", Some(json!({ "id": item.id })));
                    to_json(&item)
                }
            })
            .build()?,
    )?;

    let s = store.clone();
    toolbox.add_tool(
        ToolBuilder::new("update_item")
            .description("Replace the fields of an existing item")
            .handler(move |input: UpdateItemInput| {
                let store = s.clone();
                async move {
                    if store.get(input.id)?.is_none() {
                        return Err(not_found(input.id));
                    }
                    let item = store
                        .update(input.id, validated(&input.fields)?)?
                        .ok_or_else(|| not_found(input.id))?;
                    to_json(&item)
                }
            })
            .build()?,
    )?;

    let s = store.clone();
    toolbox.add_tool(
        ToolBuilder::new("delete_item")
            .description("Delete an item by id")
            .handler(move |input: ItemIdInput| {
                let store = s.clone();
                async move {
                    let item = store.delete(input.id)?.ok_or_else(|| not_found(input.id))?;
                    to_json(&item)
                }
            })
            .build()?,
    )?;

    let s = store.clone();
    toolbox.add_resource(
        Resource::builder("items")
            .name("All items")
            .mime_type("application/json")
            .handler(move || {
                let store = s.clone();
                async move {
                    let items = store.list(&ItemFilter::default())?;
                    Ok::<_, BoxError>(ResourceBody::Text(to_json(&items)?))
                }
            }),
    )?;

    let s = store.clone();
    let ids = store.clone();
    toolbox.add_resource_template(
        ResourceTemplate::builder("items/{id}")
            .name("Item")
            .mime_type("application/json")
            .argument(
                TemplateArgument::new("id")
                    .description("Item id")
                    .completer(completer_fn(move |prefix: String| {
                        let store = ids.clone();
                        async move {
                            let values = store
                                .list(&ItemFilter::default())?
                                .into_iter()
                                .map(|item| item.id.to_string())
                                .filter(|id| id.starts_with(&prefix))
                                .collect();
                            Ok::<_, BoxError>(Completion::new(values))
                        }
                    })),
            )
            .handler(move |vars: HashMap<String, String>| {
                let store = s.clone();
                async move {
                    let raw = vars.get("id").map(String::as_str).unwrap_or_default();
                    let id = raw
                        .parse::<u64>()
                        .map_err(|_| UserError::new(format!("Invalid item id: {}", raw)))?;
                    let item = store.get(id)?.ok_or_else(|| not_found(id))?;
                    Ok::<_, BoxError>(ResourceBody::Text(to_json(&item)?))
                }
            })?,
    )?;

    let s = store.clone();
    let categories = store;
    toolbox.add_prompt(
        Prompt::builder("shop_for")
            .description("Ask for a recommendation from one category")
            .argument(
                PromptArgument::new("category")
                    .description("Item category")
                    .required(true)
                    .completer(completer_fn(move |prefix: String| {
                        let store = categories.clone();
                        async move {
                            let prefix = prefix.to_lowercase();
                            let values: BTreeSet<String> = store
                                .list(&ItemFilter::default())?
                                .into_iter()
                                .map(|item| item.category.to_lowercase())
                                .filter(|c| c.starts_with(&prefix))
                                .collect();
                            Ok::<_, BoxError>(Completion::new(values.into_iter().collect()))
                        }
                    })),
            )
            .optional_arg("budget", "Maximum price")
            .handler(move |args: HashMap<String, String>| {
                let store = s.clone();
                async move {
                    let category = args.get("category").cloned().unwrap_or_default();
                    let filter = ItemFilter {
                        category: Some(category.clone()),
                        max_price: args.get("budget").cloned(),
                        ..Default::default()
                    };
                    let items = store.list(&filter)?;
                    let listing: Vec<Value> = items
                        .iter()
                        .map(|i| json!({ "id": i.id, "name": i.name, "price": i.price }))
                        .collect();
                    Ok::<_, BoxError>(format!(
                        "Recommend one {} item from this list and explain why:\n{}",
                        category,
                        serde_json::to_string_pretty(&listing)?
                    ))
                }
            }),
    )?;

    Ok(())
}
