//! Resource definition and builder API
//!
//! Two kinds of resources can be registered:
//!
//! 1. **Fixed resources** - one URI, a loader returning one or many bodies
//! 2. **Resource templates** - a URI pattern with named placeholders; the
//!    captured values are passed to the loader, which returns one body
//!
//! ```rust
//! use toolbox_mcp::resource::{ResourceBody, ResourceTemplateBuilder};
//! use toolbox_mcp::error::BoxError;
//! use std::collections::HashMap;
//!
//! let template = ResourceTemplateBuilder::new("items/{id}")
//!     .name("Item")
//!     .mime_type("application/json")
//!     .handler(|vars: HashMap<String, String>| async move {
//!         let id = vars.get("id").cloned().unwrap_or_default();
//!         Ok::<_, BoxError>(ResourceBody::Text(format!(r#"{{"id": "{}"}}"#, id)))
//!     })
//!     .expect("valid template");
//!
//! assert!(template.match_uri("items/42").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::completion::{CompleterHandle, CompletionSource};
use crate::error::{BoxError, Error, Result};
use crate::protocol::{ResourceContent, ResourceDefinition, ResourceTemplateDefinition};
use crate::tool::BoxFuture;

/// One loaded resource body
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceBody {
    Text(String),
    /// Binary content, already base64 encoded
    Blob(String),
}

impl ResourceBody {
    fn into_content(
        self,
        uri: &str,
        name: Option<&str>,
        mime_type: Option<&str>,
    ) -> ResourceContent {
        let (text, blob) = match self {
            ResourceBody::Text(text) => (Some(text), None),
            ResourceBody::Blob(blob) => (None, Some(blob)),
        };
        ResourceContent {
            uri: uri.to_string(),
            name: name.map(str::to_string),
            mime_type: mime_type.map(str::to_string),
            text,
            blob,
        }
    }
}

/// A loader result that may hold a single value or several
#[derive(Debug, Clone, PartialEq)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl From<ResourceBody> for OneOrMany<ResourceBody> {
    fn from(body: ResourceBody) -> Self {
        OneOrMany::One(body)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        OneOrMany::Many(items)
    }
}

/// Resource handler trait - loads the bodies of a fixed resource
pub trait ResourceHandler: Send + Sync {
    fn load(&self) -> BoxFuture<'_, std::result::Result<OneOrMany<ResourceBody>, BoxError>>;
}

/// A fixed resource
#[derive(Clone)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    completers: HashMap<String, CompleterHandle>,
    handler: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.uri)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

impl Resource {
    pub fn builder(uri: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder::new(uri)
    }

    /// Get the resource definition for resources/list
    pub fn definition(&self) -> ResourceDefinition {
        ResourceDefinition {
            uri: self.uri.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
        }
    }

    /// Run the loader and tag every body with this resource's metadata
    pub async fn read(&self) -> std::result::Result<Vec<ResourceContent>, BoxError> {
        let bodies = self.handler.load().await?;
        Ok(bodies
            .into_vec()
            .into_iter()
            .map(|body| {
                body.into_content(&self.uri, Some(&self.name), self.mime_type.as_deref())
            })
            .collect())
    }

    pub fn completion_source(&self, argument: &str) -> Option<CompletionSource> {
        self.completers
            .get(argument)
            .map(|c| CompletionSource::completer(c.clone()))
    }

    pub fn can_complete(&self) -> bool {
        !self.completers.is_empty()
    }
}

/// Builder for fixed resources
pub struct ResourceBuilder {
    uri: String,
    name: Option<String>,
    description: Option<String>,
    mime_type: Option<String>,
    completers: HashMap<String, CompleterHandle>,
}

impl ResourceBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            description: None,
            mime_type: None,
            completers: HashMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Offer completions for a named argument of this resource
    pub fn completer(mut self, argument: impl Into<String>, completer: CompleterHandle) -> Self {
        self.completers.insert(argument.into(), completer);
        self
    }

    pub fn handler<F, Fut, B>(self, handler: F) -> Resource
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<B, BoxError>> + Send + 'static,
        B: Into<OneOrMany<ResourceBody>> + 'static,
    {
        let name = self.name.unwrap_or_else(|| self.uri.clone());
        Resource {
            uri: self.uri,
            name,
            description: self.description,
            mime_type: self.mime_type,
            completers: self.completers,
            handler: Arc::new(FnHandler { handler }),
        }
    }

    /// A resource whose body never changes
    pub fn text(self, content: impl Into<String>) -> Resource {
        let content = content.into();
        self.handler(move || {
            let content = content.clone();
            async move { Ok::<_, BoxError>(ResourceBody::Text(content)) }
        })
    }
}

struct FnHandler<F> {
    handler: F,
}

impl<F, Fut, B> ResourceHandler for FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<B, BoxError>> + Send + 'static,
    B: Into<OneOrMany<ResourceBody>> + 'static,
{
    fn load(&self) -> BoxFuture<'_, std::result::Result<OneOrMany<ResourceBody>, BoxError>> {
        let fut = (self.handler)();
        Box::pin(async move { Ok(fut.await?.into()) })
    }
}

// =============================================================================
// Resource templates
// =============================================================================

/// A named placeholder in a resource template
#[derive(Clone)]
pub struct TemplateArgument {
    pub name: String,
    pub description: Option<String>,
    pub completer: Option<CompleterHandle>,
}

impl std::fmt::Debug for TemplateArgument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateArgument")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("completer", &self.completer.is_some())
            .finish()
    }
}

impl TemplateArgument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            completer: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn completer(mut self, completer: CompleterHandle) -> Self {
        self.completer = Some(completer);
        self
    }
}

/// Loads the single body behind a matched template URI
pub trait ResourceTemplateHandler: Send + Sync {
    fn load(
        &self,
        variables: HashMap<String, String>,
    ) -> BoxFuture<'_, std::result::Result<ResourceBody, BoxError>>;
}

/// A parameterized resource
#[derive(Clone)]
pub struct ResourceTemplate {
    /// The URI pattern (e.g., `items/{id}`)
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub arguments: Vec<TemplateArgument>,
    pattern: regex::Regex,
    variables: Vec<String>,
    handler: Arc<dyn ResourceTemplateHandler>,
}

impl std::fmt::Debug for ResourceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTemplate")
            .field("uri_template", &self.uri_template)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

impl ResourceTemplate {
    pub fn builder(uri_template: impl Into<String>) -> ResourceTemplateBuilder {
        ResourceTemplateBuilder::new(uri_template)
    }

    /// Get the template definition for resources/templates/list
    pub fn definition(&self) -> ResourceTemplateDefinition {
        ResourceTemplateDefinition {
            uri_template: self.uri_template.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
        }
    }

    /// Check if a URI matches this template and extract variables
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, String>> {
        self.pattern.captures(uri).map(|caps| {
            self.variables
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    caps.get(i + 1)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect()
        })
    }

    /// Load the body for `uri` using variables captured by [`match_uri`](Self::match_uri)
    pub async fn read(
        &self,
        uri: &str,
        variables: HashMap<String, String>,
    ) -> std::result::Result<ResourceContent, BoxError> {
        let body = self.handler.load(variables).await?;
        Ok(body.into_content(uri, Some(&self.name), self.mime_type.as_deref()))
    }

    pub fn completion_source(&self, argument: &str) -> Option<CompletionSource> {
        self.arguments
            .iter()
            .find(|a| a.name == argument)
            .and_then(|a| a.completer.clone())
            .map(CompletionSource::completer)
    }

    pub fn can_complete(&self) -> bool {
        self.arguments.iter().any(|a| a.completer.is_some())
    }
}

/// Builder for resource templates
pub struct ResourceTemplateBuilder {
    uri_template: String,
    name: Option<String>,
    description: Option<String>,
    mime_type: Option<String>,
    arguments: Vec<TemplateArgument>,
}

impl ResourceTemplateBuilder {
    /// Create a new builder with the given URI template
    ///
    /// - `{var}` matches one path segment
    /// - `{+var}` matches the remainder of the URI, slashes included
    pub fn new(uri_template: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: None,
            description: None,
            mime_type: None,
            arguments: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Describe one placeholder. Undeclared placeholders get a bare argument.
    pub fn argument(mut self, argument: TemplateArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn handler<F, Fut>(self, handler: F) -> Result<ResourceTemplate>
    where
        F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<ResourceBody, BoxError>> + Send + 'static,
    {
        let (pattern, variables) = compile_uri_template(&self.uri_template)?;

        if let Some(unknown) = self
            .arguments
            .iter()
            .find(|a| !variables.contains(&a.name))
        {
            return Err(Error::InvalidDefinition(format!(
                "Argument '{}' does not appear in template '{}'",
                unknown.name, self.uri_template
            )));
        }

        let mut arguments = self.arguments;
        for var in &variables {
            if !arguments.iter().any(|a| &a.name == var) {
                arguments.push(TemplateArgument::new(var.clone()));
            }
        }

        let name = self.name.unwrap_or_else(|| self.uri_template.clone());
        Ok(ResourceTemplate {
            uri_template: self.uri_template,
            name,
            description: self.description,
            mime_type: self.mime_type,
            arguments,
            pattern,
            variables,
            handler: Arc::new(FnTemplateHandler { handler }),
        })
    }
}

struct FnTemplateHandler<F> {
    handler: F,
}

impl<F, Fut> ResourceTemplateHandler for FnTemplateHandler<F>
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<ResourceBody, BoxError>> + Send + 'static,
{
    fn load(
        &self,
        variables: HashMap<String, String>,
    ) -> BoxFuture<'_, std::result::Result<ResourceBody, BoxError>> {
        Box::pin((self.handler)(variables))
    }
}

/// Compile a URI template into a regex pattern and extract variable names
///
/// - `{var}` matches any characters except `/`
/// - `{+var}` matches any characters including `/`
fn compile_uri_template(template: &str) -> Result<(regex::Regex, Vec<String>)> {
    let mut pattern = String::from("^");
    let mut variables = Vec::new();

    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let is_reserved = chars.peek() == Some(&'+');
            if is_reserved {
                chars.next();
            }

            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            if var_name.is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "Empty placeholder in URI template '{}'",
                    template
                )));
            }
            variables.push(var_name);

            if is_reserved {
                pattern.push_str("(.+)");
            } else {
                pattern.push_str("([^/]+)");
            }
        } else {
            pattern.push_str(&regex::escape(&c.to_string()));
        }
    }

    pattern.push('$');

    let regex = regex::Regex::new(&pattern).map_err(|e| {
        Error::InvalidDefinition(format!("Invalid URI template '{}': {}", template, e))
    })?;

    Ok((regex, variables))
}
