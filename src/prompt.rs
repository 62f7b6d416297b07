//! Prompt definition and builder API
//!
//! A prompt is a named text generator. Its loader receives the caller's
//! argument map and returns the rendered text, which is sent back as a single
//! user message.
//!
//! ```rust
//! use std::collections::HashMap;
//! use toolbox_mcp::prompt::{PromptArgument, PromptBuilder};
//! use toolbox_mcp::error::BoxError;
//!
//! let prompt = PromptBuilder::new("review")
//!     .description("Review a change")
//!     .required_arg("diff", "The change to review")
//!     .argument(PromptArgument::new("tone").enum_values(["friendly", "strict"]))
//!     .handler(|args: HashMap<String, String>| async move {
//!         Ok::<_, BoxError>(format!("Review this: {}", args["diff"]))
//!     });
//!
//! assert_eq!(prompt.name, "review");
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::completion::{CompleterHandle, CompletionSource};
use crate::error::BoxError;
use crate::protocol::{
    Content, GetPromptResult, PromptArgumentDefinition, PromptDefinition, PromptMessage,
    PromptRole,
};
use crate::tool::BoxFuture;

/// One declared prompt argument
#[derive(Clone, Default)]
pub struct PromptArgument {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
    pub completer: Option<CompleterHandle>,
}

impl std::fmt::Debug for PromptArgument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptArgument")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("enum_values", &self.enum_values)
            .field("completer", &self.completer.is_some())
            .finish()
    }
}

impl PromptArgument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Restrict to a fixed set of values, fuzzy-completed
    pub fn enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn completer(mut self, completer: CompleterHandle) -> Self {
        self.completer = Some(completer);
        self
    }

    fn definition(&self) -> PromptArgumentDefinition {
        PromptArgumentDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            required: self.required,
        }
    }

    fn completion_source(&self) -> CompletionSource {
        CompletionSource {
            completer: self.completer.clone(),
            enum_values: self.enum_values.clone(),
        }
    }
}

/// Prompt handler trait - renders the prompt text
pub trait PromptHandler: Send + Sync {
    fn render(
        &self,
        arguments: HashMap<String, String>,
    ) -> BoxFuture<'_, std::result::Result<String, BoxError>>;
}

/// A registered prompt
#[derive(Clone)]
pub struct Prompt {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    handler: Arc<dyn PromptHandler>,
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

impl Prompt {
    pub fn builder(name: impl Into<String>) -> PromptBuilder {
        PromptBuilder::new(name)
    }

    /// Get the prompt definition for prompts/list
    pub fn definition(&self) -> PromptDefinition {
        PromptDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            arguments: self.arguments.iter().map(PromptArgument::definition).collect(),
        }
    }

    /// First required argument absent from `arguments`
    pub fn missing_required(&self, arguments: &HashMap<String, String>) -> Option<&str> {
        self.arguments
            .iter()
            .find(|a| a.required && !arguments.contains_key(&a.name))
            .map(|a| a.name.as_str())
    }

    /// Run the loader and wrap its text into a single user message
    pub async fn get(
        &self,
        arguments: HashMap<String, String>,
    ) -> std::result::Result<GetPromptResult, BoxError> {
        let text = self.handler.render(arguments).await?;
        Ok(GetPromptResult {
            description: self.description.clone(),
            messages: vec![PromptMessage {
                role: PromptRole::User,
                content: Content::text(text),
            }],
        })
    }

    pub fn completion_source(&self, argument: &str) -> Option<CompletionSource> {
        self.arguments
            .iter()
            .find(|a| a.name == argument)
            .map(PromptArgument::completion_source)
    }

    pub fn can_complete(&self) -> bool {
        self.arguments
            .iter()
            .any(|a| a.completion_source().can_complete())
    }
}

/// Builder for prompts
pub struct PromptBuilder {
    name: String,
    description: Option<String>,
    arguments: Vec<PromptArgument>,
}

impl PromptBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a required argument
    pub fn required_arg(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.argument(
            PromptArgument::new(name)
                .description(description)
                .required(true),
        )
    }

    /// Add an optional argument
    pub fn optional_arg(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.argument(PromptArgument::new(name).description(description))
    }

    /// Add an argument with full control
    pub fn argument(mut self, argument: PromptArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn handler<F, Fut>(self, handler: F) -> Prompt
    where
        F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, BoxError>> + Send + 'static,
    {
        Prompt {
            name: self.name,
            description: self.description,
            arguments: self.arguments,
            handler: Arc::new(FnHandler { handler }),
        }
    }
}

struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> PromptHandler for FnHandler<F>
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<String, BoxError>> + Send + 'static,
{
    fn render(
        &self,
        arguments: HashMap<String, String>,
    ) -> BoxFuture<'_, std::result::Result<String, BoxError>> {
        Box::pin((self.handler)(arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completer_fn;
    use crate::protocol::Completion;

    fn greet() -> Prompt {
        PromptBuilder::new("greet")
            .description("Say hello")
            .required_arg("name", "Who to greet")
            .argument(PromptArgument::new("language").enum_values(["english", "french"]))
            .handler(|args: HashMap<String, String>| async move {
                Ok::<_, BoxError>(format!("Hello, {}!", args["name"]))
            })
    }

    #[tokio::test]
    async fn test_get_wraps_user_message() {
        let prompt = greet();
        let args = HashMap::from([("name".to_string(), "Ada".to_string())]);
        let result = prompt.get(args).await.unwrap();

        assert_eq!(result.description.as_deref(), Some("Say hello"));
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].role, PromptRole::User);
        assert_eq!(result.messages[0].content, Content::text("Hello, Ada!"));
    }

    #[test]
    fn test_missing_required() {
        let prompt = greet();
        assert_eq!(prompt.missing_required(&HashMap::new()), Some("name"));

        let args = HashMap::from([("name".to_string(), "Ada".to_string())]);
        assert_eq!(prompt.missing_required(&args), None);
    }

    #[test]
    fn test_definition_lists_arguments_in_order() {
        let def = greet().definition();
        let names: Vec<_> = def.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["name", "language"]);
        assert!(def.arguments[0].required);
        assert!(!def.arguments[1].required);
    }

    #[test]
    fn test_completion_sources() {
        let prompt = greet();
        assert!(prompt.can_complete());
        assert!(prompt.completion_source("language").unwrap().enum_values.is_some());
        assert!(!prompt.completion_source("name").unwrap().can_complete());
        assert!(prompt.completion_source("missing").is_none());

        let with_completer = PromptBuilder::new("p")
            .argument(PromptArgument::new("x").completer(completer_fn(
                |_v: String| async move { Ok(Completion::default()) },
            )))
            .handler(|_args: HashMap<String, String>| async move { Ok::<_, BoxError>(String::new()) });
        assert!(with_completer.can_complete());

        let plain = PromptBuilder::new("plain")
            .required_arg("x", "anything")
            .handler(|_args: HashMap<String, String>| async move { Ok::<_, BoxError>(String::new()) });
        assert!(!plain.can_complete());
    }
}
