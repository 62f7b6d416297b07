//! The set of tools, resources, templates, and prompts one server exposes.
//!
//! Registrations happen at configuration time. A session binds to a clone
//! of the registry taken when it is created, so later registrations do not
//! reach sessions that already exist.

use crate::error::{Error, Result};
use crate::prompt::Prompt;
use crate::protocol::{
    CompletionsCapability, LoggingCapability, PromptsCapability, ResourcesCapability,
    ServerCapabilities, ToolsCapability,
};
use crate::resource::{Resource, ResourceTemplate};
use crate::tool::Tool;

/// Ordered collections of everything a server offers
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    templates: Vec<ResourceTemplate>,
    prompts: Vec<Prompt>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Fails if a tool with the same name exists.
    pub fn add_tool(&mut self, tool: Tool) -> Result<()> {
        if self.tool(&tool.name).is_some() {
            return Err(Error::DuplicateRegistration {
                kind: "tool",
                key: tool.name,
            });
        }
        self.tools.push(tool);
        Ok(())
    }

    /// Add a fixed resource. Fails if its URI is taken.
    pub fn add_resource(&mut self, resource: Resource) -> Result<()> {
        if self.resource(&resource.uri).is_some() {
            return Err(Error::DuplicateRegistration {
                kind: "resource",
                key: resource.uri,
            });
        }
        self.resources.push(resource);
        Ok(())
    }

    /// Add a resource template. Fails if its URI pattern is taken.
    pub fn add_resource_template(&mut self, template: ResourceTemplate) -> Result<()> {
        if self.template(&template.uri_template).is_some() {
            return Err(Error::DuplicateRegistration {
                kind: "resource template",
                key: template.uri_template,
            });
        }
        self.templates.push(template);
        Ok(())
    }

    /// Add a prompt. Fails if a prompt with the same name exists.
    pub fn add_prompt(&mut self, prompt: Prompt) -> Result<()> {
        if self.prompt(&prompt.name).is_some() {
            return Err(Error::DuplicateRegistration {
                kind: "prompt",
                key: prompt.name,
            });
        }
        self.prompts.push(prompt);
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    /// Template registered under exactly this URI pattern
    pub fn template(&self, uri_template: &str) -> Option<&ResourceTemplate> {
        self.templates
            .iter()
            .find(|t| t.uri_template == uri_template)
    }

    /// First template whose pattern matches `uri`, with the captured variables
    pub fn match_template(
        &self,
        uri: &str,
    ) -> Option<(&ResourceTemplate, std::collections::HashMap<String, String>)> {
        self.templates
            .iter()
            .find_map(|t| t.match_uri(uri).map(|vars| (t, vars)))
    }

    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn templates(&self) -> &[ResourceTemplate] {
        &self.templates
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    /// Capabilities advertised in the initialize result
    pub fn capabilities(&self) -> ServerCapabilities {
        let can_complete = self.prompts.iter().any(Prompt::can_complete)
            || self.templates.iter().any(ResourceTemplate::can_complete)
            || self.resources.iter().any(Resource::can_complete);

        ServerCapabilities {
            tools: (!self.tools.is_empty()).then(ToolsCapability::default),
            resources: (!self.resources.is_empty() || !self.templates.is_empty())
                .then(ResourcesCapability::default),
            prompts: (!self.prompts.is_empty()).then(PromptsCapability::default),
            logging: Some(LoggingCapability::default()),
            completions: can_complete.then(CompletionsCapability::default),
        }
    }
}
