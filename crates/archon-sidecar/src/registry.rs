//! Built-in MCP server template catalog.
//!
//! A static set of well-known servers the frontend offers one-click; each
//! template is a preset [`ServerConfig`] plus the environment variables the
//! worker needs filled in.

use archon_supervisor::{ServerConfig, ServerType, TransportMode};
use serde::{Deserialize, Serialize};

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTemplate {
    /// Stable template id
    pub template_id: String,
    /// Display name
    pub name: String,
    /// What the server does
    pub description: String,
    /// Preset configuration; `env` values for `required_env` keys are
    /// filled in by the caller
    pub config: ServerConfig,
    /// Environment variables the caller must supply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_env: Vec<String>,
    /// Search tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// In-memory template catalog.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<ServerTemplate>,
}

fn npx_template(
    template_id: &str,
    name: &str,
    description: &str,
    package: &str,
    required_env: &[&str],
    tags: &[&str],
) -> ServerTemplate {
    ServerTemplate {
        template_id: template_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        config: ServerConfig {
            server_type: ServerType::Npx,
            name: Some(template_id.to_string()),
            package: Some(package.to_string()),
            transport: TransportMode::Stdio,
            ..Default::default()
        },
        required_env: required_env.iter().map(ToString::to_string).collect(),
        tags: tags.iter().map(ToString::to_string).collect(),
    }
}

impl TemplateRegistry {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        let mut templates = vec![ServerTemplate {
            template_id: "archon-core".to_string(),
            name: "Archon Core".to_string(),
            description: "Core Archon MCP server with RAG, projects, and knowledge management"
                .to_string(),
            config: ServerConfig {
                server_type: ServerType::Archon,
                name: Some("archon-core".to_string()),
                transport: TransportMode::Sse,
                port: Some(8051),
                ..Default::default()
            },
            required_env: Vec::new(),
            tags: ["archon", "rag", "knowledge", "projects", "core"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }];

        templates.push(npx_template(
            "brave-search",
            "Brave Search",
            "Search the web using Brave Search API",
            "@modelcontextprotocol/server-brave-search",
            &["BRAVE_API_KEY"],
            &["search", "web", "brave", "npx"],
        ));
        templates.push(npx_template(
            "filesystem",
            "Filesystem",
            "Read and write files on the local filesystem",
            "@modelcontextprotocol/server-filesystem",
            &[],
            &["filesystem", "files", "npx"],
        ));
        templates.push(npx_template(
            "github",
            "GitHub",
            "Interact with GitHub repositories, issues, and pull requests",
            "@modelcontextprotocol/server-github",
            &["GITHUB_PERSONAL_ACCESS_TOKEN"],
            &["github", "git", "development", "npx"],
        ));
        templates.push(npx_template(
            "memory",
            "Memory",
            "Persistent knowledge graph memory across conversations",
            "@modelcontextprotocol/server-memory",
            &[],
            &["memory", "knowledge-graph", "npx"],
        ));
        templates.push(ServerTemplate {
            template_id: "fetch".to_string(),
            name: "Fetch".to_string(),
            description: "Fetch and convert web content for LLM consumption".to_string(),
            config: ServerConfig {
                server_type: ServerType::Uv,
                name: Some("fetch".to_string()),
                package: Some("mcp-server-fetch".to_string()),
                transport: TransportMode::Stdio,
                ..Default::default()
            },
            required_env: Vec::new(),
            tags: ["fetch", "web", "http", "uv"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        });

        Self { templates }
    }

    /// Every template in the catalog.
    pub fn list(&self) -> &[ServerTemplate] {
        &self.templates
    }

    /// Look a template up by id.
    pub fn get(&self, template_id: &str) -> Option<&ServerTemplate> {
        self.templates
            .iter()
            .find(|t| t.template_id == template_id)
    }

    /// Case-insensitive search across ids, names, descriptions, and tags.
    pub fn search(&self, query: &str) -> Vec<&ServerTemplate> {
        let needle = query.to_lowercase();
        self.templates
            .iter()
            .filter(|t| {
                t.template_id.to_lowercase().contains(&needle)
                    || t.name.to_lowercase().contains(&needle)
                    || t.description.to_lowercase().contains(&needle)
                    || t.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let registry = TemplateRegistry::builtin();
        assert!(registry.list().len() >= 5);
        for template in registry.list() {
            template
                .config
                .validate()
                .unwrap_or_else(|e| panic!("template {} invalid: {e}", template.template_id));
        }
    }

    #[test]
    fn test_lookup_by_id() {
        let registry = TemplateRegistry::builtin();
        let brave = registry.get("brave-search").unwrap();
        assert_eq!(
            brave.config.package.as_deref(),
            Some("@modelcontextprotocol/server-brave-search")
        );
        assert_eq!(brave.required_env, vec!["BRAVE_API_KEY"]);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_search_matches_tags() {
        let registry = TemplateRegistry::builtin();
        let hits = registry.search("knowledge");
        assert!(hits.iter().any(|t| t.template_id == "archon-core"));
        let hits = registry.search("GITHUB");
        assert_eq!(hits.len(), 1);
    }
}
