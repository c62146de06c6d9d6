//! NPM and PyPI package discovery for MCP servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A package as surfaced to the frontend, registry-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSummary {
    /// Package name
    pub name: String,
    /// Latest version
    pub version: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Source registry ("npm" or "pypi")
    pub registry: String,
    /// Homepage or repository URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Keywords
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// Whether a package looks like an MCP server.
fn is_mcp_package(name: &str, description: &str, keywords: &[String]) -> bool {
    let name = name.to_lowercase();
    let description = description.to_lowercase();
    name.contains("mcp")
        || name.starts_with("@modelcontextprotocol/")
        || name.contains("model-context-protocol")
        || description.contains("mcp")
        || description.contains("model context protocol")
        || keywords.iter().any(|k| k.to_lowercase().contains("mcp"))
}

/// NPM registry search client.
#[derive(Debug, Clone)]
pub struct NpmClient {
    base_url: String,
    client: reqwest::Client,
}

impl NpmClient {
    /// Client against the public registry.
    pub fn new() -> Self {
        Self::with_base_url("https://registry.npmjs.org")
    }

    /// Client against an explicit registry base (tests, mirrors).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Search for MCP server packages. Failures degrade to an empty list.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<PackageSummary> {
        let url = format!("{}/-/v1/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("text", format!("{query} mcp server")),
                ("size", limit.to_string()),
            ])
            .send()
            .await;

        let body: Value = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "npm search returned malformed body");
                    return Vec::new();
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "npm search rejected");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "npm search failed");
                return Vec::new();
            }
        };

        body.get("objects")
            .and_then(Value::as_array)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|item| item.get("package"))
                    .filter_map(parse_npm_package)
                    .filter(|p| is_mcp_package(&p.name, &p.description, &p.keywords))
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fetch one package's metadata; `None` when it does not exist.
    pub async fn package_info(&self, name: &str) -> Option<PackageSummary> {
        let url = format!("{}/{}", self.base_url, name);
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;

        let version = body
            .pointer("/dist-tags/latest")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(PackageSummary {
            name: body.get("name")?.as_str()?.to_string(),
            version,
            description: body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            registry: "npm".to_string(),
            homepage: body
                .get("homepage")
                .and_then(Value::as_str)
                .map(String::from),
            keywords: string_list(body.get("keywords")),
        })
    }
}

impl Default for NpmClient {
    fn default() -> Self {
        Self::new()
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_npm_package(package: &Value) -> Option<PackageSummary> {
    Some(PackageSummary {
        name: package.get("name")?.as_str()?.to_string(),
        version: package
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: package
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        registry: "npm".to_string(),
        homepage: package
            .pointer("/links/homepage")
            .or_else(|| package.pointer("/links/repository"))
            .and_then(Value::as_str)
            .map(String::from),
        keywords: string_list(package.get("keywords")),
    })
}

/// PyPI search client.
///
/// PyPI has no JSON search endpoint, so discovery queries the JSON API for
/// the literal name and a few conventional MCP name patterns.
#[derive(Debug, Clone)]
pub struct PyPiClient {
    base_url: String,
    client: reqwest::Client,
}

impl PyPiClient {
    /// Client against the public index.
    pub fn new() -> Self {
        Self::with_base_url("https://pypi.org")
    }

    /// Client against an explicit index base (tests, mirrors).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Candidate project names tried for a query.
    pub fn candidate_names(query: &str) -> Vec<String> {
        let slug = query.trim().to_lowercase().replace([' ', '_'], "-");
        let mut names = vec![slug.clone()];
        if !slug.starts_with("mcp-") && !slug.ends_with("-mcp") {
            names.push(format!("mcp-server-{slug}"));
            names.push(format!("mcp-{slug}"));
            names.push(format!("{slug}-mcp"));
        }
        names.dedup();
        names
    }

    /// Look the query up under the conventional MCP name patterns.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<PackageSummary> {
        let mut results = Vec::new();
        for name in Self::candidate_names(query) {
            if results.len() >= limit {
                break;
            }
            if let Some(package) = self.package_info(&name).await {
                if is_mcp_package(&package.name, &package.description, &package.keywords) {
                    results.push(package);
                }
            }
        }
        results
    }

    /// Fetch one project's metadata; `None` when it does not exist.
    pub async fn package_info(&self, name: &str) -> Option<PackageSummary> {
        let url = format!("{}/pypi/{}/json", self.base_url, name);
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;

        let info = body.get("info")?;
        let keywords = match info.get("keywords") {
            Some(Value::String(s)) => s
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            other => string_list(other),
        };

        Some(PackageSummary {
            name: info.get("name")?.as_str()?.to_string(),
            version: info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description: info
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            registry: "pypi".to_string(),
            homepage: info
                .get("home_page")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
            keywords,
        })
    }
}

impl Default for PyPiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_mcp_package_detection() {
        assert!(is_mcp_package("@modelcontextprotocol/server-github", "", &[]));
        assert!(is_mcp_package("acme-mcp-server", "", &[]));
        assert!(is_mcp_package("acme", "A Model Context Protocol server", &[]));
        assert!(is_mcp_package("acme", "", &["MCP".to_string()]));
        assert!(!is_mcp_package("left-pad", "pads strings", &[]));
    }

    #[test]
    fn test_pypi_candidate_names() {
        assert_eq!(
            PyPiClient::candidate_names("fetch"),
            vec!["fetch", "mcp-server-fetch", "mcp-fetch", "fetch-mcp"]
        );
        assert_eq!(PyPiClient::candidate_names("mcp-server-git"), vec!["mcp-server-git"]);
    }

    #[tokio::test]
    async fn test_npm_search_filters_non_mcp_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/-/v1/search"))
            .and(query_param("text", "brave mcp server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objects": [
                    {"package": {"name": "@modelcontextprotocol/server-brave-search",
                                 "version": "1.0.0",
                                 "description": "MCP server for Brave Search",
                                 "links": {"homepage": "https://example.com"}}},
                    {"package": {"name": "left-pad", "version": "1.3.0",
                                 "description": "pads strings"}},
                ],
            })))
            .mount(&server)
            .await;

        let client = NpmClient::with_base_url(server.uri());
        let results = client.search("brave", 10).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "@modelcontextprotocol/server-brave-search");
        assert_eq!(results[0].registry, "npm");
        assert_eq!(results[0].homepage.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn test_npm_search_failure_degrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/-/v1/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = NpmClient::with_base_url(server.uri());
        assert!(client.search("anything", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_pypi_package_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/mcp-server-fetch/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "info": {
                    "name": "mcp-server-fetch",
                    "version": "2024.5.1",
                    "summary": "An MCP server for fetching web pages",
                    "home_page": "",
                    "keywords": "mcp, fetch, http",
                },
            })))
            .mount(&server)
            .await;

        let client = PyPiClient::with_base_url(server.uri());
        let package = client.package_info("mcp-server-fetch").await.unwrap();
        assert_eq!(package.version, "2024.5.1");
        assert_eq!(package.homepage, None);
        assert_eq!(package.keywords, vec!["mcp", "fetch", "http"]);
    }

    #[tokio::test]
    async fn test_pypi_missing_package_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/ghost/json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = PyPiClient::with_base_url(server.uri());
        assert!(client.package_info("ghost").await.is_none());
    }
}
