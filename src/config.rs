use crate::error::MeshError;
use crate::handlers::GraphQLHandler;
use crate::source::{SourceSpec, PrefixTransform};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            hostname: default_hostname(),
            port: default_port(),
        }
    }
}

/// One source entry of the config file. Only the GraphQL-over-HTTP handler
/// is configurable this way; programmatic handlers go through the builder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub endpoint: String,
    /// Path to the source's SDL, relative to the config file.
    pub schema_file: Option<PathBuf>,
    /// Inline SDL; takes precedence over `schema_file`.
    pub schema: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub context_variables: HashMap<String, Value>,
    pub batch: Option<bool>,
    /// Prefix applied to the source's root fields.
    pub prefix: Option<String>,
}

/// The gateway config file, YAML on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub serve: ServeConfig,
    pub sources: Vec<SourceConfig>,
}

impl MeshConfig {
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MeshError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: MeshConfig = serde_yaml::from_str(&text)
            .map_err(|e| MeshError::InvalidConfig(e.to_string()))?;

        if config.sources.is_empty() {
            return Err(MeshError::InvalidConfig(
                "config declares no sources".into(),
            ));
        }

        // Schema paths resolve relative to the config file, not the cwd.
        let base = path.parent().unwrap_or(Path::new("."));
        for source in &mut config.sources {
            if let Some(file) = &source.schema_file {
                if file.is_relative() {
                    source.schema_file = Some(base.join(file));
                }
            }
        }
        Ok(config)
    }

    /// Turns the config entries into source specs for the gateway builder.
    pub fn source_specs(&self) -> Result<Vec<SourceSpec>, MeshError> {
        self.sources.iter().map(source_spec).collect()
    }
}

fn source_spec(config: &SourceConfig) -> Result<SourceSpec, MeshError> {
    let sdl = match (&config.schema, &config.schema_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(file)) => std::fs::read_to_string(file).map_err(|e| {
            MeshError::InvalidConfig(format!(
                "cannot read schema for source \"{}\" from {}: {e}",
                config.name,
                file.display()
            ))
        })?,
        (None, None) => {
            return Err(MeshError::InvalidConfig(format!(
                "source \"{}\" declares neither schema nor schema_file",
                config.name
            )));
        }
    };

    let mut handler = GraphQLHandler::new(&config.endpoint, sdl);
    for (name, value) in &config.headers {
        handler = handler.header(name, value);
    }
    for (name, value) in &config.context_variables {
        handler = handler.context_variable(name, value.clone());
    }
    if let Some(batch) = config.batch {
        handler = handler.batch(batch);
    }

    let mut spec = SourceSpec::new(&config.name, Arc::new(handler));
    if let Some(prefix) = &config.prefix {
        spec.transforms.push(Arc::new(PrefixTransform::new(prefix)));
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_minimal_config() {
        let config: MeshConfig = serde_yaml::from_str(
            r#"
            sources:
              - name: users
                endpoint: http://localhost:4001/graphql
                schema: "type Query { user(id: ID!): String }"
                prefix: users_
            "#,
        )
        .unwrap();

        assert_eq!(config.serve.port, 4000);
        assert_eq!(config.sources[0].name, "users");
        assert_eq!(config.sources[0].prefix.as_deref(), Some("users_"));

        let specs = config.source_specs().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].transforms.len(), 1);
    }

    #[test]
    fn missing_schema_is_rejected() {
        let config: MeshConfig = serde_yaml::from_str(
            r#"
            sources:
              - name: users
                endpoint: http://localhost:4001/graphql
            "#,
        )
        .unwrap();
        assert!(config.source_specs().is_err());
    }
}
