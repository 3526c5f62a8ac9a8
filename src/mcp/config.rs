//! Tool-server list loading.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::types::ToolServerConfig;
use crate::error::{Error, Result};

/// On-disk shape of the tool-server list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolServerFile {
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

impl ToolServerFile {
    /// Read and validate a tool-server list from a JSON file.
    pub async fn load(path: &Path) -> Result<Vec<ToolServerConfig>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a tool-server list.
    pub fn parse(content: &str) -> Result<Vec<ToolServerConfig>> {
        let file: ToolServerFile = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid tool server list: {}", e)))?;
        validate_servers(&file.servers)?;
        Ok(file.servers)
    }
}

/// Reject empty or duplicate server names and empty commands.
pub fn validate_servers(servers: &[ToolServerConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for server in servers {
        if server.name.trim().is_empty() {
            return Err(Error::Config("tool server name must not be empty".to_string()));
        }
        if server.command.trim().is_empty() {
            return Err(Error::Config(format!(
                "tool server '{}' has no command",
                server.name
            )));
        }
        if !seen.insert(server.name.as_str()) {
            return Err(Error::Config(format!(
                "tool server '{}' is configured twice",
                server.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_list() {
        let servers = ToolServerFile::parse(
            r#"{"servers":[{"name":"demo","command":"demo-tool-server","args":["--quiet"],"auto_start":false}]}"#,
        )
        .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].args, vec!["--quiet".to_string()]);
        assert!(!servers[0].auto_start);
    }

    #[test]
    fn rejects_duplicates() {
        let err = ToolServerFile::parse(
            r#"{"servers":[{"name":"a","command":"x"},{"name":"a","command":"y"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        tokio::fs::write(&path, r#"{"servers":[{"name":"demo","command":"demo"}]}"#)
            .await
            .unwrap();
        let servers = ToolServerFile::load(&path).await.unwrap();
        assert_eq!(servers[0].name, "demo");

        let missing = ToolServerFile::load(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
