//! Provider file loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use polystore_storage::ProviderConfig;

/// JSON file listing the providers a combo facade routes to.
///
/// ```json
/// { "providers": [ { "kind": "object_store", "bucket_name": "reports", ... } ] }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ProvidersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse provider file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_storage::BackendKind;
    use tempfile::TempDir;

    #[test]
    fn test_load_providers_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{
                "providers": [
                    { "kind": "local", "name": "root", "root": "/srv/data" },
                    {
                        "kind": "blob",
                        "account_name": "account",
                        "account_key": "a2V5",
                        "container_name": "container1",
                        "is_hierarchical_namespace": true
                    }
                ]
            }"#,
        )
        .unwrap();

        let file = ProvidersFile::load(&path).unwrap();
        let kinds: Vec<BackendKind> = file.providers.iter().map(|p| p.kind()).collect();
        assert_eq!(kinds, vec![BackendKind::Local, BackendKind::Blob]);
        assert_eq!(file.providers[0].name(), "root");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = ProvidersFile::load(Path::new("/nonexistent/providers.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
