use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::ops::{AssetBinding, PublishOptions};
use crate::types::AssetLayout;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// publisher configuration stored in zine.toml
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    /// documents this site publishes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<DocumentProfile>,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// look up a document profile by name
    pub fn document(&self, name: &str) -> Result<&DocumentProfile> {
        self.documents
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::UnknownDocument(name.to_string()))
    }

    /// asset layout for a document profile
    pub fn layout_for(&self, doc: &DocumentProfile) -> AssetLayout {
        AssetLayout::new(
            self.paths.assets_root.clone(),
            self.paths.public_prefix.clone(),
            doc.category.clone(),
        )
    }

    /// how records of `doc` reference assets
    pub fn binding_for(&self, doc: &DocumentProfile) -> AssetBinding {
        AssetBinding {
            layout: self.layout_for(doc),
            match_field: doc.match_field().to_string(),
            reference_field: doc.reference_field.clone(),
        }
    }

    /// publish options for the configured branch; `message` overrides the default
    pub fn publish_options(&self, message: Option<&str>) -> PublishOptions {
        let mut options = PublishOptions::new(
            self.remote.branch.clone(),
            message.unwrap_or(&self.publish.message),
        );
        options.upload_concurrency = self.publish.upload_concurrency;
        options.conflict_retries = self.publish.conflict_retries;
        options
    }

    /// a starting config matching the project list of the site
    pub fn example(owner: &str, repo: &str) -> Self {
        Self {
            remote: RemoteConfig {
                owner: owner.to_string(),
                repo: repo.to_string(),
                ..RemoteConfig::default()
            },
            paths: PathsConfig::default(),
            publish: PublishConfig::default(),
            documents: vec![DocumentProfile {
                name: "projects".to_string(),
                path: "src/app/Tutorial/list.json".to_string(),
                category: "project".to_string(),
                reference_field: "image".to_string(),
                match_field: Some("url".to_string()),
            }],
        }
    }
}

/// the repository being published to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// per-request deadline
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    /// ref name of the publish branch as the git refs API spells it
    pub fn branch_ref(&self) -> String {
        format!("heads/{}", self.branch)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_assets_root")]
    pub assets_root: String,
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            assets_root: default_assets_root(),
            public_prefix: default_public_prefix(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// commit message when the caller gives none
    #[serde(default = "default_message")]
    pub message: String,
    /// asset uploads in flight at once
    #[serde(default = "default_concurrency")]
    pub upload_concurrency: usize,
    /// full restarts after a ref conflict (0 = surface the conflict)
    #[serde(default)]
    pub conflict_retries: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            message: default_message(),
            upload_concurrency: default_concurrency(),
            conflict_retries: 0,
        }
    }
}

/// a JSON document the site publishes and how its records point at assets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentProfile {
    pub name: String,
    /// repository path of the document file
    pub path: String,
    /// asset subdirectory under the assets root
    pub category: String,
    /// record field holding the asset reference
    #[serde(default = "default_reference_field")]
    pub reference_field: String,
    /// record field compared against a pending asset's key; defaults to
    /// `reference_field`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_field: Option<String>,
}

impl DocumentProfile {
    pub fn match_field(&self) -> &str {
        self.match_field.as_deref().unwrap_or(&self.reference_field)
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_assets_root() -> String {
    "public/images".to_string()
}

fn default_public_prefix() -> String {
    "/images".to_string()
}

fn default_message() -> String {
    "update content".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_reference_field() -> String {
    "image".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::example("octo", "blog");
        config.publish.upload_concurrency = 4;
        config.publish.conflict_retries = 2;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_minimal_toml() {
        let toml_str = r#"
[remote]
owner = "octo"
repo = "blog"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.remote.branch, "main");
        assert_eq!(config.remote.api_base, DEFAULT_API_BASE);
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.paths.assets_root, "public/images");
        assert_eq!(config.publish.upload_concurrency, 1);
        assert_eq!(config.publish.conflict_retries, 0);
        assert!(config.documents.is_empty());
    }

    #[test]
    fn test_config_missing_remote_fails() {
        assert!(toml::from_str::<Config>("[paths]\nassets_root = \"x\"\n").is_err());
    }

    #[test]
    fn test_document_lookup() {
        let config = Config::example("octo", "blog");
        let doc = config.document("projects").unwrap();
        assert_eq!(doc.match_field(), "url");
        assert_eq!(doc.reference_field, "image");

        assert!(matches!(
            config.document("nope"),
            Err(Error::UnknownDocument(_))
        ));
    }

    #[test]
    fn test_match_field_defaults_to_reference_field() {
        let toml_str = r#"
[remote]
owner = "octo"
repo = "blog"

[[documents]]
name = "shares"
path = "src/app/Share/list.json"
category = "share"
reference_field = "cover"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let doc = config.document("shares").unwrap();
        assert_eq!(doc.match_field(), "cover");

        let layout = config.layout_for(doc);
        assert_eq!(layout.category, "share");
        assert_eq!(layout.assets_root, "public/images");
    }

    #[test]
    fn test_binding_and_options() {
        let mut config = Config::example("octo", "blog");
        config.publish.upload_concurrency = 3;

        let binding = config.binding_for(config.document("projects").unwrap());
        assert_eq!(binding.match_field, "url");
        assert_eq!(binding.reference_field, "image");
        assert_eq!(binding.layout.category, "project");

        let options = config.publish_options(None);
        assert_eq!(options.branch, "main");
        assert_eq!(options.message, "update content");
        assert_eq!(options.upload_concurrency, 3);
        assert_eq!(config.publish_options(Some("custom")).message, "custom");
    }

    #[test]
    fn test_branch_ref() {
        let config = Config::example("octo", "blog");
        assert_eq!(config.remote.branch_ref(), "heads/main");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zine.toml");

        let config = Config::example("octo", "blog");
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
