//! Loads a [`QueryKitConfig`] from layered sources.

use super::merge::merge_policy;
use super::sources::global_file;
use super::QueryKitConfig;
use crate::error::ClientError;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use std::path::Path;
use tracing::debug;

/// Entry point for configuration loading.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Later sources override earlier ones: built-in defaults, the global file, the
    /// workspace files under `{root}/config/`, then `QUERYKIT__SECTION__KEY` variables.
    pub fn load(workspace_root: &Path) -> Result<QueryKitConfig, ClientError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = add_workspace_files(builder, workspace_root);
        let builder = builder.add_source(
            Environment::with_prefix("QUERYKIT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: QueryKitConfig = builder.build()?.try_deserialize()?;
        debug!(root = %workspace_root.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from a single file, with defaults underneath.
    pub fn load_from_file(path: &Path) -> Result<QueryKitConfig, ClientError> {
        let config = merge_policy::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Built-in defaults with no file or environment sources.
    pub fn defaults() -> QueryKitConfig {
        QueryKitConfig::default()
    }
}

/// `{root}/config/querykit.toml`, then the file named by `QUERYKIT_ENV`
/// (`development` when unset). Missing files are skipped.
fn add_workspace_files(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> ConfigBuilder<DefaultState> {
    let env_name = std::env::var("QUERYKIT_ENV").unwrap_or_else(|_| "development".to_string());
    for stem in ["querykit", env_name.as_str()] {
        let path = workspace_root.join("config").join(format!("{}.toml", stem));
        if path.is_file() {
            debug!(config_path = %path.display(), "Adding workspace configuration");
            builder = builder.add_source(File::from(path).required(false));
        }
    }
    builder
}
