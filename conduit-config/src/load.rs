use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding the configuration files, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Stem of the file loaded for every environment.
const BASE_FILE_STEM: &str = "base";

/// Extensions tried, in order, for every configuration file.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix of environment variables overriding file values.
const ENV_PREFIX: &str = "APP";

/// Separator between the prefix and the key.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator between nested keys, as in `APP_STREAM__CAPACITY`.
const ENV_SEPARATOR: &str = "__";

/// Errors returned while loading a configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// The working directory or `APP_ENVIRONMENT` could not be read.
    #[error("failed to inspect the process environment: {0}")]
    Process(#[from] io::Error),

    /// The configuration directory does not exist.
    #[error("configuration directory `{0}` does not exist")]
    MissingDirectory(PathBuf),

    /// No file with a supported extension exists for `stem`.
    #[error("no `{stem}` configuration file in `{directory}`")]
    MissingFile {
        stem: &'static str,
        directory: PathBuf,
    },

    /// A source could not be parsed or the merged values do not match the target type.
    #[error("failed to load configuration: {0}")]
    Load(#[from] rust_cli_config::ConfigError),
}

/// Loads a configuration from `./configuration` for the environment named by
/// `APP_ENVIRONMENT`.
///
/// See [`load_config_from`] for the layering rules.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    let directory = std::env::current_dir()?.join(CONFIGURATION_DIR);
    let environment = Environment::load()?;

    load_config_from(&directory, environment)
}

/// Loads a configuration from `directory` for `environment`.
///
/// Values are layered, later sources overriding earlier ones:
/// 1. `base.(yaml|yml|json)`
/// 2. `{environment}.(yaml|yml|json)`
/// 3. `APP_`-prefixed environment variables, nested keys separated by `__`
pub fn load_config_from<T>(
    directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingDirectory(directory.to_path_buf()));
    }

    let base_file = find_configuration_file(directory, BASE_FILE_STEM)?;
    let environment_file = find_configuration_file(directory, environment.as_str())?;

    let overrides = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    let settings = rust_cli_config::Config::builder()
        .add_source(rust_cli_config::File::from(base_file))
        .add_source(rust_cli_config::File::from(environment_file))
        .add_source(overrides)
        .build()?;

    Ok(settings.try_deserialize()?)
}

fn find_configuration_file(
    directory: &Path,
    stem: &'static str,
) -> Result<PathBuf, LoadConfigError> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
        .ok_or_else(|| LoadConfigError::MissingFile {
            stem,
            directory: directory.to_path_buf(),
        })
}
