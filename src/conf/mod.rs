//! Provides application configuration options.
//!
//! Configuration options can be parsed from config files in TOML format.

pub mod log;
pub mod signalling;
pub mod transfer;

use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[doc(inline)]
pub use self::{log::Log, signalling::Signalling, transfer::Transfer};

/// CLI argument that is responsible for holding application configuration
/// file path.
static APP_CONF_PATH_CMD_ARG_NAME: &str = "--conf";

/// Environment variable that is responsible for holding application
/// configuration file path.
static APP_CONF_PATH_ENV_VAR_NAME: &str = "PEERLINK_CONF";

/// Holds application config.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Conf {
    /// Logging settings.
    pub log: Log,

    /// Chunked transfer settings.
    pub transfer: Transfer,

    /// Signalling relay settings.
    pub signalling: Signalling,
}

impl Conf {
    /// Creates new [`Conf`] and applies values from such sources
    /// and in that order:
    /// - default values;
    /// - configuration file, the name of which is given as a command line
    ///   parameter or environment variable;
    /// - environment variables.
    ///
    /// # Errors
    ///
    /// Errors if parsing fails.
    pub fn parse() -> Result<Self, ConfigError> {
        let mut cfg = Config::new();

        if let Some(path) = get_conf_file_name(
            env::var(APP_CONF_PATH_ENV_VAR_NAME),
            env::args(),
        ) {
            cfg.merge(File::with_name(&path))?;
        }

        cfg.merge(Environment::with_prefix("PEERLINK").separator("__"))?;

        cfg.try_into()
    }
}

/// Returns the path to a configuration file, if it's set via CLI `args`
/// or environment variable.
///
/// Environment variable has priority over CLI argument.
fn get_conf_file_name<T>(
    env_var: Result<String, env::VarError>,
    mut cmd_args: T,
) -> Option<String>
where
    T: Iterator<Item = String>,
{
    if let Ok(path) = env_var {
        if !path.is_empty() {
            return Some(path);
        }
    }
    if cmd_args.any(|arg| arg == APP_CONF_PATH_CMD_ARG_NAME) {
        cmd_args.next()
    } else {
        None
    }
}
