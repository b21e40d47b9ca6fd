use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use portdrop_common::{DEFAULT_PORT, PORT_MAP_NAME, PROGRAM_NAME};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::{ebpf::attach::XdpMode, runtime::cli::Cli};

/// Directory holding the armed marker of each attached interface.
pub const DEFAULT_STATE_DIR: &str = "/run/portdrop";

/// Application configuration.
///
/// Sources are layered as: defaults < configuration file < environment
/// variables < CLI arguments. Environment variables reach the figment
/// through clap's `env` attributes on [`Cli`].
#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    /// TCP destination port the filter drops.
    pub port: u16,

    /// Interface the XDP program is attached to.
    pub interface: String,

    /// Compiled filter object. When unset the embedded object is used if the
    /// binary carries one, otherwise `drop_tcp_port.o` in the working directory.
    pub object: Option<PathBuf>,

    /// Program entry point inside the object.
    pub program: String,

    /// Shared table inside the object.
    pub table: String,

    pub xdp_mode: XdpMode,

    /// bpffs directory to pin the link in. Unset keeps the link owned by the
    /// process, so the kernel detaches it if portdrop dies.
    pub pin_path: Option<PathBuf>,

    /// Directory for armed markers. `null` disables stale attachment cleanup.
    pub state_dir: Option<PathBuf>,

    #[serde(with = "level_serde")]
    pub log_level: Level,

    /// Path of the file this configuration was read from, kept for reloads.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            interface: "eth0".to_string(),
            object: None,
            program: PROGRAM_NAME.to_string(),
            table: PORT_MAP_NAME.to_string(),
            xdp_mode: XdpMode::default(),
            pin_path: None,
            state_dir: Some(PathBuf::from(DEFAULT_STATE_DIR)),
            log_level: Level::INFO,
            config_path: None,
        }
    }
}

impl Conf {
    /// Builds the configuration from the parsed CLI, the optional config file
    /// and the defaults.
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - the given config path does not exist.
    /// * `ConfigError::InvalidConfigPath` - the path is a directory.
    /// * `ConfigError::InvalidExtension` - the file is not `.yaml`/`.yml`.
    /// * `ConfigError::Extraction` - a value failed to deserialize.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;

        conf.config_path = config_path_to_store;
        Ok((conf, cli))
    }

    /// Re-reads the configuration file on top of the current values.
    ///
    /// CLI arguments and environment variables are not re-applied, so a value
    /// present in the file wins over the one given on the command line.
    pub fn reload(&self) -> Result<Self, ConfigError> {
        if let Some(path) = &self.config_path {
            validate_config_path(path)?;
            let mut conf: Conf = Figment::from(Serialized::defaults(self))
                .merge(Yaml::file(path))
                .extract()?;
            conf.config_path = self.config_path.clone();

            Ok(conf)
        } else {
            Err(ConfigError::NoConfigFile)
        }
    }
}

/// Accepts only an existing regular file with a `.yaml` or `.yml` extension.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    let metadata = match path.metadata() {
        Ok(metadata) => metadata,
        Err(_) => return Err(ConfigError::NoConfigFile),
    };
    if !metadata.is_file() {
        return Err(ConfigError::InvalidConfigPath(path.to_path_buf()));
    }

    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("none");
    if matches!(ext, "yaml" | "yml") {
        Ok(())
    } else {
        Err(ConfigError::InvalidExtension(ext.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist, or no file is known for a reload.
    #[error("no config file provided")]
    NoConfigFile,

    #[error("path '{}' is not a valid file", .0.display())]
    InvalidConfigPath(PathBuf),

    #[error("invalid file extension '.{0}', expected 'yaml' or 'yml'")]
    InvalidExtension(String),

    /// A value could not be extracted (bad type, out-of-range port, unknown mode).
    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Box::new(e).into()
    }
}

/// Log levels travel through figment as their lowercase names.
pub mod level_serde {
    use std::borrow::Cow;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = Cow::<str>::deserialize(deserializer)?;
        name.parse().map_err(D::Error::custom)
    }

    /// Serialize-only variant for optional CLI overrides.
    pub mod optional {
        use serde::Serializer;
        use tracing::Level;

        pub fn serialize<S: Serializer>(
            level: &Option<Level>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match level {
                Some(level) => super::serialize(level, serializer),
                None => serializer.serialize_none(),
            }
        }
    }
}
