use clap::Parser;

use crate::runtime::{
    cli::Cli,
    conf::{Conf, ConfigError},
};

pub mod capabilities;
pub mod cli;
pub mod conf;
pub mod logging;
pub mod signals;

pub struct Runtime {
    pub cli: Cli,
    pub conf: Conf,
}

impl Runtime {
    /// Parses the command line and layers the configuration on top of it.
    pub fn new() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        let (conf, cli) = Conf::new(cli)?;

        Ok(Runtime { cli, conf })
    }
}
