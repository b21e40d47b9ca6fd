use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::Level;

use crate::{ebpf::attach::XdpMode, runtime::conf::level_serde};

/// Drop inbound TCP traffic to one port with an XDP filter.
#[derive(Parser, Debug, Serialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TCP destination port to drop (0-65535). Defaults to 4040.
    #[arg(value_name = "PORT", env = "PORTDROP_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Set the path to the configuration file (e.g., "portdrop.yaml").
    #[arg(short, long, value_name = "FILE", env = "PORTDROP_CONFIG_PATH")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Network interface the filter is attached to.
    #[arg(short, long, value_name = "IFACE", env = "PORTDROP_INTERFACE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Path of the compiled filter object.
    #[arg(short, long, value_name = "FILE", env = "PORTDROP_OBJECT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<PathBuf>,

    /// XDP attach mode: auto, skb, driver or hardware.
    #[arg(long, value_name = "MODE", env = "PORTDROP_XDP_MODE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xdp_mode: Option<XdpMode>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "PORTDROP_LOG_LEVEL")]
    #[serde(with = "level_serde::optional", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Level>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;
    use crate::ebpf::attach::XdpMode;

    #[test]
    fn parses_positional_port_and_long_flags() {
        Jail::expect_with(|jail| {
            jail.set_env("PORTDROP_INTERFACE", "eth9");
            jail.set_env("PORTDROP_LOG_LEVEL", "debug");

            let args = [
                "portdrop",
                "8080",
                "--config",
                "/etc/portdrop.yaml",
                "--interface",
                "enp3s0",
                "--xdp-mode",
                "driver",
                "--log-level",
                "warn",
            ];
            let cli = Cli::parse_from(args);
            assert_eq!(cli.port, Some(8080));
            assert_eq!(cli.config, Some(PathBuf::from("/etc/portdrop.yaml")));
            assert_eq!(cli.interface.as_deref(), Some("enp3s0"));
            assert_eq!(cli.xdp_mode, Some(XdpMode::Driver));
            assert_eq!(cli.log_level, Some(Level::WARN));

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("PORTDROP_PORT", "9090");
            jail.set_env("PORTDROP_INTERFACE", "lo");
            jail.set_env("PORTDROP_LOG_LEVEL", "trace");

            let cli = Cli::parse_from(["portdrop"]);
            assert_eq!(cli.port, Some(9090));
            assert_eq!(cli.interface.as_deref(), Some("lo"));
            assert_eq!(cli.log_level, Some(Level::TRACE));

            Ok(())
        });
    }

    #[test]
    fn port_is_optional() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["portdrop"]);
            assert_eq!(cli.port, None);
            assert_eq!(cli.log_level, None);

            Ok(())
        });
    }

    #[test]
    fn rejects_out_of_range_port() {
        Jail::expect_with(|_| {
            assert!(Cli::try_parse_from(["portdrop", "65536"]).is_err());
            assert!(Cli::try_parse_from(["portdrop", "-1"]).is_err());
            assert!(Cli::try_parse_from(["portdrop", "http"]).is_err());

            Ok(())
        });
    }

    #[test]
    fn accepts_port_range_bounds() {
        Jail::expect_with(|_| {
            assert_eq!(Cli::parse_from(["portdrop", "0"]).port, Some(0));
            assert_eq!(Cli::parse_from(["portdrop", "65535"]).port, Some(65535));

            Ok(())
        });
    }
}
