mod cmd;
mod util;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format as _, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::util::common_options::AdapterChoice;
use crate::util::logging::{setup_logging, LevelFilter};
use crate::util::parse_u32;

/// Configuration file names searched in the working directory, without extension.
const CONFIG_FILE: &str = "dwtk";

/// Environment variables prefix. `__` separates nested keys, as in `DWTK_GDB__ADDRESS`.
const ENV_PREFIX: &str = "DWTK_";

/// debugWIRE runs at the MCU clock divided by this.
const CLOCK_DIVIDER: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GdbConfig {
    pub address: String,
    pub run_timers: bool,
    pub eeprom_access: bool,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8000".to_string(),
            run_timers: false,
            eeprom_access: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial_port: Option<String>,
    pub baudrate: Option<u32>,
    /// Target clock in MHz, an alternative way to give the baud rate.
    pub frequency: Option<u32>,
    pub adapter: AdapterChoice,
    pub log_level: Option<LevelFilter>,
    pub gdb: GdbConfig,
}

impl Config {
    /// The configured baud rate, derived from the target clock when only that is known.
    pub fn baudrate(&self) -> Option<u32> {
        self.baudrate.or_else(|| {
            self.frequency
                .map(|mhz| mhz.saturating_mul(1_000_000) / CLOCK_DIVIDER)
        })
    }
}

#[derive(clap::Parser)]
#[clap(
    name = "dwtk",
    about = "debugWIRE toolkit for AVR microcontrollers",
    version
)]
struct Cli {
    /// Serial port of a USB serial adapter. Detected when there is only one.
    #[clap(long, short = 's', global = true, help_heading = "ADAPTER CONFIGURATION")]
    serial_port: Option<String>,

    /// debugWIRE baud rate. Detected when not given.
    #[clap(
        long,
        short = 'b',
        global = true,
        value_parser = parse_u32,
        conflicts_with = "frequency",
        help_heading = "ADAPTER CONFIGURATION"
    )]
    baudrate: Option<u32>,

    /// Target clock in MHz, to derive the baud rate from
    #[clap(long, short = 'f', global = true, help_heading = "ADAPTER CONFIGURATION")]
    frequency: Option<u32>,

    /// Adapter to use
    #[clap(long, global = true, value_enum, help_heading = "ADAPTER CONFIGURATION")]
    adapter: Option<AdapterChoice>,

    /// Log level on stderr. Falls back to `RUST_LOG`, then to warnings only.
    #[clap(long, global = true, value_enum, help_heading = "LOG CONFIGURATION")]
    log_level: Option<LevelFilter>,

    /// Also write a JSON log to this file
    #[clap(long, global = true, help_heading = "LOG CONFIGURATION")]
    log_file: Option<PathBuf>,

    /// Same as `--log-level DEBUG`
    #[clap(long, short = 'd', global = true, help_heading = "LOG CONFIGURATION")]
    debug: bool,

    /// Configuration file to use instead of `dwtk.{toml,json,yaml}` in the working directory
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

impl Cli {
    fn run(self, config: &Config) -> Result<()> {
        match self.subcommand {
            Subcommand::Info(cmd) => cmd.run(config),
            Subcommand::Gdbserver(cmd) => cmd.run(config),
            Subcommand::Flash(cmd) => cmd.run(config),
            Subcommand::Verify(cmd) => cmd.run(config),
            Subcommand::Dump(cmd) => cmd.run(config),
            Subcommand::Erase(cmd) => cmd.run(config),
            Subcommand::Eeprom(cmd) => cmd.run(config),
            Subcommand::Fuses(cmd) => cmd.run(config),
            Subcommand::Reset(cmd) => cmd.run(config),
            Subcommand::Disable(cmd) => cmd.run(config),
        }
    }

    /// Command line values that override the configuration, under their configuration keys.
    fn overrides(&self) -> Figment {
        let mut figment = Figment::new();
        if let Some(serial_port) = &self.serial_port {
            figment = figment.merge(Serialized::default("serial_port", serial_port));
        }
        if let Some(baudrate) = self.baudrate {
            figment = figment
                .merge(Serialized::default("baudrate", baudrate))
                .merge(Serialized::default("frequency", None::<u32>));
        }
        if let Some(frequency) = self.frequency {
            figment = figment
                .merge(Serialized::default("frequency", frequency))
                .merge(Serialized::default("baudrate", None::<u32>));
        }
        if let Some(adapter) = self.adapter {
            figment = figment.merge(Serialized::default("adapter", adapter));
        }
        let log_level = if self.debug {
            Some(LevelFilter::Debug)
        } else {
            self.log_level
        };
        if let Some(log_level) = log_level {
            figment = figment.merge(Serialized::default("log_level", log_level));
        }
        figment
    }
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Show the adapter, the target MCU and its fuses
    Info(cmd::info::Cmd),
    /// Run a GDB server for one client
    Gdbserver(cmd::gdb_server::Cmd),
    /// Write a firmware file to flash
    Flash(cmd::flash::Cmd),
    /// Compare flash with a firmware file
    Verify(cmd::verify::Cmd),
    /// Dump the flash to an Intel HEX file
    Dump(cmd::dump::Cmd),
    /// Erase the whole flash. The target stays halted.
    Erase(cmd::erase::Cmd),
    /// Read and write EEPROM
    Eeprom(cmd::eeprom::Cmd),
    /// Print the fuse and lock bytes
    Fuses(cmd::fuses::Cmd),
    /// Reset the target and let it run
    Reset(cmd::reset::Cmd),
    /// Disable debugWIRE until the next power cycle
    Disable(cmd::disable::Cmd),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref(), cli.overrides())
        .context("Failed to load configuration.")?;

    let log_file = cli.log_file.clone();
    let _logger_guard = setup_logging(log_file.as_deref(), config.log_level)?;
    tracing::debug!("Configuration: {:?}", config);

    cli.run(&config)
}

/// Merges defaults, the configuration file, `DWTK_*` environment variables and the
/// command line, later sources winning.
fn load_config(path: Option<&Path>, overrides: Figment) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    figment = match path {
        Some(path) => {
            anyhow::ensure!(path.exists(), "{} does not exist", path.display());
            match path.extension().and_then(|extension| extension.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                _ => anyhow::bail!(
                    "Unknown configuration format of {}, expected .toml, .json or .yaml",
                    path.display()
                ),
            }
        }
        None => figment
            .merge(Toml::file(format!("{CONFIG_FILE}.toml")))
            .merge(Json::file(format!("{CONFIG_FILE}.json")))
            .merge(Yaml::file(format!("{CONFIG_FILE}.yaml")))
            .merge(Yaml::file(format!("{CONFIG_FILE}.yml"))),
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(overrides)
        .extract()?;

    anyhow::ensure!(
        config.baudrate.is_none() || config.frequency.is_none(),
        "Only one of baudrate and frequency can be set"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dwtk").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = load_config(None, Figment::new()).unwrap();

            assert_eq!(config, Config::default());
            assert_eq!(config.gdb.address, "localhost:8000");
            assert!(config.gdb.eeprom_access);
            Ok(())
        });
    }

    #[test]
    fn file_environment_and_command_line() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "dwtk.toml",
                r#"
                    serial_port = "/dev/ttyUSB1"
                    adapter = "usb-serial"
                    baudrate = 62500

                    [gdb]
                    address = "0.0.0.0:4242"
                "#,
            )?;
            jail.set_env("DWTK_GDB__RUN_TIMERS", "true");
            jail.set_env("DWTK_SERIAL_PORT", "/dev/ttyUSB2");

            let cli = cli(&["-b", "125000", "--log-level", "INFO", "fuses"]);
            let config = load_config(None, cli.overrides()).unwrap();

            assert_eq!(config.serial_port.as_deref(), Some("/dev/ttyUSB2"));
            assert_eq!(config.adapter, AdapterChoice::UsbSerial);
            assert_eq!(config.baudrate(), Some(125000));
            assert_eq!(config.log_level, Some(LevelFilter::Info));
            assert_eq!(
                config.gdb,
                GdbConfig {
                    address: "0.0.0.0:4242".to_string(),
                    run_timers: true,
                    eeprom_access: true,
                }
            );
            Ok(())
        });
    }

    #[test]
    fn frequency_on_command_line_replaces_configured_baudrate() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("dwtk.yaml", "baudrate: 62500\n")?;

            let config = load_config(None, cli(&["-f", "16", "reset"]).overrides()).unwrap();

            assert_eq!(config.baudrate, None);
            assert_eq!(config.baudrate(), Some(125000));
            Ok(())
        });
    }

    #[test]
    fn baudrate_and_frequency_in_one_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("dwtk.json", r#"{ "baudrate": 62500, "frequency": 8 }"#)?;

            assert!(load_config(None, Figment::new()).is_err());
            Ok(())
        });
    }

    #[test]
    fn explicit_config_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("board.json", r#"{ "gdb": { "eeprom_access": false } }"#)?;

            let config = load_config(Some(Path::new("board.json")), Figment::new()).unwrap();

            assert!(!config.gdb.eeprom_access);
            assert!(load_config(Some(Path::new("missing.toml")), Figment::new()).is_err());
            Ok(())
        });
    }

    #[test_case(&["-d", "info"], Some(LevelFilter::Debug))]
    #[test_case(&["--log-level", "WARN", "info"], Some(LevelFilter::Warn))]
    #[test_case(&["info"], None)]
    fn log_level(args: &[&str], expected: Option<LevelFilter>) {
        figment::Jail::expect_with(|_jail| {
            let config = load_config(None, cli(args).overrides()).unwrap();
            assert_eq!(config.log_level, expected);
            Ok(())
        });
    }

    #[test]
    fn baudrate_conflicts_with_frequency() {
        let result = Cli::try_parse_from(["dwtk", "-b", "62500", "-f", "8", "info"]);
        assert!(result.is_err());
    }

    #[test]
    fn dump_needs_a_file() {
        assert!(Cli::try_parse_from(["dwtk", "dump", "flash.hex"]).is_ok());
        assert!(Cli::try_parse_from(["dwtk", "dump"]).is_err());
    }

    #[test]
    fn eeprom_bytes_arguments() {
        let result = Cli::try_parse_from(["dwtk", "eeprom", "bytes", "0x10", "1", "0xff"]);
        assert!(result.is_ok());

        let result = Cli::try_parse_from(["dwtk", "eeprom", "bytes", "0x10", "0x100"]);
        assert!(result.is_err());
    }
}
