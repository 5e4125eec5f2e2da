use clap::{Parser, Subcommand};

use crate::config::Backend;

/// CLI surface for inspecting and maintaining mini-app secure storage.
#[derive(Parser, Debug)]
#[command(
    name = "miniapp",
    about = "Inspect and maintain encrypted mini-app secure storage",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Backing store to use (overrides the config file).
    #[arg(long, value_enum, global = true)]
    pub backend: Option<Backend>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print one value from a mini-app's store.
    Get { app: String, key: String },
    /// Write one or more KEY=VALUE entries.
    Set {
        app: String,
        #[arg(required = true, value_parser = parse_entry)]
        entries: Vec<(String, String)>,
    },
    /// Remove one or more keys (missing keys are ignored).
    Remove {
        app: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Show persisted size against the quota.
    Size { app: String },
    /// Print every entry of a mini-app's store.
    Dump { app: String },
    /// Delete a mini-app's persisted store.
    Clear { app: String },
    /// List mini-apps with persisted storage.
    List,
    /// Wipe one mini-app's storage.
    Wipe { app: String },
    /// Wipe storage of every mini-app found on disk.
    WipeAll,
    /// Run a write/read/clear round trip against the configured backend.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

fn parse_entry(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_entries() {
        let cli = Cli::try_parse_from(["miniapp", "set", "app-1", "a=1", "b=x=y"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Set {
                app: "app-1".into(),
                entries: vec![("a".into(), "1".into()), ("b".into(), "x=y".into())],
            }
        );
    }

    #[test]
    fn rejects_entry_without_separator() {
        assert!(Cli::try_parse_from(["miniapp", "set", "app-1", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["miniapp", "set", "app-1", "=v"]).is_err());
    }

    #[test]
    fn parses_global_backend_flag() {
        let cli = Cli::try_parse_from(["miniapp", "list", "--backend", "database"])
            .expect("parse should succeed");
        assert_eq!(cli.backend, Some(Backend::Database));
        assert_eq!(cli.command, Command::List);
    }

    #[test]
    fn parses_wipe_all_subcommand() {
        let cli = Cli::try_parse_from(["miniapp", "wipe-all"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::WipeAll);
        assert_eq!(cli.backend, None);
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["miniapp", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn remove_requires_keys() {
        assert!(Cli::try_parse_from(["miniapp", "remove", "app-1"]).is_err());
    }
}
