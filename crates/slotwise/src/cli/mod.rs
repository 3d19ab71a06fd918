//! Command-line interface for slotwise.
//!
//! This module provides the CLI structure for the `slotwise` binary. One
//! binary serves all three roles: update server, publisher and device agent.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    AgentCommand, AuditCommand, ChannelCommand, ConfigCommand, KeygenCommand, OutputFormat,
    PublishCommand, ReleasesCommand, RetireCommand, ServerCommand,
};

use crate::logging::Verbosity;

/// slotwise - Over-the-air updates with A/B slots and automatic rollback
///
/// Publishes signed releases with binary deltas, serves them to devices,
/// and runs the on-device agent that stages, applies and confirms them.
#[derive(Debug, Parser)]
#[command(name = "slotwise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the update server
    #[command(subcommand)]
    Server(ServerCommand),

    /// Publish a release
    Publish(PublishCommand),

    /// Retire a release so it is no longer offered
    Retire(RetireCommand),

    /// List the releases of a channel
    Releases(ReleasesCommand),

    /// Manage channels
    #[command(subcommand)]
    Channel(ChannelCommand),

    /// Re-verify stored packages and signatures
    Audit(AuditCommand),

    /// Generate a release signing key
    Keygen(KeygenCommand),

    /// Run or control the device agent
    #[command(subcommand)]
    Agent(AgentCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use semver::Version;

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "slotwise");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::try_parse_from(["slotwise", "-vv", "config", "path"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Trace);

        let cli = Cli::try_parse_from(["slotwise", "-q", "config", "path"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_parse_server_serve() {
        let cli = Cli::try_parse_from(["slotwise", "server", "serve", "--bind", "0.0.0.0:9000"])
            .unwrap();
        match cli.command {
            Command::Server(ServerCommand::Serve { bind }) => {
                assert_eq!(bind.unwrap().port(), 9000);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "slotwise",
            "publish",
            "--channel",
            "stable",
            "--release-version",
            "1.2.0",
            "--image",
            "fw.bin",
            "--minimum-source-version",
            "1.0.0",
        ])
        .unwrap();
        match cli.command {
            Command::Publish(cmd) => {
                assert_eq!(cmd.channel, "stable");
                assert_eq!(cmd.release_version, Version::new(1, 2, 0));
                assert_eq!(cmd.image, PathBuf::from("fw.bin"));
                assert_eq!(cmd.minimum_source_version, Some(Version::new(1, 0, 0)));
                assert_eq!(cmd.format, OutputFormat::Plain);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_publish_rejects_bad_version() {
        assert!(Cli::try_parse_from([
            "slotwise",
            "publish",
            "--channel",
            "stable",
            "--release-version",
            "one",
            "-i",
            "fw.bin",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_agent_commands() {
        let cli = Cli::try_parse_from(["slotwise", "agent", "run", "--once"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Agent(AgentCommand::Run { once: true })
        ));

        let cli = Cli::try_parse_from(["slotwise", "agent", "healthy"]).unwrap();
        assert!(matches!(cli.command, Command::Agent(AgentCommand::Healthy)));

        let cli = Cli::try_parse_from(["slotwise", "agent", "status", "--offline"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Agent(AgentCommand::Status { offline: true, .. })
        ));
    }

    #[test]
    fn test_parse_channel_create() {
        let cli = Cli::try_parse_from(["slotwise", "channel", "create", "beta"]).unwrap();
        match cli.command {
            Command::Channel(ChannelCommand::Create { name }) => assert_eq!(name, "beta"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_with_config() {
        let cli =
            Cli::try_parse_from(["slotwise", "-c", "/custom/config.toml", "audit"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }
}
