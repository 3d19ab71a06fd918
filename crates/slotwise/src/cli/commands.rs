//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};
use semver::Version;

/// Update server commands.
#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    /// Run the update server
    Serve {
        /// Address to listen on (overrides `server.bind`)
        #[arg(short, long)]
        bind: Option<std::net::SocketAddr>,
    },
}

/// Publish command arguments.
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Channel to publish into; created if missing
    #[arg(long)]
    pub channel: String,

    /// Version of the new release
    #[arg(long, value_name = "VERSION")]
    pub release_version: Version,

    /// Path to the full image
    #[arg(short, long, value_name = "FILE")]
    pub image: PathBuf,

    /// Release notes
    #[arg(long, default_value = "")]
    pub changelog: String,

    /// Oldest release to build deltas from
    #[arg(long, value_name = "VERSION")]
    pub minimum_source_version: Option<Version>,

    /// Signing key file (overrides `trust.signing_key_path`)
    #[arg(short, long, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "plain")]
    pub format: OutputFormat,
}

/// Retire command arguments.
#[derive(Debug, Args)]
pub struct RetireCommand {
    /// Channel of the release
    #[arg(long)]
    pub channel: String,

    /// Version to retire
    #[arg(long, value_name = "VERSION")]
    pub release_version: Version,
}

/// Releases command arguments.
#[derive(Debug, Args)]
pub struct ReleasesCommand {
    /// Channel to list
    #[arg(long)]
    pub channel: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Channel commands.
#[derive(Debug, Subcommand)]
pub enum ChannelCommand {
    /// Create a channel
    Create {
        /// Channel name
        name: String,
    },
}

/// Audit command arguments.
#[derive(Debug, Args)]
pub struct AuditCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Keygen command arguments.
#[derive(Debug, Args)]
pub struct KeygenCommand {
    /// Where to write the signing key
    #[arg(short, long, value_name = "FILE")]
    pub out: PathBuf,

    /// Overwrite an existing key file
    #[arg(long)]
    pub force: bool,
}

/// Device agent commands.
#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Provision the device with its factory image
    Init {
        /// Version of the factory image
        #[arg(long, value_name = "VERSION")]
        release_version: Version,

        /// Path to the factory image
        #[arg(short, long, value_name = "FILE")]
        image: PathBuf,
    },

    /// Run the agent: recover, serve the control API and poll for updates
    Run {
        /// Recover, run one check and exit
        #[arg(long)]
        once: bool,
    },

    /// Ask the running agent to check for an update now
    Check,

    /// Ask the running agent to apply its staged update
    Apply,

    /// Ask the running agent to cancel the current session
    Cancel,

    /// Report that the running version is healthy
    Healthy,

    /// Report that the running version is failing
    Failing,

    /// Show agent status
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Read the state file instead of asking the running agent
        #[arg(long)]
        offline: bool,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// Formatted table
    Table,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Plain);
    }

    #[test]
    fn test_agent_command_debug() {
        let cmd = AgentCommand::Status {
            json: true,
            offline: false,
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Status"));
    }
}
