//! Command-line flags.

use std::{ffi::OsString, path::PathBuf};

use clap::{CommandFactory, FromArgMatches, Parser, error::ErrorKind};

use crate::{FatalError, version::BridgeInfo};

/// Flags shared by every bridge built on bridgehead.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(disable_version_flag = true)]
pub struct Flags {
    /// The path to your config file.
    #[arg(short = 'c', long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Don't save updated config to disk.
    #[arg(short = 'n', long = "no-update")]
    pub no_update: bool,

    /// The path where to save the appservice registration.
    #[arg(short = 'r', long, default_value = "registration.yaml")]
    pub registration: PathBuf,

    /// Generate registration and quit.
    #[arg(short = 'g', long)]
    pub generate_registration: bool,

    /// View bridge version and quit.
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Run even if the database schema is too new.
    #[arg(long)]
    pub ignore_unsupported_database: bool,

    /// Run even if the database contains tables from other programs (like a homeserver).
    #[arg(long)]
    pub ignore_foreign_tables: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            no_update: false,
            registration: PathBuf::from("registration.yaml"),
            generate_registration: false,
            version: false,
            ignore_unsupported_database: false,
            ignore_foreign_tables: false,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFlags {
    /// Run with these flags.
    Run(Flags),
    /// `--help`: print this text and exit successfully.
    Help(String),
}

impl Flags {
    /// Parse `args` (including the program name) for the bridge `info`.
    ///
    /// Help output is returned rather than printed; any other parse failure
    /// is [`FatalError::Flags`].
    pub fn parse_for<I, T>(info: &BridgeInfo, args: I) -> Result<ParsedFlags, FatalError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let command = Self::command()
            .name(info.name.clone())
            .about(format!("{} - {}", info.name, info.description))
            .override_usage(format!("{} [-hgvn] [-c <path>] [-r <path>]", info.name));

        let matches = match command.try_get_matches_from(args) {
            Ok(matches) => matches,
            Err(e) if e.kind() == ErrorKind::DisplayHelp => {
                return Ok(ParsedFlags::Help(e.render().to_string()));
            },
            Err(e) => return Err(FatalError::Flags(e.render().to_string())),
        };

        Self::from_arg_matches(&matches)
            .map(ParsedFlags::Run)
            .map_err(|e| FatalError::Flags(e.to_string()))
    }
}
