//! Separates configuration flags from the subcommand line.
//!
//! Configuration flags must precede the subcommand. They are forwarded to
//! `ortho_config` together with the program name; everything from the first
//! unrecognised token onwards is parsed by `clap`.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use pgshare_config::Config;

use crate::AppError;

/// Configuration flags recognised ahead of the subcommand, and whether each
/// takes a separate value. Keep in sync with the fields of [`Config`].
const CONFIG_CLI_FLAGS: &[(&str, bool)] = &[
    ("--config-path", true),
    ("--bin-dir", true),
    ("--runtime-dir", true),
    ("--superuser", true),
    ("--listen-tcp", false),
    ("--lock-timeout-ms", true),
    ("--log-filter", true),
    ("--log-format", true),
];

pub(crate) trait ConfigLoader {
    /// Loads configuration from the forwarded flags.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Stop;
    }
    let (flag, inline_value) = match text.split_once('=') {
        Some((flag, _)) => (flag, true),
        None => (text.as_ref(), false),
    };
    CONFIG_CLI_FLAGS
        .iter()
        .find(|(known, _)| *known == flag)
        .map_or(FlagAction::Stop, |(_, takes_value)| FlagAction::Include {
            needs_value: *takes_value && !inline_value,
        })
}

/// Arguments for the configuration loader and for `clap`.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_arguments: Vec<OsString>,
}

pub(crate) fn split_arguments(args: &[OsString]) -> ArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ArgumentSplit::default();
    };
    let mut split = ArgumentSplit {
        config_arguments: vec![program.clone()],
        command_arguments: vec![program.clone()],
    };
    let mut index = 0;
    while index < rest.len() {
        match classify(&rest[index]) {
            FlagAction::Include { needs_value } => {
                split.config_arguments.push(rest[index].clone());
                index += 1;
                if needs_value && let Some(value) = rest.get(index) {
                    split.config_arguments.push(value.clone());
                    index += 1;
                }
            }
            FlagAction::Stop => break,
        }
    }
    split
        .command_arguments
        .extend(rest[index..].iter().cloned());
    split
}
