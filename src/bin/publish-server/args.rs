use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::FromArgMatches;
use clap::{CommandFactory, Parser};

use publish::Settings;

use crate::error::AppError;

// Shamelessly borrowed from https://github.com/crate-ci/clap-cargo/blob/0378657ffdf2b67bcd6f1ab56e04a1322b92dd0e/src/style.rs
// thanks to https://stackoverflow.com/a/79614957
use anstyle::AnsiColor::*;
use anstyle::Effects;
use anstyle::Style;

const HEADER: Style = Green.on_default().effects(Effects::BOLD);
const USAGE: Style = Green.on_default().effects(Effects::BOLD);
const LITERAL: Style = Cyan.on_default().effects(Effects::BOLD);
const PLACEHOLDER: Style = Cyan.on_default();
const ERROR: Style = Red.on_default().effects(Effects::BOLD);
const VALID: Style = Cyan.on_default().effects(Effects::BOLD);
const INVALID: Style = Yellow.on_default().effects(Effects::BOLD);

const APP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(HEADER)
    .usage(USAGE)
    .literal(LITERAL)
    .placeholder(PLACEHOLDER)
    .error(ERROR)
    .valid(VALID)
    .invalid(INVALID);

#[derive(Debug, Parser)]
#[command(name = "publish-server")]
#[command(about = "Publish uploaded source archives to a git repository to trigger CI/CD")]
#[command(long_about = None)]
#[command(styles = APP_STYLING)]
#[command(term_width = 80)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Settings that can be given on the command line. These override the config file and the
/// environment.
#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// TOML file with settings. Environment variables override values in the file.
    #[arg(long, short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Branch to clone and push [env: APP_REPO_BRANCH, default: main]
    #[arg(long, value_name = "BRANCH")]
    branch: Option<String>,

    /// Directory inside the repository that receives the archive contents. Omit, or use `.`, for
    /// the repository root [env: APP_SOURCE_SUBDIR]
    #[arg(long, value_name = "DIR")]
    target_subdir: Option<String>,

    /// Where the working copy is cloned [env: APP_REPO_LOCAL_PATH, default: temp-app-repo]
    #[arg(long, value_name = "PATH")]
    local_path: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the upload server
    Serve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Port to listen on [env: UPLOAD_APP_PORT, default: 3001]
        #[arg(long, short = 'p', value_name = "PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        /// Version-control backend
        #[arg(long, value_enum, value_name = "BACKEND", default_value_t = Backend::Git)]
        backend: Backend,
    },
    /// Publish one archive from the local filesystem and exit
    Publish {
        /// Zip archive to publish
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,

        /// Version-control backend
        #[arg(long, value_enum, value_name = "BACKEND", default_value_t = Backend::Git)]
        backend: Backend,
    },
    /// Validate the configuration and print it with credentials masked
    Check {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format
        #[arg(long, short = 'f', value_enum, value_name = "FORMAT")]
        format: Option<OutputFormat>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Run the `git` executable
    Git,
    /// Use libgit2 (requires the `libgit2` feature)
    Libgit2,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    /// Output in JSON format
    Json,
    /// Output in TOML format
    Toml,
}

#[derive(Debug)]
pub struct ValidatedArgs {
    pub command: ValidatedCommand,
}

#[derive(Debug)]
pub enum ValidatedCommand {
    Serve {
        settings: Settings,
        addr: SocketAddr,
        backend: Backend,
    },
    Publish {
        archive: PathBuf,
        settings: Settings,
        backend: Backend,
    },
    Check {
        settings: Settings,
        format: Option<OutputFormat>,
    },
}

impl ConfigArgs {
    /// Layer the config file, the environment and these arguments, in that order.
    fn into_settings(self) -> Result<Settings, AppError> {
        let file = match &self.config {
            Some(path) => {
                if !path.is_file() {
                    return Err(AppError::arg_validation(format!(
                        "config file does not exist: {}",
                        path.display()
                    )));
                }
                Settings::from_toml_file(path).map_err(AppError::config)?
            }
            None => Settings::default(),
        };
        let env = Settings::from_env().map_err(AppError::config)?;
        let flags = Settings {
            branch: self.branch,
            target_subdir: self.target_subdir,
            local_path: self.local_path,
            ..Settings::default()
        };
        Ok(file.merge(env).merge(flags))
    }
}

impl Backend {
    fn validate(self) -> Result<Self, AppError> {
        if self == Backend::Libgit2 && !cfg!(feature = "libgit2") {
            return Err(AppError::arg_validation(
                "the libgit2 backend is not available in this build".to_string(),
            ));
        }
        Ok(self)
    }
}

impl TryFrom<Command> for ValidatedCommand {
    type Error = AppError;

    fn try_from(command: Command) -> Result<Self, Self::Error> {
        match command {
            Command::Serve {
                config,
                port,
                bind,
                backend,
            } => {
                let mut settings = config.into_settings()?;
                if port.is_some() {
                    settings.port = port;
                }
                Ok(ValidatedCommand::Serve {
                    addr: SocketAddr::new(bind, settings.port()),
                    settings,
                    backend: backend.validate()?,
                })
            }
            Command::Publish {
                archive,
                config,
                backend,
            } => {
                if !archive.is_file() {
                    return Err(AppError::arg_validation(format!(
                        "archive does not exist: {}",
                        archive.display()
                    )));
                }
                Ok(ValidatedCommand::Publish {
                    archive,
                    settings: config.into_settings()?,
                    backend: backend.validate()?,
                })
            }
            Command::Check { config, format } => Ok(ValidatedCommand::Check {
                settings: config.into_settings()?,
                format,
            }),
        }
    }
}

pub fn parse() -> Result<ValidatedArgs, AppError> {
    let matches = Args::command()
        .version(env!("CARGO_PKG_VERSION"))
        .get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(err) => {
            err.format(&mut Args::command()).exit();
        }
    };
    Ok(ValidatedArgs {
        command: ValidatedCommand::try_from(args.command)?,
    })
}
