use std::process::ExitCode;

/// Categories of application errors that can be matched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Argument validation errors
    ArgValidation,
    /// Missing, unreadable or invalid configuration
    Config,
    /// The archive given on the command line could not be read
    Input,
    /// A publish run ended in anything but success. The outcome is reported as soon as it is
    /// known, so this variant only exists to produce the correct `ExitCode`.
    Publish,
    /// The HTTP server could not start or stopped with an error
    Server,
    /// General IO errors
    IO,
}

/// Internal error type that contains all application error variants.
#[derive(Debug, thiserror::Error)]
pub enum AppErrorInner {
    #[error("Argument error: {0}")]
    ArgValidation(String),
    #[error("Configuration error")]
    Config(#[source] publish::ConfigError),
    #[error(transparent)]
    Input(publish::InputError),
    #[error("Publish did not succeed")]
    Publish,
    #[error(transparent)]
    Server(anyhow::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("failed to render configuration as {format}")]
    Render {
        format: &'static str,
        #[source]
        err: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The main application-level error type: everything we'd want to report to the user, with a kind
/// that picks the exit code. The concrete inner error is kept (rather than flattening into
/// `anyhow`) so the kind survives and the source chain can be printed.
///
/// This type uses the newtype pattern to wrap a boxed inner error, reducing stack size.
#[derive(Debug)]
pub struct AppError(Box<AppErrorInner>, AppErrorKind);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl AppError {
    pub fn new(inner: AppErrorInner, kind: AppErrorKind) -> Self {
        Self(Box::new(inner), kind)
    }

    pub fn error_kind(&self) -> &AppErrorKind {
        &self.1
    }

    pub fn arg_validation(msg: String) -> Self {
        Self::new(AppErrorInner::ArgValidation(msg), AppErrorKind::ArgValidation)
    }

    pub fn config(err: publish::ConfigError) -> Self {
        Self::new(AppErrorInner::Config(err), AppErrorKind::Config)
    }

    pub fn input(err: publish::InputError) -> Self {
        Self::new(AppErrorInner::Input(err), AppErrorKind::Input)
    }

    pub fn publish() -> Self {
        Self::new(AppErrorInner::Publish, AppErrorKind::Publish)
    }

    pub fn server(err: anyhow::Error) -> Self {
        Self::new(AppErrorInner::Server(err), AppErrorKind::Server)
    }

    pub fn render<E>(format: &'static str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(
            AppErrorInner::Render {
                format,
                err: Box::new(err),
            },
            AppErrorKind::IO,
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::new(AppErrorInner::IO(err), AppErrorKind::IO)
    }
}

impl From<AppError> for ExitCode {
    fn from(error: AppError) -> Self {
        ExitCode::from(match error.error_kind() {
            AppErrorKind::Publish => 1,
            AppErrorKind::ArgValidation | AppErrorKind::Config => 2,
            _ => 3,
        })
    }
}
