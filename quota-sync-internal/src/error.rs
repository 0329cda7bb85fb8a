#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Failures that leave the last fetched count valid and are shown to the user as a banner
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            *self.0,
            ErrorDetails::Fetch { .. }
                | ErrorDetails::FetchTimeout { .. }
                | ErrorDetails::InvalidRow { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    Fetch {
        table: String,
        message: String,
    },
    FetchTimeout {
        table: String,
        timeout_ms: u64,
    },
    InvalidRow {
        table: String,
        key: String,
        message: String,
    },
    Observability {
        message: String,
    },
    Serialization {
        message: String,
    },
    Subscription {
        channel: String,
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::Fetch { .. } => tracing::Level::WARN,
            ErrorDetails::FetchTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRow { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::WARN,
            // Live updates are best-effort, losing them is not worth more than a warning
            ErrorDetails::Subscription { .. } => tracing::Level::WARN,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::Fetch { table, message } => {
                write!(f, "Error reading counter table `{table}`: {message}")
            }
            ErrorDetails::FetchTimeout { table, timeout_ms } => {
                write!(
                    f,
                    "Timed out after {timeout_ms}ms reading counter table `{table}`"
                )
            }
            ErrorDetails::InvalidRow {
                table,
                key,
                message,
            } => {
                write!(f, "Invalid row `{key}` in counter table `{table}`: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Error setting up observability: {message}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Error (de)serializing change-feed payload: {message}")
            }
            ErrorDetails::Subscription { channel, message } => {
                write!(f, "Error subscribing to change feed `{channel}`: {message}")
            }
        }
    }
}

impl std::error::Error for Error {}
