//! Custom error types for the speed test application.
//!
//! Every public operation reports failure as a single [`SpeedTestError`]
//! naming the stage that failed; raw transport errors are kept as the
//! error source.

use crate::ookla::probe::ProbeError;
use std::error::Error;
use std::fmt;

/// Boxed error used by internal helpers before stage wrapping.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, timeout, etc.).
    pub const NETWORK_ERROR: i32 = 1;
    /// API error (server returned an error or unparseable response).
    pub const API_ERROR: i32 = 2;
    /// Configuration error (invalid arguments).
    pub const CONFIG_ERROR: i32 = 3;
    /// A measurement could not be completed.
    pub const MEASUREMENT_ERROR: i32 = 4;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during speed testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network connectivity issues.
    Network,
    /// DNS resolution failures.
    Dns,
    /// Connection timeout.
    Timeout,
    /// TLS/SSL handshake failures.
    Tls,
    /// API returned an error response.
    Api,
    /// A response could not be parsed.
    Parse,
    /// Invalid configuration or arguments.
    Config,
    /// Measurement calculation errors.
    Measurement,
    /// Unknown or unexpected errors.
    Unknown,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Network
            | ErrorKind::Dns
            | ErrorKind::Timeout
            | ErrorKind::Tls => exit_codes::NETWORK_ERROR,
            ErrorKind::Api | ErrorKind::Parse => exit_codes::API_ERROR,
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::Measurement => exit_codes::MEASUREMENT_ERROR,
            ErrorKind::Unknown => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error",
            ErrorKind::Dns => "DNS resolution error",
            ErrorKind::Timeout => "Connection timeout",
            ErrorKind::Tls => "TLS/SSL error",
            ErrorKind::Api => "API error",
            ErrorKind::Parse => "Invalid response",
            ErrorKind::Config => "Configuration error",
            ErrorKind::Measurement => "Measurement error",
            ErrorKind::Unknown => "Unknown error",
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            ErrorKind::Network => {
                Some("Check your internet connection and try again.")
            }
            ErrorKind::Dns => Some(
                "Check your DNS settings or try using a different DNS server.",
            ),
            ErrorKind::Timeout => {
                Some("The server may be slow or unreachable. Try again later.")
            }
            ErrorKind::Tls => {
                Some("There may be a certificate issue. Check your system time.")
            }
            ErrorKind::Api | ErrorKind::Parse => Some(
                "speedtest.net may be experiencing issues. Try again later.",
            ),
            ErrorKind::Measurement => {
                Some("Try again, or pick another server with --server-id.")
            }
            ErrorKind::Config | ErrorKind::Unknown => None,
        }
    }
}

/// The stages of a full test run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    FetchingConfig,
    ListingServers,
    RankingServers,
    ProbingBaseline,
    MeasuringDownload,
    MeasuringUpload,
    Done,
}

impl Stage {
    /// What the run was doing, phrased to follow "while".
    pub fn activity(&self) -> &'static str {
        match self {
            Stage::FetchingConfig => {
                "retrieving test configuration from speedtest.net"
            }
            Stage::ListingServers => {
                "retrieving the server list from speedtest.net"
            }
            Stage::RankingServers => "ranking the test servers",
            Stage::ProbingBaseline => "measuring latency",
            Stage::MeasuringDownload => "measuring the download speed",
            Stage::MeasuringUpload => "measuring the upload speed",
            Stage::Done => "assembling the results",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FetchingConfig => "fetching config",
            Stage::ListingServers => "listing servers",
            Stage::RankingServers => "ranking servers",
            Stage::ProbingBaseline => "probing baseline latency",
            Stage::MeasuringDownload => "measuring download",
            Stage::MeasuringUpload => "measuring upload",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A user-friendly error type for speed test operations.
#[derive(Debug)]
pub struct SpeedTestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// The stage that failed, when the error came from a test run.
    pub stage: Option<Stage>,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<BoxError>,
}

impl SpeedTestError {
    /// Create a new SpeedTestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
            suggestion: kind.suggestion().map(str::to_string),
            source: None,
        }
    }

    /// Wrap a failure of `stage`, classifying it from the source error.
    ///
    /// The message reads "An error occurred while <activity>: <source>".
    pub fn at_stage(stage: Stage, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        let kind = classify_error(source.as_ref());
        let message =
            format!("An error occurred while {}: {}", stage.activity(), source);

        let mut error = Self::new(kind, message);
        error.stage = Some(stage);
        error.source = Some(source);
        error
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a measurement error.
    pub fn measurement(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Measurement, message)
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Message fragments tried in order once no typed error in the chain has
/// settled the kind.
const MESSAGE_PATTERNS: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Dns, &["dns", "resolve", "no such host"]),
    (ErrorKind::Timeout, &["timeout", "timed out", "deadline"]),
    (ErrorKind::Tls, &["tls", "ssl", "certificate", "handshake"]),
    (
        ErrorKind::Network,
        &[
            "connection refused",
            "connection reset",
            "connection closed",
            "unreachable",
            "no route",
            "broken pipe",
        ],
    ),
    (ErrorKind::Api, &["status client error", "status server error"]),
    (
        ErrorKind::Parse,
        &["parse", "parsing", "expected", "invalid type", "missing field"],
    ),
    (ErrorKind::Measurement, &["no latency samples", "no reachable"]),
];

/// Classify an error, preferring the first typed error found along its
/// source chain and falling back to the chained message text.
pub fn classify_error(error: &(dyn Error + 'static)) -> ErrorKind {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(kind) = typed_kind(e) {
            return kind;
        }
        current = e.source();
    }

    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    let text = text.to_lowercase();

    MESSAGE_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| text.contains(p)))
        .map_or(ErrorKind::Unknown, |(kind, _)| *kind)
}

fn typed_kind(error: &(dyn Error + 'static)) -> Option<ErrorKind> {
    use tokio_tungstenite::tungstenite::Error as WsError;

    if let Some(probe) = error.downcast_ref::<ProbeError>() {
        return match probe {
            ProbeError::ConnectTimeout(_) => Some(ErrorKind::Timeout),
            ProbeError::NoSamples | ProbeError::StatsNotArmed => {
                Some(ErrorKind::Measurement)
            }
            ProbeError::Connect(_) | ProbeError::Channel(_) => None,
        };
    }

    if let Some(ws) = error.downcast_ref::<WsError>() {
        return match ws {
            WsError::Tls(_) => Some(ErrorKind::Tls),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Some(ErrorKind::Network)
            }
            WsError::Http(_) => Some(ErrorKind::Api),
            _ => None,
        };
    }

    if let Some(http) = error.downcast_ref::<reqwest::Error>() {
        if http.is_timeout() {
            return Some(ErrorKind::Timeout);
        }
        if http.status().is_some() {
            return Some(ErrorKind::Api);
        }
        if http.is_decode() {
            return Some(ErrorKind::Parse);
        }
        return None;
    }

    if error.is::<serde_json::Error>() || error.is::<quick_xml::DeError>() {
        return Some(ErrorKind::Parse);
    }

    None
}

/// Format an error for user display.
pub fn format_error_for_display(error: &SpeedTestError) -> String {
    let mut output = format!("Error: {}", error.message);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}
