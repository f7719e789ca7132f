//! # Client Error Kinds
//!
//! Every session operation returns a typed `Result`; there is no
//! per-session error register to inspect after the fact. Server-reported
//! `ERR <token>` replies are translated into [`ServerError`] variants at
//! the parsing boundary, transport problems carry their `std::io::Error`
//! source, and [`ClientError::is_transport`] tells the caller whether the
//! session is still usable.

use thiserror::Error;

use super::words::SplitError;

/// Errors reported by the server as `ERR <token>` replies.
///
/// The token list is closed; anything the server says that we do not
/// recognise becomes [`ServerError::Unknown`]. A server error leaves the
/// session connected - it is an application-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("Variable not supported by UPS")]
    VarNotSupported,
    #[error("Unknown UPS")]
    UnknownUps,
    #[error("Access denied")]
    AccessDenied,
    #[error("Password required")]
    PasswordRequired,
    #[error("Password incorrect")]
    PasswordIncorrect,
    #[error("Missing argument")]
    MissingArgument,
    #[error("Data stale")]
    DataStale,
    #[error("Variable unknown")]
    VarUnknown,
    #[error("Already logged in")]
    AlreadyLoggedIn,
    #[error("Already set password")]
    AlreadySetPassword,
    #[error("Unknown variable type")]
    UnknownType,
    #[error("Unknown variable")]
    UnknownVar,
    #[error("Read-only variable")]
    ReadOnly,
    #[error("New value is too long")]
    TooLong,
    #[error("Invalid value for variable")]
    InvalidValue,
    #[error("Set command failed")]
    SetFailed,
    #[error("Unknown instant command")]
    UnknownInstcmd,
    #[error("Instant command failed")]
    InstcmdFailed,
    #[error("Instant command not supported")]
    CmdNotSupported,
    #[error("Invalid username")]
    InvalidUsername,
    #[error("Already set username")]
    AlreadySetUsername,
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Username required")]
    UsernameRequired,
    #[error("Driver not connected")]
    DriverNotConnected,
    #[error("Unknown error")]
    Unknown,
}

impl ServerError {
    /// Map a server error token onto its kind.
    pub fn from_token(token: &str) -> Self {
        match token {
            "VAR-NOT-SUPPORTED" => Self::VarNotSupported,
            "UNKNOWN-UPS" => Self::UnknownUps,
            "ACCESS-DENIED" => Self::AccessDenied,
            "PASSWORD-REQUIRED" => Self::PasswordRequired,
            "PASSWORD-INCORRECT" => Self::PasswordIncorrect,
            "MISSING-ARGUMENT" => Self::MissingArgument,
            "DATA-STALE" => Self::DataStale,
            "VAR-UNKNOWN" => Self::VarUnknown,
            "ALREADY-LOGGED-IN" => Self::AlreadyLoggedIn,
            "ALREADY-SET-PASSWORD" => Self::AlreadySetPassword,
            "UNKNOWN-TYPE" => Self::UnknownType,
            "UNKNOWN-VAR" => Self::UnknownVar,
            "READONLY" => Self::ReadOnly,
            "TOO-LONG" => Self::TooLong,
            "INVALID-VALUE" => Self::InvalidValue,
            "SET-FAILED" => Self::SetFailed,
            "UNKNOWN-INSTCMD" => Self::UnknownInstcmd,
            "INSTCMD-FAILED" => Self::InstcmdFailed,
            "CMD-NOT-SUPPORTED" => Self::CmdNotSupported,
            "INVALID-USERNAME" => Self::InvalidUsername,
            "ALREADY-SET-USERNAME" => Self::AlreadySetUsername,
            "UNKNOWN-COMMAND" => Self::UnknownCommand,
            "INVALID-PASSWORD" => Self::InvalidPassword,
            "USERNAME-REQUIRED" => Self::UsernameRequired,
            "DRIVER-NOT-CONNECTED" => Self::DriverNotConnected,
            _ => Self::Unknown,
        }
    }
}

/// Everything a session operation can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    // --- transport ---
    #[error("No such host")]
    NoSuchHost,
    #[error("socket failure: {0}")]
    SocketFailure(#[source] std::io::Error),
    #[error("Connection failure: {0}")]
    ConnectFailure(#[source] std::io::Error),
    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),
    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),
    #[error("Server disconnected")]
    ServerDisconnected,
    #[error("server has no TLS support but it was required")]
    TlsRequired,
    #[error("TLS error: {0}")]
    Tls(String),

    // --- protocol ---
    #[error("Protocol error")]
    Protocol,
    #[error("Parse error: {0}")]
    Parse(#[from] SplitError),
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Invalid response from server")]
    InvalidResponse,

    // --- server-reported ---
    #[error("{0}")]
    Server(#[from] ServerError),
}

impl ClientError {
    /// True when the error invalidated the connection: the session must
    /// be dropped and re-established before the next operation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NoSuchHost
                | Self::SocketFailure(_)
                | Self::ConnectFailure(_)
                | Self::Write(_)
                | Self::Read(_)
                | Self::ServerDisconnected
                | Self::TlsRequired
                | Self::Tls(_)
        )
    }

    /// The server-reported kind, if this is an application-level error.
    pub fn server_error(&self) -> Option<ServerError> {
        match self {
            Self::Server(err) => Some(*err),
            _ => None,
        }
    }
}
