//! Request/response client for the line-oriented UPS server protocol,
//! with optional in-place TLS upgrade.

pub mod error;
pub mod ident;
pub mod session;
pub mod tls;
pub mod words;

pub use error::{ClientError, ServerError};
pub use ident::{IdentityError, UpsIdentity, DEFAULT_PORT};
pub use session::{ConnectFlags, Session, LINE_MAX, NET_TIMEOUT};
pub use tls::TlsPolicy;
