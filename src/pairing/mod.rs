//! Station pairing: single-use, short-lived session tokens carried by QR
//! codes, and the protocol that binds an authenticated mobile user to them.
//!
//! ## Security
//! - Tokens expire after 5 minutes, enforced on every read
//! - Tokens are single-use: binding is a compare-and-swap on the session row
//! - Credential failures never reveal whether the email exists

pub mod coordinator;
pub mod qr;
pub mod registry;

pub use coordinator::{BindingCoordinator, IssuedToken, SessionPoll, Teardown};
pub use qr::{render_terminal, QrEncoder, SvgQrEncoder};
pub use registry::{
    token_prefix, MemorySessionRegistry, RegistrySettings, Session, SessionRegistry,
    SessionStatus, SqliteSessionRegistry,
};
