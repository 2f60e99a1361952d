//! Control-channel transports.
//!
//! The bridge brings PHP up in one of two ways: spawning a CLI child process
//! ([`child`]), or issuing a long-running FastCGI request to a PHP-FPM pool
//! ([`fcgi`]). Either way, the bootstrap connects back to the host's
//! [`listener`] and authenticates with the handshake key before the socket
//! becomes the control channel.

pub mod child;
pub mod fcgi;
pub mod listener;

pub use listener::{ControlListener, ControlStream};
