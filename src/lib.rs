//! php_world - drive a PHP interpreter from async Rust, in both directions.
//!
//! This crate spawns (or attaches to) a PHP interpreter and bridges it to the
//! host process over a private framed control channel, so PHP globals,
//! constants, functions, classes, and object instances read like local
//! symbols - while PHP code can call back into host functions and objects
//! re-entrantly over the same channel.
//!
//! # Features
//!
//! - **Two transports**: a CLI child process, or a FastCGI request into a
//!   long-running PHP-FPM pool
//! - **Authenticated handshake**: a random 32-byte key gates the inbound
//!   control connection
//! - **Typed façades**: `var`, `func`, `class`, and `obj` builders instead of
//!   dynamic attribute interception
//! - **Bidirectional handles**: opaque 31-bit handles name objects across
//!   the runtime boundary, with frame-scoped bulk release
//! - **Stdout multiplexer**: carve the interpreter's piped stdout into clean
//!   per-request readers using an in-band random sentinel
//!
//! # Example
//!
//! ```rust,ignore
//! use php_world::{PhpWorld, Settings};
//!
//! let mut php = PhpWorld::new(Settings::default());
//! let size = php.constant("PHP_INT_SIZE").await?;
//!
//! php.var("config").set(serde_json::json!({"debug": true})).await?;
//! let obj = php.class("ArrayObject").construct(&["x".into(), "y".into()]).await?;
//! let n = php.obj(&obj).call("count", &[]).await?;
//!
//! php.terminate().await;
//! ```
//!
//! # Architecture
//!
//! A host-side call enters the façade layer ([`api`]), which encodes it into
//! an opcode plus string payload and hands it to the dispatcher in
//! [`world`]. The dispatcher serializes writes through the framing codec
//! ([`protocol`]) onto the transport ([`transport`]). The PHP bootstrap
//! performs the operation and may emit reverse requests (host callbacks)
//! before its result; the dispatcher executes those re-entrantly and replies
//! with `DATA` records.

/// Package version from Cargo.toml
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (8 chars) with optional "-dirty" suffix
pub const BUILD_VERSION: &str = env!("BUILD_VERSION");

/// Full version string: "0.1.0 (abc12345)" or "0.1.0 (abc12345-dirty)"
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_VERSION"), ")");

pub mod api;
pub mod config;
pub mod error;
pub mod host;
pub mod marshal;
pub mod protocol;
pub mod registry;
pub mod stdout;
pub mod transport;
pub mod value;
pub mod world;

// Re-exports for convenience
pub use api::{PhpIter, PhpObject};
pub use config::{Settings, StdoutMode};
pub use error::{Error, InterpreterError, Result};
pub use host::{HostFn, HostObject, PropertyBag, SymbolTable};
pub use stdout::StdoutReader;
pub use value::Value;
pub use world::PhpWorld;
