//! rack request environment adapter for rust http servers
//!
//! For every inbound request, an [`EnvironmentBuilder`] turns the parsed
//! head ([`http::request::Parts`]) plus per-connection facts into an
//! [`Environment`]: the string-keyed, dictionary-shaped structure rack
//! applications consume. Well-known keys live in a fixed slot array behind
//! a shared [`KeyRegistry`]; anything else falls through to a generic
//! overflow map. Expensive fields are registered as deferred producers that
//! run at most once, on first read, so handlers only pay for what they
//! touch.
//!
//! The `rack.hijack` entry lets the application take exclusive ownership of
//! the raw connection [`Transport`], bypassing the server's own
//! request/response framing; [`Environment::is_hijacked`] is the signal the
//! server layer checks before writing a response.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rack_env::{ConnectionParts, EnvironmentBuilder, KeyRegistry, RackInput, Transport};
//!
//! let registry = Arc::new(KeyRegistry::new());
//! let builder = EnvironmentBuilder::new(registry);
//!
//! let request = http::Request::get("/greet?name=world").body(()).unwrap();
//! let (parts, _) = request.into_parts();
//!
//! let (stream, _peer) = tokio::io::duplex(64);
//! let conn = ConnectionParts {
//!     peer_addr: None,
//!     secure: false,
//!     transport: Transport::new(stream),
//! };
//!
//! let mut env = builder.build(&parts, conn, RackInput::empty()).unwrap();
//! assert_eq!(env.get("PATH_INFO").and_then(|v| v.as_str()), Some("/greet"));
//! assert_eq!(env.get("QUERY_STRING").and_then(|v| v.as_str()), Some("name=world"));
//! assert_eq!(env.get("rack.url_scheme").and_then(|v| v.as_str()), Some("http"));
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

mod builder;
pub use builder::{ConnectionParts, EnvironmentBuilder, RACK_VERSION};

mod env;
pub use env::{Environment, HIJACK_IO_KEY, LazyEntry, Value};

pub mod error;

mod hijack;
pub use hijack::HijackProc;

mod io;
pub use io::{ErrorSink, RackInput, RawStream, Transport};

mod key;
pub use key::{KeyRegistry, RackKey};
