//! A bidirectional message engine for the two JSON-RPC-framed editor
//! protocols: the Language Server Protocol and the Debug Adapter Protocol.
//!
//! Both protocols run over a byte-stream pair with `Content-Length` framing.
//! The engine is method-agnostic: payloads stay opaque JSON and handler
//! registrations supply the method name and payload shape. A [`Connection`]
//! owns the send, receive and dispatch loops; handlers run through a
//! Serial/Parallel [`scheduler`] and talk back through the [`Client`] handle.
//!
//! ```no_run
//! # #[cfg(feature = "lsp")]
//! # fn demo(handle: tokio::runtime::Handle) -> Result<(), Box<dyn std::error::Error>> {
//! use duplex_ls::{ConnectionBuilder, HandlerOptions, transport};
//!
//! let builder = ConnectionBuilder::lsp(handle);
//! let _ping = builder.registry().register_raw_request(
//!     "ping",
//!     HandlerOptions::default(),
//!     |_client, _params, _cancel| async { Ok(serde_json::json!("pong")) },
//! )?;
//! let (reader, writer) = transport::stdio();
//! let mut conn = builder.build(reader, writer);
//! conn.connect()?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "dap")]
pub mod dap;
#[cfg(feature = "lsp")]
pub mod lsp;

mod error;
pub use error::*;

mod msg;
pub use msg::*;

pub mod receiver;
pub mod req_queue;

mod scheduler;
pub use scheduler::{ProcessType, Scheduler};

mod registry;
pub use registry::*;

mod connection;
pub use connection::*;

pub mod transport;

/// The common result type of handlers: a value or a protocol error object.
pub type RpcResult<T> = Result<T, ResponseError>;
