//! Dialtone
//!
//! The connection establishment core of an asynchronous HTTP client.
//!
//! Given a destination described by a [`PoolKey`] (scheme, host or unix path,
//! optional SNI override), [`ConnectionFactory::make_channel`] produces a live,
//! protocol-negotiated byte [`Channel`] over which an HTTP/1.1 or HTTP/2
//! session can run. The pipeline composes address resolution, TCP or
//! unix-socket dialing, optional SOCKSv5 or HTTP `CONNECT` proxy negotiation,
//! and a TLS handshake with ALPN-based protocol selection, all bounded by a
//! single [`ConnectionDeadline`].
//!
//! A [`Transaction`] drives one request/response exchange over an established
//! channel, handling request-body backpressure, response delivery,
//! cancellation, and deadline propagation.

use std::future::Future;
use std::pin::Pin;

pub mod bootstrap;
mod channel;
mod deadline;
mod error;
pub mod factory;
pub mod proxy;
pub mod resolver;
pub(crate) mod select;
pub mod target;
pub mod tls;
pub mod transaction;

pub use channel::{Channel, HttpProtocol, NegotiatedProtocol};
pub use deadline::ConnectionDeadline;
pub use error::{BoxError, Error};
pub use factory::{ClientConfig, ConnectionFactory, ConnectionRequester};
pub use target::{PoolKey, Scheme, Target};
pub use tls::{HttpVersionPolicy, TlsConfig};
pub use transaction::Transaction;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
