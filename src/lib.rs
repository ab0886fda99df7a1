//! # Introduction
//! Remote procedure calls and work distribution between services, brokered
//! by a shared redis instance. Callers publish typed messages; receiver
//! processes consume them, run registered handlers, and push the results
//! back onto per-task reply lists. Receivers are reconfigurable at runtime
//! through in-band control messages: they can start or stop handling message
//! classes, join arbitrary queues, carry routing tags, report status, and
//! shut down.

pub mod codec;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod identity;
pub mod message;
pub mod payload;
pub mod receiver;
pub mod request;
pub mod response;
pub mod session;

use r2d2::{Pool, PooledConnection};
use redis::Client;
use std::time::Duration;

// re-exports:
/// Pluggable payload encoding; JSON by default.
pub use codec::{Codec, JsonCodec};
/// In-band messages every receiver answers about itself.
pub use control::{
    AddQueue, GetRegisteredMessages, InstanceParam, RegisterAll, RegisterMessage, RemoveQueue,
    SetReceiverTags, ShutDownReceiver, UnregisterMessage,
};
/// Broker connection owner and discovery layer.
pub use dispatcher::{Dispatcher, DispatcherConfig, ReceiverStatus};
pub use error::{RpcError, RpcErrorKind};
/// Handler registration and resolution.
pub use handler::{CallContext, HandlerInstance, HandlerRegistry, HandlerState};
pub use message::RpcMessage;
pub use payload::{HandlerError, JsonMap, ResponsePayload, SessionData};
/// The polling worker that serves registered handlers.
pub use receiver::{Receiver, ReceiverConfig, ReceiverHandle, ReceiverHooks};
pub use request::{MultiRequest, Request};
pub use response::{RawResponse, ResponseHandle};
pub use session::Session;

/// Type alias for [`Pool`](Pool) with [`Client`](Client), which is used widely in this crate.
pub type RedisPool = Pool<Client>;
/// Alias for connection, which may be got from pool.
pub type RedisConnection = PooledConnection<Client>;

/// Alias for specifying timeouts in this crate.
pub type Timeout = Duration;
/// Sometimes timeouts are optional, and [`None`](None) may be used instead of a specified
/// timeout (the dispatcher default applies then). This type alias covers that possibility.
pub type OptionalTimeout = Option<Duration>;
