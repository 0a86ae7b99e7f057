#![doc(html_root_url = "https://docs.rs/hubwire/latest")]
//! Public API for the `hubwire` library.
//!
//! A client for real-time hub servers: negotiate a transport, exchange
//! invocations, completions and streams in JSON or MessagePack, and run
//! client-side handlers for server-initiated calls.

pub mod binder;
mod connection;
pub mod error;
mod handlers;
pub mod http;
mod invocation;
pub mod message;
pub mod metrics;
pub mod negotiate;
pub mod panic;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod value;

pub use binder::{ArgumentBindingError, InvocationBinder, UntypedBinder};
pub use connection::{
    AccessTokenProvider,
    ClosedCallback,
    HubConnection,
    HubConnectionBuilder,
    HubConnectionState,
};
pub use error::{HandshakeError, HubError, NegotiateError};
pub use handlers::{ActionHandler, ResultHandler, Subscription};
pub use http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use message::{CompletionMessage, HubMessage, MessageType};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, MESSAGES_TOTAL};
pub use protocol::{
    HubProtocol,
    JsonHubProtocol,
    MessagePackHubProtocol,
    ProtocolError,
    TransferFormat,
};
pub use stream::{BoxError, HubArgument, HubStream, UploadSource};
pub use transport::{
    CloseCallback,
    LongPollingTransport,
    ReceiveCallback,
    Transport,
    TransportError,
    TransportKind,
    WebSocketTransport,
};
pub use value::{BindError, Shape, Value};
