//! Conversation relay between browser chat clients and a Bot Framework
//! Direct Line bot.
//!
//! The crate covers credential caching, conversation creation with regional
//! failover, the watermark-driven reply poller and the push-stream bridge.
//! HTTP routing lives in the `relay-gateway` binary.
pub mod activity;
pub mod bridge;
pub mod config;
pub mod directline_client;
pub mod error;
pub mod gateway;
pub mod relay;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod token;
pub mod watermark;

pub use activity::{
    Activity, Attachment, CardAction, MalformedActivity, SenderRole, normalize_activity,
};
pub use bridge::{BridgeExit, RelayEvent, StreamingBridge};
pub use config::RelayConfig;
pub use directline_client::{
    ActivitySet, ConversationResponse, DirectLineApi, DirectLineError, OutboundActivity,
    ReqwestDirectLineApi, SharedDirectLineApi,
};
pub use error::{RelayError, SessionStartError};
pub use gateway::{ConversationHandle, Regions, UpstreamGateway};
pub use relay::{ConversationRelay, DeliveryMode, OutboundMessage, RelaySettings, Reply};
pub use session::{Session, SessionHandle, SessionRegistry, SharedSession};
pub use stream::{ActivityStream, SharedStreamConnector, StreamConnector, WebSocketConnector};
pub use token::{
    CredentialError, CredentialSource, SecretExchange, SharedCredentialSource, StaticSecret, Token,
    TokenProvider,
};
pub use watermark::{CursorTracker, Watermark};
