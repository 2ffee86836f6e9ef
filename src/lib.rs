//! objex - typed object exchange over TCP.
//!
//! Two peers trade runtime-typed objects over a duplex byte stream. Each
//! object travels in a self-describing frame: a length-prefixed envelope
//! carrying an exchange code, the object's runtime type identifier, and
//! the serialized payload as UTF-8 text. Frames whose exchange code does
//! not match the receiving session's are silently discarded, which lets
//! independently coded channels share a transport.
//!
//! [`ExchangeSession`] is one endpoint (client or server role) wrapping
//! one socket; [`TypedExchange`] fixes the payload type and derives a
//! per-type exchange code. A background receive loop, started with
//! [`ExchangeSession::start_listening`], broadcasts every inbound frame
//! to [`ExchangeSession::subscribe_objects`] subscribers.

pub mod codec;
pub mod error;
pub mod events;
pub mod frame;
pub mod session;
pub mod state;
pub mod typed;

pub use codec::{Codec, JsonCodec, PrettyJsonCodec};
pub use error::{CodecError, ExchangeError, Result};
pub use events::{Received, StateChange};
pub use frame::{type_code, Frame, DEFAULT_EXCHANGE_CODE, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use session::{ExchangeConfig, ExchangeSession, DEFAULT_CONNECT_TIMEOUT};
pub use state::SessionState;
pub use typed::TypedExchange;
