pub mod detect;
pub mod handshake;
pub mod inbound;
pub mod outbound;
pub mod relay;
pub mod session;
pub mod transport;

pub use detect::{detect, DetectionFailure};
pub use inbound::{Protocol, TargetDescriptor};
pub use outbound::{AttemptPlan, OutboundConnector};
pub use relay::{DuplexRelay, RelayStats};
pub use session::{accept_inbound_session, InboundSession, SessionContext};
pub use transport::xhttp::{handle_stream_request, StreamTunnel};
