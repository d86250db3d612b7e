//! Provider adaptors and the per-request relay loop.
pub mod adaptor;
pub mod driver;

pub use adaptor::{Adaptor, ChannelAdaptor, InboundRequest, Pairing, RequestPlan};
pub use driver::{error_frame, relay_body, Downstream, RelayContext, RelayOutcome};
