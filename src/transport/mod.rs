mod http_transport;

pub use http_transport::{upstream_status_error, HttpTransport, UpstreamRequest};
