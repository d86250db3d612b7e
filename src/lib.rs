pub(crate) mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod history;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod sink;
pub mod state;
pub mod stream;
pub mod transport;

mod util;
