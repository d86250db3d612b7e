//! The translation engine: decode upstream bodies into canonical events and
//! fold them into one merged response.
pub mod accumulator;
pub mod decoder;
pub mod sse;
pub mod state;
pub mod thinking;
pub mod usage;

pub use decoder::{canonical_event_stream, open_event_stream, EventStream};
pub use sse::ScannerLimits;
pub use state::{Finalized, Step, TranslationState};
