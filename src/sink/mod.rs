//! Renderers that turn a translation into what the caller receives.
use bytes::Bytes;
use smallvec::SmallVec;

pub mod chat_stream;
pub mod passthrough;
pub mod synthesize;

/// Frames produced by one step; most steps write one or two.
pub type Frames = SmallVec<[Bytes; 4]>;

pub use chat_stream::{ChatChunkSink, ChatStreamOptions};
pub use passthrough::{probe_document, PassthroughSink, UsageProbe};
pub use synthesize::{
    force_billing_developer, synthesize_chat_completion, synthesize_response,
    ChatCompletionIdentity,
};
