//! Text and reasoning accumulation with the thinking → content transition.
use smallvec::SmallVec;

pub const THINK_OPEN: &str = "<think>\n";
pub const THINK_CLOSE: &str = "\n</think>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingState {
    #[default]
    NotStarted,
    InsideThinking,
    Transitioned,
}

/// What to forward downstream for one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Visible content (may carry a thinking marker).
    Content(String),
    /// Reasoning forwarded as the `reasoning_content` field.
    Reasoning(String),
}

pub type Emissions = SmallVec<[Emission; 2]>;

/// Tracks text and reasoning for one response.
///
/// With markers enabled reasoning is folded into content between
/// `<think>` tags; otherwise it is forwarded as its own field. Reasoning
/// arriving after the first text delta is kept for billing but not replayed.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    text: String,
    reasoning: String,
    state: ThinkingState,
    use_markers: bool,
}

impl DeltaTracker {
    #[must_use]
    pub fn new(use_markers: bool) -> Self {
        Self {
            use_markers,
            ..Self::default()
        }
    }

    pub fn on_reasoning(&mut self, delta: &str) -> Option<Emission> {
        if delta.is_empty() {
            return None;
        }
        self.reasoning.push_str(delta);
        match self.state {
            ThinkingState::Transitioned => None,
            ThinkingState::NotStarted => {
                self.state = ThinkingState::InsideThinking;
                Some(if self.use_markers {
                    Emission::Content(format!("{THINK_OPEN}{delta}"))
                } else {
                    Emission::Reasoning(delta.to_string())
                })
            }
            ThinkingState::InsideThinking => Some(if self.use_markers {
                Emission::Content(delta.to_string())
            } else {
                Emission::Reasoning(delta.to_string())
            }),
        }
    }

    pub fn on_text(&mut self, delta: &str) -> Emissions {
        let mut out = Emissions::new();
        if delta.is_empty() {
            return out;
        }
        self.text.push_str(delta);
        if self.state == ThinkingState::InsideThinking && self.use_markers {
            out.push(Emission::Content(THINK_CLOSE.to_string()));
        }
        self.state = ThinkingState::Transitioned;
        out.push(Emission::Content(delta.to_string()));
        out
    }

    /// Close an open thinking block when the stream ends inside it.
    pub fn close(&mut self) -> Option<Emission> {
        if self.state == ThinkingState::InsideThinking && self.use_markers {
            self.state = ThinkingState::Transitioned;
            return Some(Emission::Content(THINK_CLOSE.to_string()));
        }
        None
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    #[must_use]
    pub fn state(&self) -> ThinkingState {
        self.state
    }
}
