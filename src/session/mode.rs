use std::fmt;

pub const MIN_RESET_TARGET_CHARS: usize = 3;

/// Platform-assigned user identity. Telegram user ids fit in an `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    AwaitingResetTarget,
    AwaitingOcrImage,
    AwaitingChatReply,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::AwaitingResetTarget => "awaiting_reset_target",
            Mode::AwaitingOcrImage => "awaiting_ocr_image",
            Mode::AwaitingChatReply => "awaiting_chat_reply",
        }
    }

    /// Human readable description of the input a pending mode is waiting for.
    pub fn expected_input(self) -> &'static str {
        match self {
            Mode::Idle => "nothing",
            Mode::AwaitingResetTarget => "a username or email address",
            Mode::AwaitingOcrImage => "a photo",
            Mode::AwaitingChatReply => "a message or a photo",
        }
    }
}

/// Data a flow needs once its expected input arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowContext {
    pub chat_id: Option<i64>,
    pub instruction: Option<String>,
}

impl FlowContext {
    pub fn for_chat(chat_id: i64) -> Self {
        Self {
            chat_id: Some(chat_id),
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: Option<String>) -> Self {
        self.instruction = instruction
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }
}

/// Opaque reference to an uploaded image, e.g. a Telegram file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Text(String),
    Image(ImageHandle),
    Button(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Text,
    Image,
    Button,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Text(_) => EventKind::Text,
            Event::Image(_) => EventKind::Image,
            Event::Button(_) => EventKind::Button,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooShort,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooShort => f.write_str("too short"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NotPending,
    Consumed(Mode, FlowContext),
    /// Carries the mode that is still pending, read under the same lock.
    Mismatch(Mode),
    Rejected(RejectReason),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::NotPending => "not_pending",
            Outcome::Consumed(..) => "consumed",
            Outcome::Mismatch(_) => "mismatch",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

/// Trims the submitted reset target and checks its length. Email and
/// username shapes are both accepted.
pub fn validate_reset_target(input: &str) -> Result<&str, RejectReason> {
    let trimmed = input.trim();
    if trimmed.chars().count() < MIN_RESET_TARGET_CHARS {
        return Err(RejectReason::TooShort);
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    NotPending,
    Accept,
    Mismatch,
    Reject(RejectReason),
}

/// The single `(mode, event kind)` transition table.
pub(crate) fn verdict(mode: Mode, event: &Event) -> Verdict {
    match (mode, event) {
        (Mode::Idle, _) => Verdict::NotPending,
        (Mode::AwaitingResetTarget, Event::Text(text)) => match validate_reset_target(text) {
            Ok(_) => Verdict::Accept,
            Err(reason) => Verdict::Reject(reason),
        },
        (Mode::AwaitingResetTarget, Event::Image(_) | Event::Button(_)) => Verdict::Mismatch,
        (Mode::AwaitingOcrImage, Event::Image(_)) => Verdict::Accept,
        (Mode::AwaitingOcrImage, Event::Text(_) | Event::Button(_)) => Verdict::Mismatch,
        (Mode::AwaitingChatReply, Event::Text(_) | Event::Image(_)) => Verdict::Accept,
        (Mode::AwaitingChatReply, Event::Button(_)) => Verdict::Mismatch,
    }
}
