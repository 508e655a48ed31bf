pub mod history;
pub mod mode;
pub mod tracker;

pub use history::{ConversationHistory, Turn};
pub use mode::{Event, FlowContext, ImageHandle, Mode, Outcome, RejectReason, UserId};
pub use tracker::ConversationTracker;
