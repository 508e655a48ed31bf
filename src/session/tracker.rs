use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::session::mode::{verdict, Event, FlowContext, Mode, Outcome, UserId, Verdict};

pub const DEFAULT_SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct PendingFlow {
    mode: Mode,
    context: FlowContext,
}

/// Tracks, per user, the flow the user is mid-way through.
///
/// Users are spread over a fixed set of shards. Every operation takes exactly
/// one shard lock for its whole read-modify-write, so transitions for a single
/// user are linearizable while users in other shards never contend. Users with
/// no entry are `Idle`.
pub struct ConversationTracker {
    shards: Vec<Mutex<HashMap<UserId, PendingFlow>>>,
}

impl Default for ConversationTracker {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>();
        Self { shards }
    }

    fn shard(&self, user: UserId) -> &Mutex<HashMap<UserId, PendingFlow>> {
        let index = user.0.rem_euclid(self.shards.len() as i64) as usize;
        &self.shards[index]
    }

    /// Starts a flow, discarding whatever the user had pending before.
    pub fn begin(&self, user: UserId, mode: Mode, context: FlowContext) {
        let mut shard = self.shard(user).lock();
        if mode == Mode::Idle {
            shard.remove(&user);
            debug!(target: "bot.session", user = %user, "begin idle clears pending flow");
            return;
        }
        let previous = shard.insert(user, PendingFlow { mode, context });
        debug!(
            target: "bot.session",
            user = %user,
            mode = mode.label(),
            replaced = previous.map(|flow| flow.mode.label()).unwrap_or("none"),
            "flow started"
        );
    }

    /// Matches an inbound event against the user's pending mode.
    ///
    /// Only `Consumed` changes state: the user goes back to `Idle` and the
    /// stored context is handed to the caller. `Mismatch` and `Rejected`
    /// keep the pending flow so the user can retry.
    pub fn resolve(&self, user: UserId, event: &Event) -> Outcome {
        let mut shard = self.shard(user).lock();
        let outcome = apply_event(&mut shard, user, event);
        log_resolution(user, event, &outcome);
        outcome
    }

    /// Like `resolve`, but a flow started in another chat is left alone and
    /// `None` is returned. Flows without a recorded chat match any chat.
    pub fn resolve_in_chat(&self, user: UserId, chat_id: i64, event: &Event) -> Option<Outcome> {
        let mut shard = self.shard(user).lock();
        if let Some(flow) = shard.get(&user) {
            if flow.context.chat_id.is_some_and(|flow_chat| flow_chat != chat_id) {
                debug!(
                    target: "bot.session",
                    user = %user,
                    mode = flow.mode.label(),
                    chat_id,
                    "event from another chat left the flow pending"
                );
                return None;
            }
        }
        let outcome = apply_event(&mut shard, user, event);
        log_resolution(user, event, &outcome);
        Some(outcome)
    }

    pub fn cancel(&self, user: UserId) {
        let removed = self.shard(user).lock().remove(&user);
        if let Some(flow) = removed {
            debug!(
                target: "bot.session",
                user = %user,
                mode = flow.mode.label(),
                "flow cancelled"
            );
        }
    }

    pub fn is_pending(&self, user: UserId) -> bool {
        self.shard(user).lock().contains_key(&user)
    }

    pub fn pending_mode(&self, user: UserId) -> Mode {
        self.shard(user)
            .lock()
            .get(&user)
            .map(|flow| flow.mode)
            .unwrap_or(Mode::Idle)
    }
}

fn apply_event(flows: &mut HashMap<UserId, PendingFlow>, user: UserId, event: &Event) -> Outcome {
    match flows.entry(user) {
        Entry::Vacant(_) => Outcome::NotPending,
        Entry::Occupied(entry) => match verdict(entry.get().mode, event) {
            Verdict::NotPending => {
                entry.remove();
                Outcome::NotPending
            }
            Verdict::Accept => {
                let flow = entry.remove();
                Outcome::Consumed(flow.mode, flow.context)
            }
            Verdict::Mismatch => Outcome::Mismatch(entry.get().mode),
            Verdict::Reject(reason) => Outcome::Rejected(reason),
        },
    }
}

fn log_resolution(user: UserId, event: &Event, outcome: &Outcome) {
    debug!(
        target: "bot.session",
        user = %user,
        event = ?event.kind(),
        outcome = outcome.label(),
        "event resolved"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::session::mode::{ImageHandle, RejectReason};

    fn text(value: &str) -> Event {
        Event::Text(value.to_string())
    }

    fn image(value: &str) -> Event {
        Event::Image(ImageHandle(value.to_string()))
    }

    #[test]
    fn unseen_user_is_not_pending_for_any_event() {
        let tracker = ConversationTracker::new();
        let user = UserId(1);
        assert_eq!(tracker.resolve(user, &text("hello")), Outcome::NotPending);
        assert_eq!(tracker.resolve(user, &image("f")), Outcome::NotPending);
        assert_eq!(
            tracker.resolve(user, &Event::Button("flow:x".to_string())),
            Outcome::NotPending
        );
        assert!(!tracker.is_pending(user));
    }

    #[test]
    fn begin_marks_user_pending_for_every_real_mode() {
        let tracker = ConversationTracker::new();
        for (offset, mode) in [
            Mode::AwaitingResetTarget,
            Mode::AwaitingOcrImage,
            Mode::AwaitingChatReply,
        ]
        .into_iter()
        .enumerate()
        {
            let user = UserId(10 + offset as i64);
            tracker.begin(user, mode, FlowContext::default());
            assert!(tracker.is_pending(user));
            assert_eq!(tracker.pending_mode(user), mode);
        }
    }

    #[test]
    fn begin_idle_behaves_like_cancel() {
        let tracker = ConversationTracker::new();
        let user = UserId(3);
        tracker.begin(user, Mode::AwaitingOcrImage, FlowContext::default());
        tracker.begin(user, Mode::Idle, FlowContext::default());
        assert!(!tracker.is_pending(user));
    }

    #[test]
    fn cancel_is_idempotent_and_safe_for_unknown_users() {
        let tracker = ConversationTracker::new();
        let user = UserId(42);
        tracker.cancel(user);
        assert!(!tracker.is_pending(user));

        tracker.begin(user, Mode::AwaitingResetTarget, FlowContext::default());
        tracker.cancel(user);
        tracker.cancel(user);
        assert!(!tracker.is_pending(user));
        assert_eq!(tracker.resolve(user, &text("john_doe")), Outcome::NotPending);
    }

    #[test]
    fn later_flow_replaces_earlier_one() {
        let tracker = ConversationTracker::new();
        let user = UserId(5);
        tracker.begin(user, Mode::AwaitingOcrImage, FlowContext::default());
        tracker.begin(user, Mode::AwaitingResetTarget, FlowContext::default());

        assert_eq!(
            tracker.resolve(user, &image("photo")),
            Outcome::Mismatch(Mode::AwaitingResetTarget)
        );
        assert_eq!(tracker.pending_mode(user), Mode::AwaitingResetTarget);
        assert_eq!(
            tracker.resolve(user, &text("john_doe")),
            Outcome::Consumed(Mode::AwaitingResetTarget, FlowContext::default())
        );
    }

    #[test]
    fn ocr_flow_waits_for_an_image() {
        let tracker = ConversationTracker::new();
        let user = UserId(7);
        tracker.begin(user, Mode::AwaitingOcrImage, FlowContext::default());

        assert_eq!(
            tracker.resolve(user, &text("hello")),
            Outcome::Mismatch(Mode::AwaitingOcrImage)
        );
        assert!(tracker.is_pending(user));
        assert_eq!(
            tracker.resolve(user, &image("h")),
            Outcome::Consumed(Mode::AwaitingOcrImage, FlowContext::default())
        );
        assert!(!tracker.is_pending(user));
    }

    #[test]
    fn reset_flow_rejects_short_targets_and_keeps_waiting() {
        let tracker = ConversationTracker::new();
        let user = UserId(8);
        tracker.begin(user, Mode::AwaitingResetTarget, FlowContext::default());

        assert_eq!(
            tracker.resolve(user, &text("ab")),
            Outcome::Rejected(RejectReason::TooShort)
        );
        assert!(tracker.is_pending(user));
        assert_eq!(
            tracker.resolve(user, &text("john_doe")),
            Outcome::Consumed(Mode::AwaitingResetTarget, FlowContext::default())
        );
        assert!(!tracker.is_pending(user));
    }

    #[test]
    fn consumed_returns_stored_context() {
        let tracker = ConversationTracker::new();
        let user = UserId(9);
        let context = FlowContext::for_chat(-100).with_instruction(Some("only numbers".into()));
        tracker.begin(user, Mode::AwaitingOcrImage, context.clone());
        assert_eq!(
            tracker.resolve(user, &image("x")),
            Outcome::Consumed(Mode::AwaitingOcrImage, context)
        );
    }

    #[test]
    fn negative_ids_and_single_shard_work() {
        let tracker = ConversationTracker::with_shards(0);
        let user = UserId(-12345);
        tracker.begin(user, Mode::AwaitingChatReply, FlowContext::default());
        assert!(tracker.is_pending(user));
        assert!(matches!(
            tracker.resolve(user, &text("question")),
            Outcome::Consumed(Mode::AwaitingChatReply, _)
        ));
    }

    #[test]
    fn flow_from_another_chat_is_left_pending() {
        let tracker = ConversationTracker::new();
        let user = UserId(11);
        tracker.begin(user, Mode::AwaitingResetTarget, FlowContext::for_chat(11));

        assert_eq!(
            tracker.resolve_in_chat(user, -100500, &text("hello everyone")),
            None
        );
        assert_eq!(tracker.pending_mode(user), Mode::AwaitingResetTarget);
        assert_eq!(
            tracker.resolve_in_chat(user, 11, &text("john_doe")),
            Some(Outcome::Consumed(
                Mode::AwaitingResetTarget,
                FlowContext::for_chat(11)
            ))
        );
    }

    #[test]
    fn chat_scoped_resolve_matches_plain_resolve_otherwise() {
        let tracker = ConversationTracker::new();
        let user = UserId(12);
        assert_eq!(
            tracker.resolve_in_chat(user, 1, &text("hi")),
            Some(Outcome::NotPending)
        );

        tracker.begin(user, Mode::AwaitingOcrImage, FlowContext::default());
        assert_eq!(
            tracker.resolve_in_chat(user, 99, &text("hi")),
            Some(Outcome::Mismatch(Mode::AwaitingOcrImage))
        );
        assert!(tracker.is_pending(user));
    }

    #[test]
    fn users_do_not_affect_each_other() {
        let tracker = ConversationTracker::with_shards(4);
        let rounds = 500;
        // Same shard (ids differ by the shard count) and different shard.
        let ocr_user = UserId(1);
        let reset_user = UserId(5);
        let chat_user = UserId(2);
        let barrier = Barrier::new(3);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                for round in 0..rounds {
                    tracker.begin(ocr_user, Mode::AwaitingOcrImage, FlowContext::default());
                    assert_eq!(
                        tracker.resolve(ocr_user, &text("nope")),
                        Outcome::Mismatch(Mode::AwaitingOcrImage)
                    );
                    assert_eq!(
                        tracker.resolve(ocr_user, &image(&round.to_string())),
                        Outcome::Consumed(Mode::AwaitingOcrImage, FlowContext::default())
                    );
                }
            });
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..rounds {
                    tracker.begin(reset_user, Mode::AwaitingResetTarget, FlowContext::default());
                    assert_eq!(
                        tracker.resolve(reset_user, &image("p")),
                        Outcome::Mismatch(Mode::AwaitingResetTarget)
                    );
                    assert_eq!(
                        tracker.resolve(reset_user, &text("ab")),
                        Outcome::Rejected(RejectReason::TooShort)
                    );
                    assert_eq!(
                        tracker.resolve(reset_user, &text("someone@example.com")),
                        Outcome::Consumed(Mode::AwaitingResetTarget, FlowContext::default())
                    );
                }
            });
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..rounds {
                    tracker.begin(chat_user, Mode::AwaitingChatReply, FlowContext::for_chat(2));
                    assert_eq!(
                        tracker.resolve(chat_user, &Event::Button("b".into())),
                        Outcome::Mismatch(Mode::AwaitingChatReply)
                    );
                    tracker.cancel(chat_user);
                    assert_eq!(tracker.resolve(chat_user, &text("hi")), Outcome::NotPending);
                }
            });
        });

        assert!(!tracker.is_pending(ocr_user));
        assert!(!tracker.is_pending(reset_user));
        assert!(!tracker.is_pending(chat_user));
    }
}
