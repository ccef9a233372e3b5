use tracing::debug;

use super::layout::ViewportLayout;
use super::reconciler::{ScrollReconciler, ScrollThresholds};
use crate::app::domain::event::SessionEvent;

/// Drives a [`ScrollReconciler`] from the session event stream.
///
/// Captures happen against the last committed layout, which still shows the
/// old path when the event arrives. The caller re-measures and hands the new
/// layout to [`ViewportSync::commit`].
#[derive(Debug, Clone, Default)]
pub struct ViewportSync {
    reconciler: ScrollReconciler,
    layout: ViewportLayout,
}

impl ViewportSync {
    pub fn new(thresholds: ScrollThresholds) -> Self {
        Self {
            reconciler: ScrollReconciler::new(thresholds),
            layout: ViewportLayout::new(),
        }
    }

    pub fn reconciler(&self) -> &ScrollReconciler {
        &self.reconciler
    }

    pub fn layout(&self) -> &ViewportLayout {
        &self.layout
    }

    pub fn offset(&self) -> usize {
        self.reconciler.offset()
    }

    /// Returns whether the event changes the layout and a new one should be committed.
    pub fn handle_event(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::BranchSwitchStarted { fork, .. } => {
                self.reconciler
                    .capture_anchor(fork.message_id(), &self.layout);
                false
            }
            SessionEvent::BranchSwitchFailed { .. } => {
                self.reconciler.discard_pending();
                false
            }
            SessionEvent::HistoryPrepended { count, .. } => {
                debug!(target: "viewport::sync", count, "Preparing for prepended history");
                self.reconciler.prepare_prepend(&self.layout);
                true
            }
            SessionEvent::GenerationFinished { .. } => {
                self.reconciler.stream_finished();
                false
            }
            SessionEvent::PathReplaced { .. }
            | SessionEvent::MessageAppended { .. }
            | SessionEvent::MessageChanged { .. }
            | SessionEvent::MessageDelta { .. } => true,
            _ => false,
        }
    }

    /// Adopt a freshly measured layout and return the settled offset.
    pub fn commit(&mut self, layout: ViewportLayout) -> usize {
        self.layout = layout;
        self.reconciler.reconcile(&self.layout)
    }

    pub fn resize(&mut self, viewport_height: usize) {
        self.reconciler
            .set_viewport_height(viewport_height, &self.layout);
    }

    pub fn scroll_by(&mut self, delta: isize) -> bool {
        self.reconciler.scroll_by(delta, &self.layout)
    }

    pub fn jump_to_latest(&mut self) -> usize {
        self.reconciler.jump_to_latest(&self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::conversation::{Message, ParentKey};
    use crate::app::domain::event::{GenerationOutcome, ReplaceReason};
    use crate::app::domain::types::{MessageId, OpId, RequestId};
    use crate::app::viewport::FollowState;

    fn layout(rows: &[(&str, usize)]) -> ViewportLayout {
        ViewportLayout::from_heights(rows.iter().map(|(id, h)| (MessageId::from(*id), *h)), 0)
    }

    fn synced(rows: &[(&str, usize)], viewport_height: usize) -> ViewportSync {
        let mut sync = ViewportSync::new(ScrollThresholds::new(20, 5));
        sync.commit(layout(rows));
        sync.resize(viewport_height);
        sync.commit(layout(rows));
        sync
    }

    #[test]
    fn switch_anchors_on_the_fork_message() {
        let mut sync = synced(&[("m1", 10), ("m2", 10), ("m3", 30), ("m4", 30)], 10);
        assert_eq!(sync.offset(), 70);
        sync.scroll_by(-62);
        assert_eq!(sync.reconciler().follow_state(), FollowState::Detached);

        let needs_layout = sync.handle_event(&SessionEvent::BranchSwitchStarted {
            request_id: RequestId::new(),
            fork: ParentKey::Message(MessageId::from("m2")),
            target: Some(MessageId::from("n3")),
        });
        assert!(!needs_layout);
        assert!(sync.handle_event(&SessionEvent::PathReplaced {
            leaf: Some(MessageId::from("n3")),
            reason: ReplaceReason::Navigation,
        }));

        let offset = sync.commit(layout(&[("m1", 10), ("m2", 10), ("n3", 50)]));
        assert_eq!(offset, 8);
    }

    #[test]
    fn failed_switch_drops_the_anchor() {
        let mut sync = synced(&[("m1", 10), ("m2", 10), ("m3", 30)], 10);
        let request_id = RequestId::new();
        sync.handle_event(&SessionEvent::BranchSwitchStarted {
            request_id,
            fork: ParentKey::Message(MessageId::from("m1")),
            target: None,
        });
        sync.handle_event(&SessionEvent::BranchSwitchFailed {
            request_id,
            error: "offline".to_string(),
        });
        assert!(!sync.reconciler().has_pending_adjustment());
    }

    #[test]
    fn prepend_keeps_the_first_visible_message_in_place() {
        let mut sync = synced(&[("m5", 10), ("m6", 10), ("m7", 10)], 10);
        sync.scroll_by(-17);
        assert_eq!(sync.offset(), 3);

        sync.handle_event(&SessionEvent::HistoryPrepended {
            request_id: RequestId::new(),
            previous_oldest: MessageId::from("m5"),
            count: 2,
            has_more: true,
        });
        let offset = sync.commit(layout(&[
            ("m3", 12),
            ("m4", 8),
            ("m5", 10),
            ("m6", 10),
            ("m7", 10),
        ]));

        assert_eq!(offset, 23);
    }

    #[test]
    fn appends_follow_until_detached_then_resume_after_the_stream() {
        let mut sync = synced(&[("m1", 10), ("m2", 10)], 10);
        let reply = Message::assistant(Some(MessageId::from("m2")), "").with_id("m3");

        assert!(sync.handle_event(&SessionEvent::MessageAppended { message: reply }));
        assert_eq!(sync.commit(layout(&[("m1", 10), ("m2", 10), ("m3", 30)])), 40);

        sync.scroll_by(-30);
        assert!(!sync.reconciler().is_following());
        assert_eq!(
            sync.commit(layout(&[("m1", 10), ("m2", 10), ("m3", 40)])),
            10
        );

        sync.handle_event(&SessionEvent::GenerationFinished {
            op_id: OpId::new(),
            message_id: Some(MessageId::from("m3")),
            outcome: GenerationOutcome::Completed,
        });
        assert_eq!(
            sync.commit(layout(&[("m1", 10), ("m2", 10), ("m3", 40)])),
            50
        );
    }

    #[test]
    fn jump_to_latest_reattaches() {
        let mut sync = synced(&[("m1", 40), ("m2", 40)], 10);
        sync.scroll_by(-60);
        assert!(!sync.reconciler().is_following());

        assert_eq!(sync.jump_to_latest(), 70);
        assert!(sync.reconciler().is_following());
    }
}
