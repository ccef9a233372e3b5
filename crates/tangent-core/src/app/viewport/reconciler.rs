//! Scroll position bookkeeping across structural changes of the active path.
//!
//! The reconciler never measures anything. It is told the viewport height and
//! handed a fresh [`ViewportLayout`] after every commit, and decides where the
//! scroll offset goes: back onto a captured anchor, to the bottom while
//! following, or nowhere.

use tracing::debug;

use super::layout::ViewportLayout;
use crate::app::domain::types::MessageId;

pub const DEFAULT_DETACH_THRESHOLD: usize = 48;
pub const DEFAULT_REATTACH_THRESHOLD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollThresholds {
    /// Distance from the bottom past which a user scroll stops following.
    pub detach: usize,
    /// Distance from the bottom within which following resumes.
    pub reattach: usize,
}

impl Default for ScrollThresholds {
    fn default() -> Self {
        Self {
            detach: DEFAULT_DETACH_THRESHOLD,
            reattach: DEFAULT_REATTACH_THRESHOLD,
        }
    }
}

impl ScrollThresholds {
    /// Keeps `reattach < detach` so the two transitions cannot oscillate.
    pub fn new(detach: usize, reattach: usize) -> Self {
        let detach = detach.max(1);
        Self {
            detach,
            reattach: reattach.min(detach - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    /// Pinned to the bottom; appends scroll the view.
    Idle,
    /// The user scrolled away; appends leave the view alone.
    Detached,
}

/// Where a message sat on screen before a structural change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor {
    pub message_id: MessageId,
    /// `start_y - offset`; negative when the row starts above the viewport.
    pub screen_offset: isize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAdjust {
    Switch(ScrollAnchor),
    Prepend(ScrollAnchor),
}

impl PendingAdjust {
    fn anchor(&self) -> &ScrollAnchor {
        match self {
            PendingAdjust::Switch(anchor) | PendingAdjust::Prepend(anchor) => anchor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrollReconciler {
    offset: usize,
    viewport_height: usize,
    follow: FollowState,
    thresholds: ScrollThresholds,
    pending: Option<PendingAdjust>,
}

impl Default for ScrollReconciler {
    fn default() -> Self {
        Self::new(ScrollThresholds::default())
    }
}

fn to_isize(value: usize) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

impl ScrollReconciler {
    pub fn new(thresholds: ScrollThresholds) -> Self {
        Self {
            offset: 0,
            viewport_height: 0,
            follow: FollowState::Idle,
            thresholds,
            pending: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn follow_state(&self) -> FollowState {
        self.follow
    }

    pub fn is_following(&self) -> bool {
        self.follow == FollowState::Idle
    }

    pub fn thresholds(&self) -> ScrollThresholds {
        self.thresholds
    }

    pub fn has_pending_adjustment(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_viewport_height(&mut self, height: usize, layout: &ViewportLayout) {
        self.viewport_height = height;
        self.offset = self.offset.min(layout.max_offset(height));
    }

    pub fn distance_from_bottom(&self, layout: &ViewportLayout) -> usize {
        layout
            .max_offset(self.viewport_height)
            .saturating_sub(self.offset)
    }

    /// Apply a user scroll of `delta` rows (negative is up).
    ///
    /// Returns whether the offset moved.
    pub fn scroll_by(&mut self, delta: isize, layout: &ViewportLayout) -> bool {
        let previous = self.offset;
        let max_offset = layout.max_offset(self.viewport_height);
        self.offset = self.offset.saturating_add_signed(delta).min(max_offset);
        if self.offset == previous {
            return false;
        }
        self.update_follow(layout);
        true
    }

    /// Record where `fork_message` sits before the path below it is replaced.
    ///
    /// With no fork message (a root switch) or one that is not laid out there
    /// is nothing to hold still and no adjustment is made later.
    pub fn capture_anchor(&mut self, fork_message: Option<&MessageId>, layout: &ViewportLayout) {
        self.pending = fork_message
            .and_then(|id| layout.row(id))
            .map(|row| {
                PendingAdjust::Switch(ScrollAnchor {
                    message_id: row.message_id.clone(),
                    screen_offset: to_isize(row.start_y) - to_isize(self.offset),
                })
            });
        debug!(
            target: "viewport::capture_anchor",
            anchor = ?self.pending.as_ref().map(|p| &p.anchor().message_id),
            offset = self.offset,
            "Captured branch switch anchor"
        );
    }

    /// Record the first visible message before older history is inserted above it.
    pub fn prepare_prepend(&mut self, layout: &ViewportLayout) {
        self.pending = layout.first_visible(self.offset).map(|row| {
            PendingAdjust::Prepend(ScrollAnchor {
                message_id: row.message_id.clone(),
                screen_offset: to_isize(row.start_y) - to_isize(self.offset),
            })
        });
    }

    /// Drop a captured anchor whose change never landed.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Settle the offset against a freshly committed layout.
    pub fn reconcile(&mut self, layout: &ViewportLayout) -> usize {
        let max_offset = layout.max_offset(self.viewport_height);

        match self.pending.take() {
            Some(pending) => {
                let anchor = pending.anchor();
                match layout.row(&anchor.message_id) {
                    Some(row) => {
                        let target = to_isize(row.start_y) - anchor.screen_offset;
                        self.offset = usize::try_from(target).unwrap_or(0).min(max_offset);
                    }
                    None => {
                        debug!(
                            target: "viewport::reconcile",
                            anchor = %anchor.message_id,
                            "Anchor is gone from the new layout; leaving the offset alone"
                        );
                        self.offset = self.offset.min(max_offset);
                    }
                }
                self.update_follow(layout);
            }
            None if self.follow == FollowState::Idle => self.offset = max_offset,
            None => self.offset = self.offset.min(max_offset),
        }

        self.offset
    }

    /// Keep the bottom in view after content was appended, unless detached.
    pub fn follow(&mut self, layout: &ViewportLayout) -> usize {
        if self.follow == FollowState::Idle {
            self.offset = layout.max_offset(self.viewport_height);
        }
        self.offset
    }

    pub fn stream_finished(&mut self) {
        if self.follow == FollowState::Detached {
            debug!(target: "viewport::stream_finished", "Resuming follow after the stream ended");
        }
        self.follow = FollowState::Idle;
    }

    pub fn jump_to_latest(&mut self, layout: &ViewportLayout) -> usize {
        self.follow = FollowState::Idle;
        self.pending = None;
        self.offset = layout.max_offset(self.viewport_height);
        self.offset
    }

    fn update_follow(&mut self, layout: &ViewportLayout) {
        let distance = self.distance_from_bottom(layout);
        self.follow = match self.follow {
            FollowState::Idle if distance > self.thresholds.detach => FollowState::Detached,
            FollowState::Detached if distance <= self.thresholds.reattach => FollowState::Idle,
            unchanged => unchanged,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn layout(ids: &[&str], height: usize) -> ViewportLayout {
        ViewportLayout::from_heights(ids.iter().map(|id| (MessageId::from(*id), height)), 0)
    }

    fn reconciler_at(offset: usize, viewport_height: usize, layout: &ViewportLayout) -> ScrollReconciler {
        let mut reconciler = ScrollReconciler::new(ScrollThresholds::new(20, 5));
        reconciler.set_viewport_height(viewport_height, layout);
        reconciler.offset = offset;
        reconciler
    }

    #[test]
    fn thresholds_keep_hysteresis() {
        let thresholds = ScrollThresholds::new(10, 10);
        assert!(thresholds.reattach < thresholds.detach);

        let thresholds = ScrollThresholds::new(0, 0);
        assert_eq!(thresholds, ScrollThresholds { detach: 1, reattach: 0 });
    }

    #[test]
    fn follows_the_bottom_while_idle() {
        let short = layout(&["a", "b"], 10);
        let mut reconciler = reconciler_at(0, 10, &short);
        assert_eq!(reconciler.reconcile(&short), 10);

        let longer = layout(&["a", "b", "c"], 10);
        assert_eq!(reconciler.follow(&longer), 20);
        assert!(reconciler.is_following());
    }

    #[test]
    fn scrolling_up_past_the_threshold_detaches() {
        let before = layout(&["a", "b", "c", "d", "e", "f"], 10);
        let mut reconciler = reconciler_at(50, 10, &before);

        assert!(reconciler.scroll_by(-15, &before));
        assert_eq!(reconciler.follow_state(), FollowState::Idle);

        assert!(reconciler.scroll_by(-10, &before));
        assert_eq!(reconciler.follow_state(), FollowState::Detached);

        let longer = layout(&["a", "b", "c", "d", "e", "f", "g"], 10);
        assert_eq!(reconciler.follow(&longer), 25);
        assert_eq!(reconciler.reconcile(&longer), 25);
    }

    #[rstest]
    #[case::inside_reattach(-4, FollowState::Idle)]
    #[case::between_thresholds(-10, FollowState::Detached)]
    fn scrolling_back_down_reattaches_only_near_the_bottom(
        #[case] from_bottom: isize,
        #[case] expected: FollowState,
    ) {
        let layout = layout(&["a", "b", "c", "d", "e", "f"], 10);
        let mut reconciler = reconciler_at(50, 10, &layout);
        reconciler.scroll_by(-30, &layout);
        assert_eq!(reconciler.follow_state(), FollowState::Detached);

        reconciler.scroll_by(30 + from_bottom, &layout);
        assert_eq!(reconciler.follow_state(), expected);
    }

    #[test]
    fn scrolling_at_the_edge_is_a_no_op() {
        let layout = layout(&["a", "b"], 10);
        let mut reconciler = reconciler_at(10, 10, &layout);
        assert!(!reconciler.scroll_by(5, &layout));
        assert_eq!(reconciler.offset(), 10);
    }

    #[test]
    fn stream_end_and_jump_resume_following() {
        let layout = layout(&["a", "b", "c", "d", "e", "f"], 10);
        let mut reconciler = reconciler_at(50, 10, &layout);
        reconciler.scroll_by(-40, &layout);
        assert!(!reconciler.is_following());

        reconciler.stream_finished();
        assert!(reconciler.is_following());

        reconciler.scroll_by(-40, &layout);
        assert_eq!(reconciler.jump_to_latest(&layout), 50);
        assert!(reconciler.is_following());
    }

    #[test]
    fn branch_switch_keeps_the_fork_message_still() {
        let before = layout(&["m1", "m2", "m3", "m4", "m5"], 10);
        let mut reconciler = reconciler_at(15, 10, &before);
        reconciler.scroll_by(-1, &before);

        reconciler.capture_anchor(Some(&MessageId::from("m2")), &before);
        let after = ViewportLayout::from_heights(
            [("m1", 10), ("m2", 10), ("x3", 40), ("x4", 25)]
                .into_iter()
                .map(|(id, h)| (MessageId::from(id), h)),
            0,
        );
        let offset = reconciler.reconcile(&after);

        assert_eq!(offset, 14);
        let row = after.row(&MessageId::from("m2")).unwrap();
        assert_eq!(row.start_y as isize - offset as isize, -4);
    }

    #[test]
    fn missing_anchor_leaves_the_offset_alone() {
        let before = layout(&["m1", "m2", "m3", "m4"], 10);
        let mut reconciler = reconciler_at(30, 10, &before);
        reconciler.scroll_by(-25, &before);
        assert!(!reconciler.is_following());

        reconciler.capture_anchor(Some(&MessageId::from("m3")), &before);
        let after = layout(&["r1", "r2", "r3", "r4", "r5"], 10);

        assert_eq!(reconciler.reconcile(&after), 5);
        assert!(!reconciler.has_pending_adjustment());
    }

    #[test]
    fn root_switch_has_no_anchor() {
        let before = layout(&["m1", "m2"], 10);
        let mut reconciler = reconciler_at(10, 10, &before);
        reconciler.capture_anchor(None, &before);
        assert!(!reconciler.has_pending_adjustment());
    }

    proptest! {
        #[test]
        fn prepend_grows_offset_by_inserted_height(
            existing in prop::collection::vec(1usize..40, 1..12),
            older in prop::collection::vec(1usize..40, 1..12),
            spacing in 0usize..3,
            viewport_height in 1usize..60,
            position in 0.0f64..1.0,
        ) {
            let existing_rows: Vec<_> = existing
                .iter()
                .enumerate()
                .map(|(i, h)| (MessageId::from(format!("e{i}")), *h))
                .collect();
            let before = ViewportLayout::from_heights(existing_rows.clone(), spacing);
            prop_assume!(before.total_height() > viewport_height);
            let max_offset = before.max_offset(viewport_height);
            let offset = (position * max_offset as f64) as usize;

            let mut reconciler = ScrollReconciler::new(ScrollThresholds::default());
            reconciler.set_viewport_height(viewport_height, &before);
            reconciler.offset = offset;
            reconciler.follow = FollowState::Detached;

            reconciler.prepare_prepend(&before);
            let after = ViewportLayout::from_heights(
                older
                    .iter()
                    .enumerate()
                    .map(|(i, h)| (MessageId::from(format!("o{i}")), *h))
                    .chain(existing_rows),
                spacing,
            );
            let inserted = after.total_height() - before.total_height();

            prop_assert_eq!(reconciler.reconcile(&after), offset + inserted);
        }

        #[test]
        fn branch_switch_has_zero_visual_delta(
            shared in prop::collection::vec(1usize..30, 1..8),
            old_tail in prop::collection::vec(1usize..30, 0..8),
            new_tail in prop::collection::vec(1usize..30, 0..8),
            viewport_height in 1usize..40,
            pick in any::<prop::sample::Index>(),
        ) {
            let rows = |tail: &[usize], prefix: &str| -> ViewportLayout {
                ViewportLayout::from_heights(
                    shared
                        .iter()
                        .enumerate()
                        .map(|(i, h)| (MessageId::from(format!("s{i}")), *h))
                        .chain(tail.iter().enumerate().map(|(i, h)| (MessageId::from(format!("{prefix}{i}")), *h))),
                    1,
                )
            };
            let before = rows(&old_tail, "old");
            let after = rows(&new_tail, "new");
            let fork = MessageId::from(format!("s{}", pick.index(shared.len())));

            let mut reconciler = ScrollReconciler::new(ScrollThresholds::default());
            reconciler.set_viewport_height(viewport_height, &before);
            reconciler.offset = before.row(&fork).unwrap().start_y.min(before.max_offset(viewport_height));
            let screen_before = before.row(&fork).unwrap().start_y as isize - reconciler.offset as isize;

            reconciler.capture_anchor(Some(&fork), &before);
            let offset = reconciler.reconcile(&after);

            let wanted = after.row(&fork).unwrap().start_y as isize - screen_before;
            if wanted <= after.max_offset(viewport_height) as isize {
                prop_assert_eq!(after.row(&fork).unwrap().start_y as isize - offset as isize, screen_before);
            } else {
                prop_assert_eq!(offset, after.max_offset(viewport_height));
            }
        }
    }
}
