//! Scroll position across branch switches, history prepends and streaming.

mod layout;
mod reconciler;
mod sync;

pub use layout::{LayoutRow, ViewportLayout};
pub use reconciler::{
    DEFAULT_DETACH_THRESHOLD, DEFAULT_REATTACH_THRESHOLD, FollowState, ScrollAnchor,
    ScrollReconciler, ScrollThresholds,
};
pub use sync::ViewportSync;
