use crate::app::domain::types::MessageId;

/// One message's vertical extent in content coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRow {
    pub message_id: MessageId,
    pub start_y: usize,
    pub height: usize,
}

impl LayoutRow {
    pub fn end_y(&self) -> usize {
        self.start_y.saturating_add(self.height)
    }
}

/// Measured rows of the active path, top to bottom.
///
/// Heights come from whoever renders the messages; this type only stacks them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewportLayout {
    rows: Vec<LayoutRow>,
    total_height: usize,
}

impl ViewportLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack `heights` in order with `spacing` rows between consecutive messages.
    pub fn from_heights<I>(heights: I, spacing: usize) -> Self
    where
        I: IntoIterator<Item = (MessageId, usize)>,
    {
        let mut rows = Vec::new();
        let mut y = 0usize;
        for (message_id, height) in heights {
            if !rows.is_empty() {
                y = y.saturating_add(spacing);
            }
            rows.push(LayoutRow {
                message_id,
                start_y: y,
                height,
            });
            y = y.saturating_add(height);
        }
        Self {
            rows,
            total_height: y,
        }
    }

    pub fn rows(&self) -> &[LayoutRow] {
        &self.rows
    }

    pub fn total_height(&self) -> usize {
        self.total_height
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, message_id: &MessageId) -> Option<&LayoutRow> {
        self.rows.iter().find(|row| &row.message_id == message_id)
    }

    /// First row that ends below `offset`.
    pub fn first_visible(&self, offset: usize) -> Option<&LayoutRow> {
        let index = self.rows.partition_point(|row| row.end_y() <= offset);
        self.rows.get(index)
    }

    pub fn max_offset(&self, viewport_height: usize) -> usize {
        self.total_height.saturating_sub(viewport_height)
    }
}
