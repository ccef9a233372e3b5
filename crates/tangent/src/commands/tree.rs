use async_trait::async_trait;
use eyre::{Result, eyre};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;

use super::Command;
use tangent_core::api::{BranchMap, ConversationApi, InMemoryConversationStore, PathQuery};
use tangent_core::app::conversation::{Message, ParentKey};
use tangent_core::app::domain::types::{ConversationId, MessageId};

const PREVIEW_CHARS: usize = 60;

pub struct TreeCommand {
    pub data: PathBuf,
    pub conversation: Option<String>,
}

#[async_trait]
impl Command for TreeCommand {
    async fn execute(&self) -> Result<()> {
        let store = InMemoryConversationStore::open(self.data.clone())
            .await
            .map_err(|e| eyre!("Failed to open {}: {}", self.data.display(), e))?;
        let mut stdout = std::io::stdout();

        let Some(conversation) = &self.conversation else {
            let ids = store.conversation_ids()?;
            if ids.is_empty() {
                writeln!(stdout, "No conversations found.")?;
                return Ok(());
            }
            writeln!(stdout, "{:<36} {:>8}", "ID", "Messages")?;
            writeln!(stdout, "{}", "-".repeat(45))?;
            for id in ids {
                writeln!(stdout, "{:<36} {:>8}", id, store.messages(id)?.len())?;
            }
            return Ok(());
        };

        let conversation: ConversationId = conversation
            .parse()
            .map_err(|e| eyre!("Invalid conversation id '{}': {}", conversation, e))?;
        let view = load_tree(&store, conversation).await?;
        for line in view.render() {
            writeln!(stdout, "{line}")?;
        }
        Ok(())
    }
}

/// Everything needed to draw one conversation's tree.
pub struct TreeView {
    messages: HashMap<MessageId, Message>,
    branches: BranchMap,
    active_path: HashSet<MessageId>,
}

pub async fn load_tree(
    store: &InMemoryConversationStore,
    conversation: ConversationId,
) -> tangent_core::Result<TreeView> {
    let messages = store.messages(conversation)?;
    let branches = store.fetch_branches(conversation).await?;
    let path = store
        .fetch_path(conversation, &PathQuery::canonical())
        .await?;
    let active_path: Vec<MessageId> = path.messages.into_iter().map(|m| m.id).collect();
    Ok(TreeView::new(messages, branches, &active_path))
}

impl TreeView {
    pub fn new(messages: Vec<Message>, branches: BranchMap, active_path: &[MessageId]) -> Self {
        Self {
            messages: messages.into_iter().map(|m| (m.id.clone(), m)).collect(),
            branches,
            active_path: active_path.iter().cloned().collect(),
        }
    }

    /// One line per message, depth-first in sibling order. `*` marks the active path.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut stack = Vec::new();
        self.push_children(&mut stack, &ParentKey::Root, 0);

        while let Some((id, depth, position, count)) = stack.pop() {
            let Some(message) = self.messages.get(&id) else {
                continue;
            };
            lines.push(self.line(message, depth, position, count));
            self.push_children(&mut stack, &ParentKey::Message(id), depth + 1);
        }
        lines
    }

    fn push_children(
        &self,
        stack: &mut Vec<(MessageId, usize, usize, usize)>,
        parent: &ParentKey,
        depth: usize,
    ) {
        let Some(siblings) = self.branches.get(&parent.to_wire()) else {
            return;
        };
        for (index, entry) in siblings.iter().enumerate().rev() {
            stack.push((entry.id.clone(), depth, index + 1, siblings.len()));
        }
    }

    fn line(&self, message: &Message, depth: usize, position: usize, count: usize) -> String {
        let marker = if self.active_path.contains(&message.id) {
            '*'
        } else {
            ' '
        };
        let siblings = if count > 1 {
            format!(" [{position}/{count}]")
        } else {
            String::new()
        };
        let text = message.extract_text();
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        format!(
            "{marker} {indent}{role} {id}{siblings}: {preview}",
            indent = "  ".repeat(depth),
            role = message.role,
            id = message.id,
            preview = preview.replace('\n', " "),
        )
    }
}
