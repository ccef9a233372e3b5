use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use url::Url;

use super::Command;
use tangent_core::api::{ConversationApi, HttpConversationClient};
use tangent_core::app::conversation::{ContentDelta, Direction, MessagePart, ParentKey};
use tangent_core::app::domain::runtime::{
    EffectInterpreter, HistoryOutcome, SessionHandle, SwitchOutcome, spawn_session,
};
use tangent_core::app::domain::{
    ConversationId, GenerationOutcome, MessageId, SessionEvent, SessionState,
};
use tangent_core::config::TangentConfig;
use tangent_core::session::FileClientStateStore;
use tangent_core::transport::{ReplyScript, ScriptedTransport};

const HELP: &str = "\
Commands:
  <text>                 send a message
  /regen [id]            regenerate the last (or given) assistant message
  /edit <id> <text>      edit a user message on a new branch
  /rewrite <id> <text>   replace an assistant message on a new branch
  /patch <id> <text>     change an assistant message in place
  /prev <id>, /next <id> step to a neighbouring sibling
  /switch <id>           show the newest path through a message
  /delete <id>           delete a message and everything under it
  /older                 load older history
  /stop                  stop the running response
  /path                  print the visible path
  /quit                  leave";

pub struct ChatCommand {
    pub server: Url,
    pub conversation: Option<String>,
    pub config: TangentConfig,
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Send(String),
    Regenerate(Option<MessageId>),
    Edit(MessageId, String),
    Rewrite(MessageId, String),
    Patch(MessageId, String),
    Step(MessageId, Direction),
    Switch(MessageId),
    Delete(MessageId),
    Older,
    Stop,
    Path,
    Help,
    Quit,
}

pub fn parse_input(line: &str) -> Result<Option<ChatInput>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(ChatInput::Send(line.to_string())));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    let id = |rest: &str| -> Result<MessageId, String> {
        rest.split_whitespace()
            .next()
            .map(MessageId::from)
            .ok_or_else(|| format!("/{name} needs a message id"))
    };
    let id_and_text = |rest: &str| -> Result<(MessageId, String), String> {
        match rest.split_once(char::is_whitespace) {
            Some((id, text)) if !text.trim().is_empty() => {
                Ok((MessageId::from(id), text.trim().to_string()))
            }
            _ => Err(format!("/{name} needs a message id and new text")),
        }
    };

    let input = match name {
        "regen" => ChatInput::Regenerate(rest.split_whitespace().next().map(MessageId::from)),
        "edit" => id_and_text(rest).map(|(id, text)| ChatInput::Edit(id, text))?,
        "rewrite" => id_and_text(rest).map(|(id, text)| ChatInput::Rewrite(id, text))?,
        "patch" => id_and_text(rest).map(|(id, text)| ChatInput::Patch(id, text))?,
        "prev" => ChatInput::Step(id(rest)?, Direction::Previous),
        "next" => ChatInput::Step(id(rest)?, Direction::Next),
        "switch" => ChatInput::Switch(id(rest)?),
        "delete" => ChatInput::Delete(id(rest)?),
        "older" => ChatInput::Older,
        "stop" => ChatInput::Stop,
        "path" => ChatInput::Path,
        "help" => ChatInput::Help,
        "quit" | "exit" => ChatInput::Quit,
        other => return Err(format!("Unknown command /{other}, try /help")),
    };
    Ok(Some(input))
}

/// The visible path, one message per line with its sibling position at forks.
pub fn render_path(state: &SessionState) -> Vec<String> {
    let mut lines = Vec::new();
    if state.history.has_more {
        lines.push("  ... older messages available (/older)".to_string());
    }
    for message in state.store.messages() {
        let position = state
            .branches
            .position(&ParentKey::of(message.parent_id()), &message.id)
            .filter(|position| position.total > 1)
            .map(|position| format!(" ({position})"))
            .unwrap_or_default();
        lines.push(format!(
            "{} {}{}: {}",
            message.role,
            message.id,
            position,
            message.extract_text().replace('\n', " ")
        ));
    }
    lines
}

#[async_trait]
impl Command for ChatCommand {
    async fn execute(&self) -> Result<()> {
        let api: Arc<dyn ConversationApi> =
            Arc::new(HttpConversationClient::new(self.server.clone()));
        let conversation = match &self.conversation {
            Some(id) => id
                .parse::<ConversationId>()
                .map_err(|e| eyre!("Invalid conversation id '{}': {}", id, e))?,
            None => {
                let id = api
                    .create_conversation()
                    .await
                    .map_err(|e| eyre!("Failed to create a conversation: {}", e))?;
                info!(conversation_id = %id, "Created conversation");
                id
            }
        };

        let transport = Arc::new(ScriptedTransport::new(api.clone(), ReplyScript::Echo));
        let client_state = Arc::new(FileClientStateStore::new(self.config.client_state_dir()));
        let interpreter = EffectInterpreter::new(conversation, api, transport, client_state);
        let session = spawn_session(interpreter, self.config.session_options());

        let subscription = session.subscribe().await?;
        let printer = tokio::spawn(print_events(subscription, session.clone()));

        let mut stdout = std::io::stdout();
        writeln!(stdout, "Conversation {conversation}. Type /help for commands.")?;
        match session.open().await {
            Ok(_) => print_path(&session).await?,
            Err(e) => writeln!(stdout, "Could not load the conversation: {e}")?,
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let input = match parse_input(&line) {
                Ok(Some(input)) => input,
                Ok(None) => continue,
                Err(message) => {
                    writeln!(stdout, "{message}")?;
                    continue;
                }
            };
            if input == ChatInput::Quit {
                break;
            }
            if let Err(e) = run_input(&session, input).await {
                writeln!(stdout, "error: {e}")?;
            }
        }

        session.shutdown();
        printer.abort();
        Ok(())
    }
}

async fn run_input(session: &SessionHandle, input: ChatInput) -> Result<()> {
    let mut stdout = std::io::stdout();
    match input {
        ChatInput::Send(text) => {
            session.send_message(vec![MessagePart::text(text)]).await?;
        }
        ChatInput::Regenerate(target) => {
            let target = match target {
                Some(id) => id,
                None => {
                    let state = session.state().await?;
                    state
                        .store
                        .messages()
                        .iter()
                        .rev()
                        .find(|m| m.is_assistant())
                        .map(|m| m.id.clone())
                        .ok_or_else(|| eyre!("No assistant message to regenerate"))?
                }
            };
            session.regenerate(target).await?;
        }
        ChatInput::Edit(id, text) => {
            session.edit_message(id, vec![MessagePart::text(text)]).await?;
        }
        ChatInput::Rewrite(id, text) => {
            let new_id = session.edit_as_new(id, vec![MessagePart::text(text)]).await?;
            writeln!(stdout, "saved as {new_id}")?;
        }
        ChatInput::Patch(id, text) => {
            session
                .update_in_place(id, vec![MessagePart::text(text)])
                .await?;
            writeln!(stdout, "updated")?;
        }
        ChatInput::Step(id, direction) => {
            report_switch(session.step_sibling(id, direction).await?)?;
        }
        ChatInput::Switch(id) => {
            let fork = session
                .state()
                .await?
                .branches
                .parent_of(&id)
                .cloned()
                .unwrap_or(ParentKey::Root);
            report_switch(session.switch_branch(Some(id), fork).await?)?;
        }
        ChatInput::Delete(id) => {
            let removed = session.delete_subtree(id).await?;
            writeln!(stdout, "deleted {} message(s)", removed.len())?;
        }
        ChatInput::Older => match session.load_older().await? {
            HistoryOutcome::Prepended { count, has_more } => {
                writeln!(
                    stdout,
                    "loaded {count} older message(s){}",
                    if has_more { ", more available" } else { "" }
                )?;
                print_path(session).await?;
            }
            HistoryOutcome::Superseded => {}
        },
        ChatInput::Stop => session.stop().await?,
        ChatInput::Path => print_path(session).await?,
        ChatInput::Help => writeln!(stdout, "{HELP}")?,
        ChatInput::Quit => {}
    }
    Ok(())
}

fn report_switch(outcome: SwitchOutcome) -> Result<()> {
    if outcome == SwitchOutcome::Superseded {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "superseded by a newer switch")?;
    }
    Ok(())
}

async fn print_path(session: &SessionHandle) -> Result<()> {
    let state = session.state().await?;
    let mut stdout = std::io::stdout();
    for line in render_path(&state) {
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}

async fn print_events(
    mut subscription: tangent_core::app::domain::runtime::SessionEventSubscription,
    session: SessionHandle,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    // Queued chunks print as one write instead of one flush per token.
    while let Some(envelope) = subscription.recv_coalesced().await {
        debug!(seq = envelope.seq, "Session event");
        match envelope.event {
            SessionEvent::MessageAppended { message } => {
                if message.is_assistant() {
                    write!(stdout, "{} {}: ", message.role, message.id)?;
                    stdout.flush()?;
                } else {
                    writeln!(stdout, "{} {}", message.role, message.id)?;
                }
            }
            SessionEvent::MessageDelta {
                delta: ContentDelta::Text(text),
                ..
            } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            SessionEvent::GenerationFinished { outcome, .. } => match outcome {
                GenerationOutcome::Completed => writeln!(stdout)?,
                other => writeln!(stdout, " [{other}]")?,
            },
            SessionEvent::BranchSwitchCompleted { .. } => print_path(&session).await?,
            SessionEvent::PathReplaced { reason, .. } => {
                debug!(%reason, "Path replaced");
            }
            SessionEvent::Notice { level, message } => {
                writeln!(stdout, "[{level}] {message}")?;
            }
            _ => {}
        }
    }
    Ok(())
}
