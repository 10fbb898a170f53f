//! Wire protocol and gateway dispatch.
//!
//! The protocol is a closed tagged union — one variant per named command
//! and event, internally tagged with `type` and camelCase payload fields —
//! decoded at the transport boundary so dispatch is an exhaustive match,
//! not a string-keyed table. Every command runs the same pipeline:
//! authenticate (done at upgrade) -> authorize -> mutate -> broadcast ->
//! notify. Failures are returned as an `error` event to the issuing
//! connection only, never broadcast.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chat::messages::{self, excerpt, ShapedMessage};
use crate::chat::reactions::{self, ReactionMap};
use crate::chat::{membership, notifications};
use crate::error::ChatError;
use crate::state::AppState;
use crate::ws::broadcast::{broadcast_to_project, send_to_connection, send_to_sender};
use crate::ws::{self, ConnectionId, ConnectionSender};

/// Commands a client may issue over the socket. The authentication
/// credential rides the upgrade request; there is no authenticate command.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinProject {
        project_id: String,
    },
    LeaveProject {
        project_id: String,
    },
    LoadMessages {
        project_id: String,
        take: Option<u32>,
        skip: Option<u32>,
    },
    SendMessage {
        project_id: String,
        content: String,
        #[serde(default)]
        reply_to_id: Option<String>,
        #[serde(default)]
        mentions: Option<Vec<String>>,
    },
    TypingStart {
        project_id: String,
    },
    TypingStop {
        project_id: String,
    },
    AddReaction {
        message_id: String,
        emoji: String,
        project_id: String,
    },
    RemoveReaction {
        message_id: String,
        emoji: String,
        project_id: String,
    },
    EditMessage {
        message_id: String,
        content: String,
        project_id: String,
    },
    DeleteMessage {
        message_id: String,
        project_id: String,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    UserOnline {
        user_id: String,
        project_id: String,
        timestamp: u64,
    },
    UserOffline {
        user_id: String,
        project_id: String,
        timestamp: u64,
    },
    MessagesLoaded {
        messages: Vec<ShapedMessage>,
    },
    NewMessage {
        message: ShapedMessage,
    },
    UserTyping {
        user_id: String,
        project_id: String,
        timestamp: u64,
    },
    UserStoppedTyping {
        user_id: String,
        project_id: String,
        timestamp: u64,
    },
    ReactionAdded {
        message_id: String,
        project_id: String,
        emoji: String,
        user_id: String,
        reactions: ReactionMap,
    },
    ReactionRemoved {
        message_id: String,
        project_id: String,
        emoji: String,
        user_id: String,
        reactions: ReactionMap,
    },
    MessageEdited {
        message: ShapedMessage,
    },
    MessageDeleted {
        message_id: String,
        project_id: String,
    },
    SystemMessage {
        message: ShapedMessage,
    },
    NewNotification {
        // The envelope tag already claims `type`; the notification kind
        // rides as notificationType
        notification_type: String,
        project_id: String,
        message: String,
        sender: crate::chat::messages::SenderInfo,
    },
    Error {
        code: String,
        message: String,
    },
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Handle one incoming text frame: decode, dispatch, and turn any failure
/// into an `error` event on the issuing connection.
pub async fn handle_text_frame(
    text: &str,
    conn_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
    user_id: &str,
) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::debug!(user_id = %user_id, error = %e, "Undecodable client command");
            let err = ChatError::Validation(format!("malformed command: {e}"));
            send_to_sender(
                tx,
                &ServerEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            );
            return;
        }
    };

    if let Err(err) = dispatch(command, conn_id, state, user_id).await {
        tracing::debug!(user_id = %user_id, code = err.code(), "Command refused: {err}");
        send_to_sender(
            tx,
            &ServerEvent::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        );
    }
}

/// Exhaustive dispatch over the closed command set.
async fn dispatch(
    command: ClientCommand,
    conn_id: ConnectionId,
    state: &AppState,
    user_id: &str,
) -> Result<(), ChatError> {
    match command {
        ClientCommand::JoinProject { project_id } => {
            handle_join(state, conn_id, user_id, &project_id).await
        }
        ClientCommand::LeaveProject { project_id } => {
            handle_leave(state, conn_id, user_id, &project_id)
        }
        ClientCommand::LoadMessages {
            project_id,
            take,
            skip,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            let messages = messages::list(&state.db, user_id, &project_id, take, skip).await?;
            // Unicast to the issuing connection; dropped if it
            // disconnected while the store call was in flight
            send_to_connection(
                &state.connections,
                conn_id,
                &ServerEvent::MessagesLoaded { messages },
            );
            Ok(())
        }
        ClientCommand::SendMessage {
            project_id,
            content,
            reply_to_id,
            mentions,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            let message = messages::send(
                &state.db,
                user_id,
                &project_id,
                &content,
                reply_to_id,
                mentions.unwrap_or_default(),
            )
            .await?;

            // Broadcast only after successful persistence; fan-out set is
            // whatever the registry holds right now
            let mentions = message.mentions.clone();
            let sender = message.sender.clone();
            let body = excerpt(&message.content);
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::NewMessage { message },
            );

            if !mentions.is_empty() {
                notifications::notify_mentions(
                    &state.db,
                    &state.connections,
                    &project_id,
                    &sender,
                    &mentions,
                    &body,
                )
                .await;
            }
            Ok(())
        }
        ClientCommand::TypingStart { project_id } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::UserTyping {
                    user_id: user_id.to_string(),
                    project_id: project_id.clone(),
                    timestamp: now_millis(),
                },
            );
            Ok(())
        }
        ClientCommand::TypingStop { project_id } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::UserStoppedTyping {
                    user_id: user_id.to_string(),
                    project_id: project_id.clone(),
                    timestamp: now_millis(),
                },
            );
            Ok(())
        }
        ClientCommand::AddReaction {
            message_id,
            emoji,
            project_id,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            let reactions =
                reactions::add(&state.db, user_id, &project_id, &message_id, &emoji).await?;
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::ReactionAdded {
                    message_id,
                    project_id: project_id.clone(),
                    emoji,
                    user_id: user_id.to_string(),
                    reactions,
                },
            );
            Ok(())
        }
        ClientCommand::RemoveReaction {
            message_id,
            emoji,
            project_id,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            let reactions =
                reactions::remove(&state.db, user_id, &project_id, &message_id, &emoji).await?;
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::ReactionRemoved {
                    message_id,
                    project_id: project_id.clone(),
                    emoji,
                    user_id: user_id.to_string(),
                    reactions,
                },
            );
            Ok(())
        }
        ClientCommand::EditMessage {
            message_id,
            content,
            project_id,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            let message =
                messages::edit(&state.db, user_id, &project_id, &message_id, &content).await?;
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::MessageEdited { message },
            );
            Ok(())
        }
        ClientCommand::DeleteMessage {
            message_id,
            project_id,
        } => {
            guard_content_command(state, conn_id, user_id, &project_id).await?;
            messages::delete(&state.db, user_id, &project_id, &message_id).await?;
            // Ids only — no body, so clients caching events never see
            // deleted content replayed
            broadcast_to_project(
                &state.connections,
                &project_id,
                &ServerEvent::MessageDeleted {
                    message_id,
                    project_id: project_id.clone(),
                },
            );
            Ok(())
        }
    }
}

/// Content commands are only valid while joined to the room they target.
fn require_in_room(
    state: &AppState,
    conn_id: ConnectionId,
    project_id: &str,
) -> Result<(), ChatError> {
    match ws::joined_project(&state.connections, conn_id) {
        Some(joined) if joined == project_id => Ok(()),
        _ => Err(ChatError::NotInRoom(project_id.to_string())),
    }
}

/// Guard for content commands: membership first (a non-member is told
/// `NotAMember` no matter what), then the state-machine check that the
/// connection has actually joined the room. The in-room check runs after
/// the authorize await, so it sees post-await registry state.
async fn guard_content_command(
    state: &AppState,
    conn_id: ConnectionId,
    user_id: &str,
    project_id: &str,
) -> Result<(), ChatError> {
    membership::authorize(&state.db, project_id, user_id).await?;
    require_in_room(state, conn_id, project_id)
}

/// join_project: leave the current room (if any), then authorize and join
/// the new one. Registry and presence moves happen back to back with no
/// await between them, so the two never disagree across a yield.
/// Re-joining the room the connection already holds refreshes the
/// acknowledgement without moving presence, so the room never sees an
/// offline/online flicker.
async fn handle_join(
    state: &AppState,
    conn_id: ConnectionId,
    user_id: &str,
    project_id: &str,
) -> Result<(), ChatError> {
    let rejoin = ws::joined_project(&state.connections, conn_id).as_deref() == Some(project_id);

    // Leave the old room first, emitting user_offline if this was the
    // user's last connection there
    if !rejoin {
        leave_current_room(state, conn_id, user_id);
    }

    membership::authorize(&state.db, project_id, user_id).await?;

    let mut broadcast_own = false;
    if !rejoin {
        // The connection may have been torn down while authorize was in
        // flight — joining a dead connection would leak presence
        let Some(mut entry) = state.connections.get_mut(&conn_id) else {
            return Ok(());
        };
        entry.project_id = Some(project_id.to_string());
        drop(entry);

        broadcast_own = state.presence.mark_online(project_id, user_id);
        if broadcast_own {
            broadcast_to_project(
                &state.connections,
                project_id,
                &ServerEvent::UserOnline {
                    user_id: user_id.to_string(),
                    project_id: project_id.to_string(),
                    timestamp: now_millis(),
                },
            );
        }
    }

    // Join acknowledgement: replay the room's full presence snapshot to
    // the joining connection. The joiner's own id is skipped only when
    // their user_online broadcast just went out above
    let timestamp = now_millis();
    for online_user in state.presence.list_online(project_id) {
        if broadcast_own && online_user == user_id {
            continue;
        }
        send_to_connection(
            &state.connections,
            conn_id,
            &ServerEvent::UserOnline {
                user_id: online_user,
                project_id: project_id.to_string(),
                timestamp,
            },
        );
    }

    Ok(())
}

/// leave_project: only valid for the room currently joined.
fn handle_leave(
    state: &AppState,
    conn_id: ConnectionId,
    user_id: &str,
    project_id: &str,
) -> Result<(), ChatError> {
    require_in_room(state, conn_id, project_id)?;
    leave_current_room(state, conn_id, user_id);
    Ok(())
}

/// Shared leave sequence for leave_project, room switches, and disconnect
/// teardown: clear the registry slot, decrement presence, and emit
/// user_offline to the old room when the user's last connection left it.
pub(crate) fn leave_current_room(state: &AppState, conn_id: ConnectionId, user_id: &str) {
    let Some(prev) = ws::set_project(&state.connections, conn_id, None) else {
        return;
    };

    if state.presence.mark_offline(&prev, user_id) {
        broadcast_to_project(
            &state.connections,
            &prev,
            &ServerEvent::UserOffline {
                user_id: user_id.to_string(),
                project_id: prev.clone(),
                timestamp: now_millis(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_join_command() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"join_project","projectId":"P1"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::JoinProject { project_id } if project_id == "P1"));
    }

    #[test]
    fn decodes_send_with_optional_fields() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"send_message","projectId":"P1","content":"hi","mentions":["u2"]}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SendMessage {
                project_id,
                content,
                reply_to_id,
                mentions,
            } => {
                assert_eq!(project_id, "P1");
                assert_eq!(content, "hi");
                assert!(reply_to_id.is_none());
                assert_eq!(mentions.unwrap(), vec!["u2".to_string()]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_command_tag() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"shout","projectId":"P1"}"#)
            .is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"join_project"}"#).is_err());
    }

    #[test]
    fn event_wire_shape() {
        let event = ServerEvent::UserOnline {
            user_id: "u1".into(),
            project_id: "P1".into(),
            timestamp: 42,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_online");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["projectId"], "P1");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn notification_event_uses_type_field_for_kind() {
        let event = ServerEvent::NewNotification {
            notification_type: "PROJECT_MENTION".into(),
            project_id: "P1".into(),
            message: "hi".into(),
            sender: crate::chat::messages::SenderInfo {
                id: "u1".into(),
                display_name: "Ada".into(),
                avatar_url: None,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "new_notification");
        assert_eq!(value["notificationType"], "PROJECT_MENTION");
        assert_eq!(value["sender"]["displayName"], "Ada");
    }
}
