//! Outbound command dispatch.
//!
//! Write intents arrive as tree writes on `{vin}.commands.{KIND}.start` or on
//! the `{vin}.remote.*` mirrors. Both resolve through the closed
//! [`CommandKind`] catalog; no substring matching on key names.

use std::sync::Arc;

use carlink_proto::{ClientMessage, CommandRequest};
use carlink_session::CommandSender;
use chrono::Timelike;

use crate::error::{AdapterError, AdapterResult};
use crate::tree::StateTree;

/// Closed catalog of dispatchable commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    DoorsLock,
    DoorsUnlock,
    WindowsOpen,
    WindowsClose,
    PreconditioningStart,
    PreconditioningStop,
    AuxheatStart,
    AuxheatStop,
}

impl CommandKind {
    pub const ALL: [CommandKind; 8] = [
        CommandKind::DoorsLock,
        CommandKind::DoorsUnlock,
        CommandKind::WindowsOpen,
        CommandKind::WindowsClose,
        CommandKind::PreconditioningStart,
        CommandKind::PreconditioningStop,
        CommandKind::AuxheatStart,
        CommandKind::AuxheatStop,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            CommandKind::DoorsLock => "DOORS_LOCK",
            CommandKind::DoorsUnlock => "DOORS_UNLOCK",
            CommandKind::WindowsOpen => "WINDOWS_OPEN",
            CommandKind::WindowsClose => "WINDOWS_CLOSE",
            CommandKind::PreconditioningStart => "ZEV_PRECONDITIONING_START",
            CommandKind::PreconditioningStop => "ZEV_PRECONDITIONING_STOP",
            CommandKind::AuxheatStart => "AUXHEAT_START",
            CommandKind::AuxheatStop => "AUXHEAT_STOP",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.wire_name().eq_ignore_ascii_case(name))
    }

    /// Commands the backend protects with the user's security pin.
    fn requires_pin(self) -> bool {
        matches!(self, CommandKind::DoorsUnlock | CommandKind::WindowsOpen)
    }
}

/// Translate a `{vin}.remote.*` mirror write into a command kind.
pub fn remote_intent(leaf: &str, on: bool) -> Option<CommandKind> {
    match leaf {
        "Preconditioning" => Some(if on {
            CommandKind::PreconditioningStart
        } else {
            CommandKind::PreconditioningStop
        }),
        "DoorLock" => Some(if on {
            CommandKind::DoorsLock
        } else {
            CommandKind::DoorsUnlock
        }),
        "DoorOpen" => Some(if on {
            CommandKind::DoorsUnlock
        } else {
            CommandKind::DoorsLock
        }),
        "WindowsOpen" => Some(if on {
            CommandKind::WindowsOpen
        } else {
            CommandKind::WindowsClose
        }),
        "Auxheat" => Some(if on {
            CommandKind::AuxheatStart
        } else {
            CommandKind::AuxheatStop
        }),
        _ => None,
    }
}

/// Older models need a concrete departure offset for preconditioning; without
/// a configured delay the command encodes "immediate, indefinite".
fn departure_encoding(minutes_of_day: i32, delay_minutes: i64) -> (i32, i32) {
    if delay_minutes > 0 {
        (2, minutes_of_day + delay_minutes as i32)
    } else {
        (3, -1)
    }
}

/// Builds command envelopes and sends them fire-and-forget over the session.
/// The eventual command-status event is not awaited or correlated.
#[derive(Clone)]
pub struct CommandDispatcher {
    tree: Arc<dyn StateTree>,
    sender: CommandSender,
    pin: Option<String>,
}

impl CommandDispatcher {
    pub fn new(tree: Arc<dyn StateTree>, sender: CommandSender, pin: Option<String>) -> Self {
        Self { tree, sender, pin }
    }

    /// Handle a host write intent. Unknown keys and unknown command names are
    /// ignored with a log line.
    pub async fn handle_write(&self, key: &str, value: &serde_json::Value) -> AdapterResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            [vin, "commands", name, "start"] => match CommandKind::from_wire_name(name) {
                Some(kind) => self.dispatch(vin, kind).await,
                None => {
                    tracing::warn!(command = *name, "unknown command kind, ignoring");
                    Ok(())
                }
            },
            [vin, "remote", leaf] => match remote_intent(leaf, truthy(value)) {
                Some(kind) => self.dispatch(vin, kind).await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Build and send one command envelope with a fresh request id.
    pub async fn dispatch(&self, vin: &str, kind: CommandKind) -> AdapterResult<()> {
        let mut request = CommandRequest::new(vin, kind.wire_name());
        if kind.requires_pin() {
            request.pin = self.pin.clone();
        }
        if kind == CommandKind::PreconditioningStart {
            let delay = self
                .tree
                .get(&format!("{vin}.remote.PreconditioningDelay"))
                .await?
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let now = chrono::Local::now();
            let minutes_of_day = now.hour() as i32 * 60 + now.minute() as i32;
            let (precondition_type, departure_time) = departure_encoding(minutes_of_day, delay);
            request.precondition_type = Some(precondition_type);
            request.departure_time = Some(departure_time);
        }

        tracing::debug!(vin, kind = kind.wire_name(), request_id = %request.request_id, "dispatching command");
        self.sender
            .send(ClientMessage::command(request))
            .await
            .map_err(|e| AdapterError::Api(format!("command send: {e}")))
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use carlink_proto::action;

    use super::*;
    use crate::tree::MemoryTree;

    fn dispatcher(pin: Option<&str>) -> (
        Arc<MemoryTree>,
        CommandDispatcher,
        tokio::sync::mpsc::Receiver<ClientMessage>,
    ) {
        let tree = Arc::new(MemoryTree::new());
        let (sender, rx) = CommandSender::loopback(8);
        let d = CommandDispatcher::new(tree.clone(), sender, pin.map(String::from));
        (tree, d, rx)
    }

    async fn recv(rx: &mut tokio::sync::mpsc::Receiver<ClientMessage>) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for command")
            .expect("channel closed")
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(
            CommandKind::from_wire_name("doors_lock"),
            Some(CommandKind::DoorsLock)
        );
        assert_eq!(CommandKind::from_wire_name("SELF_DESTRUCT"), None);
    }

    #[test]
    fn remote_intent_mapping() {
        assert_eq!(remote_intent("DoorLock", true), Some(CommandKind::DoorsLock));
        assert_eq!(remote_intent("DoorLock", false), Some(CommandKind::DoorsUnlock));
        assert_eq!(remote_intent("DoorOpen", true), Some(CommandKind::DoorsUnlock));
        assert_eq!(remote_intent("DoorOpen", false), Some(CommandKind::DoorsLock));
        assert_eq!(remote_intent("WindowsOpen", false), Some(CommandKind::WindowsClose));
        assert_eq!(
            remote_intent("Preconditioning", true),
            Some(CommandKind::PreconditioningStart)
        );
        assert_eq!(remote_intent("Auxheat", true), Some(CommandKind::AuxheatStart));
        assert_eq!(remote_intent("PreconditioningDelay", true), None);
    }

    #[test]
    fn departure_encoding_with_and_without_delay() {
        assert_eq!(departure_encoding(600, 0), (3, -1));
        assert_eq!(departure_encoding(600, 30), (2, 630));
        // Minutes are not wrapped at midnight; the backend accepts the raw sum.
        assert_eq!(departure_encoding(23 * 60 + 50, 30), (2, 1460));
    }

    #[tokio::test]
    async fn dispatch_attaches_pin_where_required() {
        let (_tree, d, mut rx) = dispatcher(Some("1234"));

        d.dispatch("VIN1", CommandKind::DoorsUnlock).await.unwrap();
        let msg = recv(&mut rx).await;
        assert_eq!(msg.action, action::COMMAND);
        let cmd = msg.command.unwrap();
        assert_eq!(cmd.kind, "DOORS_UNLOCK");
        assert_eq!(cmd.pin.as_deref(), Some("1234"));

        d.dispatch("VIN1", CommandKind::DoorsLock).await.unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.pin, None);
    }

    #[tokio::test]
    async fn preconditioning_without_delay_encodes_immediate() {
        let (_tree, d, mut rx) = dispatcher(None);

        d.dispatch("VIN1", CommandKind::PreconditioningStart)
            .await
            .unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.kind, "ZEV_PRECONDITIONING_START");
        assert_eq!(cmd.precondition_type, Some(3));
        assert_eq!(cmd.departure_time, Some(-1));
    }

    #[tokio::test]
    async fn preconditioning_with_delay_encodes_departure_offset() {
        let (tree, d, mut rx) = dispatcher(None);
        tree.set("VIN1.remote.PreconditioningDelay", serde_json::json!(30))
            .await
            .unwrap();

        d.dispatch("VIN1", CommandKind::PreconditioningStart)
            .await
            .unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.precondition_type, Some(2));
        // minutes-of-now plus the configured delay
        assert!(cmd.departure_time.unwrap() >= 30);
    }

    #[tokio::test]
    async fn write_intent_on_command_start_dispatches() {
        let (_tree, d, mut rx) = dispatcher(None);

        d.handle_write("VIN1.commands.DOORS_LOCK.start", &serde_json::json!(true))
            .await
            .unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.vin, "VIN1");
        assert_eq!(cmd.kind, "DOORS_LOCK");
    }

    #[tokio::test]
    async fn write_intent_on_remote_mirror_dispatches_opposite() {
        let (_tree, d, mut rx) = dispatcher(None);

        d.handle_write("VIN1.remote.DoorLock", &serde_json::json!(false))
            .await
            .unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.kind, "DOORS_UNLOCK");

        // String-typed writes from loosely-typed hosts still resolve.
        d.handle_write("VIN1.remote.WindowsOpen", &serde_json::json!("false"))
            .await
            .unwrap();
        let cmd = recv(&mut rx).await.command.unwrap();
        assert_eq!(cmd.kind, "WINDOWS_CLOSE");
    }

    #[tokio::test]
    async fn unknown_keys_are_ignored() {
        let (_tree, d, mut rx) = dispatcher(None);

        d.handle_write("VIN1.commands.SELF_DESTRUCT.start", &serde_json::json!(true))
            .await
            .unwrap();
        d.handle_write("VIN1.state.odo.intValue", &serde_json::json!(1))
            .await
            .unwrap();
        d.handle_write("VIN1.remote.PreconditioningDelay", &serde_json::json!(30))
            .await
            .unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err(), "no command should have been sent");
    }

    #[test]
    fn truthy_handles_loose_host_types() {
        assert!(truthy(&serde_json::json!(true)));
        assert!(!truthy(&serde_json::json!(false)));
        assert!(truthy(&serde_json::json!("true")));
        assert!(!truthy(&serde_json::json!("false")));
        assert!(!truthy(&serde_json::json!("")));
        assert!(truthy(&serde_json::json!(1)));
        assert!(!truthy(&serde_json::json!(0)));
        assert!(!truthy(&serde_json::Value::Null));
    }
}
