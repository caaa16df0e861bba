//! Built-in instruction handlers served by the `vnoc` binary

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dispatch::{Dispatcher, Handler, HandlerResult, Reply};
use crate::protocol::{FieldType, Message, ReadMessage, Schema};

/// Instruction codes of the built-in messages
pub mod instruction {
    pub const HEARTBEAT: u8 = 0x01;
    pub const HEARTBEAT_ACK: u8 = 0x02;
    pub const ECHO: u8 = 0x03;
    pub const ECHO_REPLY: u8 = 0x04;
    pub const LOGIN: u8 = 0x05;
    pub const LOGIN_ACK: u8 = 0x06;
}

use instruction::*;

/// Register heartbeat, echo and login handlers along with their schemas
pub fn register_builtin(dispatcher: &mut Dispatcher) {
    dispatcher.register(HEARTBEAT, heartbeat);
    dispatcher.register_schema(HEARTBEAT, Schema::new().required("timestamp", FieldType::U64));

    dispatcher.register(ECHO, echo);

    dispatcher.register(LOGIN, LoginHandler::new());
    dispatcher.register_schema(
        LOGIN,
        Schema::new()
            .required("user", FieldType::Text)
            .required("password", FieldType::Text),
    );
}

fn heartbeat(request: Message) -> HandlerResult {
    let timestamp = request.read_u64("timestamp")?;
    Ok(Message::new(HEARTBEAT_ACK).with("timestamp", timestamp).into())
}

fn echo(request: Message) -> HandlerResult {
    Ok(request.into_reply(ECHO_REPLY).into())
}

/// Acknowledges every login with a fresh session number.
///
/// Credentials are required on the wire but never checked.
pub struct LoginHandler {
    next_session: AtomicU64,
}

impl LoginHandler {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(1),
        }
    }
}

impl Default for LoginHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for LoginHandler {
    fn handle(&self, request: Message) -> HandlerResult {
        let user = request.read_text("user")?;
        request.read_text("password")?;

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Login from '{}' (session {})", user, session);

        Ok(Reply::Now(
            Message::new(LOGIN_ACK)
                .with("user", user)
                .with("accepted", 1u32)
                .with("session", session),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;

    fn builtin() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        register_builtin(&mut dispatcher);
        dispatcher
    }

    fn reply_of(dispatcher: &Dispatcher, request: Message) -> Message {
        match dispatcher.dispatch(request).unwrap() {
            Reply::Now(message) => message,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_registered_instructions() {
        assert_eq!(builtin().instructions(), vec![HEARTBEAT, ECHO, LOGIN]);
    }

    #[test]
    fn test_heartbeat() {
        let reply = reply_of(&builtin(), Message::new(HEARTBEAT).with("timestamp", 99u64));
        assert_eq!(reply.instruction(), HEARTBEAT_ACK);
        assert_eq!(reply.read_u64("timestamp").unwrap(), 99);
    }

    #[test]
    fn test_login_sessions_increase() {
        let dispatcher = builtin();
        let login = || {
            Message::new(LOGIN)
                .with("user", "alice")
                .with("password", "pw")
        };

        let first = reply_of(&dispatcher, login());
        let second = reply_of(&dispatcher, login());
        assert_eq!(first.read_text("user").unwrap(), "alice");
        assert_eq!(first.read_u32("accepted").unwrap(), 1);
        assert!(second.read_u64("session").unwrap() > first.read_u64("session").unwrap());
    }

    #[test]
    fn test_login_without_password() {
        let err = builtin()
            .dispatch(Message::new(LOGIN).with("user", "alice"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Message { instruction: LOGIN, .. }));
    }
}
