//! Handler replies
//!
//! A handler either answers inline or hands back a [`Reply::Later`] whose
//! message is produced by a separate task. Deferred replies keep their place
//! in the connection's write order.

use tokio::sync::oneshot;

use crate::protocol::Message;

/// What a handler produced for one request
#[derive(Debug)]
pub enum Reply {
    /// Nothing to send back
    None,
    /// Reply available immediately
    Now(Message),
    /// Reply delivered later through a [`ReplySender`]
    Later(DeferredReply),
}

impl Reply {
    /// Create a deferred reply and the sender that completes it
    pub fn deferred() -> (ReplySender, Reply) {
        let (tx, rx) = oneshot::channel();
        (ReplySender { tx }, Reply::Later(DeferredReply { rx }))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Reply::None)
    }
}

impl From<Message> for Reply {
    fn from(message: Message) -> Self {
        Reply::Now(message)
    }
}

impl From<Option<Message>> for Reply {
    fn from(message: Option<Message>) -> Self {
        match message {
            Some(message) => Reply::Now(message),
            None => Reply::None,
        }
    }
}

/// Completes a deferred reply
#[derive(Debug)]
pub struct ReplySender {
    tx: oneshot::Sender<Message>,
}

impl ReplySender {
    /// Deliver the reply. Returns the message back if the connection is gone.
    pub fn send(self, message: Message) -> Result<(), Message> {
        self.tx.send(message)
    }

    /// Whether the waiting connection has already been closed
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of a deferred reply, held in a connection's write queue
#[derive(Debug)]
pub struct DeferredReply {
    rx: oneshot::Receiver<Message>,
}

impl DeferredReply {
    /// Wait for the reply; None if the sender was dropped without answering.
    ///
    /// Cancel safe: dropping the future keeps the reply pending.
    pub async fn wait(&mut self) -> Option<Message> {
        (&mut self.rx).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReadMessage;

    #[tokio::test]
    async fn test_deferred_reply_delivery() {
        let (tx, reply) = Reply::deferred();
        let Reply::Later(mut deferred) = reply else {
            panic!("expected a deferred reply");
        };

        tokio::spawn(async move {
            tx.send(Message::new(0x02).with("n", 1u32)).unwrap();
        });

        let message = deferred.wait().await.unwrap();
        assert_eq!(message.read_u32("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_sender() {
        let (tx, reply) = Reply::deferred();
        drop(tx);
        match reply {
            Reply::Later(mut deferred) => assert!(deferred.wait().await.is_none()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_sender_sees_closed_receiver() {
        let (tx, reply) = Reply::deferred();
        drop(reply);
        assert!(tx.is_closed());
        assert!(tx.send(Message::new(1)).is_err());
    }

    #[test]
    fn test_from_option() {
        assert!(Reply::from(None).is_none());
        assert!(matches!(Reply::from(Some(Message::new(1))), Reply::Now(_)));
    }
}
