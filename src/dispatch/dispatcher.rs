//! Instruction dispatcher
//!
//! Maps an instruction code to exactly one handler. Registration takes
//! `&mut self` and happens while the dispatcher is being configured; once it
//! is wrapped in an `Arc` and handed to the server, the table is read-only.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use super::Reply;
use crate::protocol::{Message, MessageError, ReadMessage, Schema};

/// Result type for handler functions
pub type HandlerResult = Result<Reply, MessageError>;

/// Trait for instruction handlers.
///
/// Handlers run to completion inside one scheduler turn and must not block.
/// Long work belongs in a spawned task answering through [`Reply::deferred`].
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Message) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: Message) -> HandlerResult {
        self(request)
    }
}

/// Dispatch errors. None of these are fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Unknown instruction: {0:#04x}")]
    UnknownInstruction(u8),

    #[error("Instruction {instruction:#04x} rejected: {source}")]
    Message {
        instruction: u8,
        source: MessageError,
    },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Registration table of instruction handlers
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u8, Box<dyn Handler>>,
    schemas: HashMap<u8, Schema>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an instruction, replacing any previous one.
    ///
    /// Returns true if a handler was replaced.
    pub fn register<H: Handler>(&mut self, instruction: u8, handler: H) -> bool {
        let replaced = self.handlers.insert(instruction, Box::new(handler)).is_some();
        if replaced {
            tracing::debug!("Replaced handler for instruction {:#04x}", instruction);
        }
        replaced
    }

    /// Attach an eager validation schema to an instruction
    pub fn register_schema(&mut self, instruction: u8, schema: Schema) {
        self.schemas.insert(instruction, schema);
    }

    /// Remove the handler for an instruction
    pub fn unregister(&mut self, instruction: u8) -> bool {
        self.schemas.remove(&instruction);
        self.handlers.remove(&instruction).is_some()
    }

    pub fn is_registered(&self, instruction: u8) -> bool {
        self.handlers.contains_key(&instruction)
    }

    /// Registered instruction codes in ascending order
    pub fn instructions(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route a message to its handler
    pub fn dispatch(&self, message: Message) -> DispatchResult<Reply> {
        let instruction = message.instruction();
        let handler = self
            .handlers
            .get(&instruction)
            .ok_or(DispatchError::UnknownInstruction(instruction))?;

        if let Some(schema) = self.schemas.get(&instruction) {
            schema
                .validate(&message)
                .map_err(|source| DispatchError::Message { instruction, source })?;
        }

        tracing::debug!(
            "Dispatching instruction {:#04x} ({} fields)",
            instruction,
            message.len()
        );

        handler
            .handle(message)
            .map_err(|source| DispatchError::Message { instruction, source })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instructions", &self.instructions())
            .field("schemas", &self.schemas.len())
            .finish()
    }
}
