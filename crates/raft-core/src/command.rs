//! # command
//!
//! why: let the core replicate and apply commands without knowing what they mean
//! relations: records live in log.rs entries; node.rs decodes them here before applying
//! what: Command and StateMachine traits, CommandRegistry keyed by stable names

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{ApplyError, RaftError, Result};
use crate::log::CommandRecord;
use crate::membership::{MembershipChange, JOIN_COMMAND, LEAVE_COMMAND};

/// A replicated operation on a state machine of type `S`
///
/// `name` must be stable across versions: it is what lands on disk and on
/// the wire next to the encoded payload.
pub trait Command<S>: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self) -> Result<Vec<u8>>;

    fn apply(&self, state: &mut S) -> std::result::Result<(), ApplyError>;

    /// Name and payload ready for the log
    fn to_record(&self) -> Result<CommandRecord> {
        Ok(CommandRecord::new(self.name(), self.encode()?))
    }
}

/// The application that committed commands are delivered to
pub trait StateMachine: Send + 'static {
    /// Apply the command committed at `index`
    fn apply(&mut self, index: u64, command: &dyn Command<Self>) -> std::result::Result<(), ApplyError>
    where
        Self: Sized,
    {
        let _ = index;
        command.apply(self)
    }

    /// Serialize the whole state for compaction
    fn snapshot(&self) -> std::result::Result<Vec<u8>, ApplyError> {
        Ok(Vec::new())
    }

    /// Replace the whole state with a snapshot image
    fn restore(&mut self, data: &[u8]) -> std::result::Result<(), ApplyError> {
        let _ = data;
        Ok(())
    }
}

/// Turns a payload back into a command
pub type DecodeFn<S> = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Command<S>>> + Send + Sync>;

/// Maps command names to their decoders
pub struct CommandRegistry<S> {
    decoders: HashMap<String, DecodeFn<S>>,
}

impl<S: 'static> CommandRegistry<S> {
    /// A registry holding the built-in membership commands
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        for name in [JOIN_COMMAND, LEAVE_COMMAND] {
            registry.decoders.insert(
                name.to_string(),
                Arc::new(move |payload: &[u8]| -> Result<Box<dyn Command<S>>> {
                    let change: MembershipChange = serde_json::from_slice(payload)
                        .map_err(|e| RaftError::codec(name, e))?;
                    Ok(Box::new(change) as Box<dyn Command<S>>)
                }),
            );
        }
        registry
    }

    /// Register a serde-decodable command type under `name`
    pub fn register<C>(&mut self, name: &str) -> Result<()>
    where
        C: Command<S> + DeserializeOwned + 'static,
    {
        let owned = name.to_string();
        self.register_decoder(name, move |payload| {
            let command: C =
                serde_json::from_slice(payload).map_err(|e| RaftError::codec(owned.clone(), e))?;
            Ok(Box::new(command) as Box<dyn Command<S>>)
        })
    }

    /// Register a custom decoder under `name`
    pub fn register_decoder<F>(&mut self, name: &str, decode: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Result<Box<dyn Command<S>>> + Send + Sync + 'static,
    {
        if self.decoders.contains_key(name) {
            return Err(RaftError::DuplicateCommand {
                name: name.to_string(),
            });
        }
        self.decoders.insert(name.to_string(), Arc::new(decode));
        Ok(())
    }

    pub fn decode(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command<S>>> {
        let decode = self
            .decoders
            .get(name)
            .ok_or_else(|| RaftError::UnknownCommand {
                name: name.to_string(),
            })?;
        decode(payload)
    }

    pub fn decode_record(&self, record: &CommandRecord) -> Result<Box<dyn Command<S>>> {
        self.decode(&record.name, &record.payload)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }
}

impl<S: 'static> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for CommandRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.decoders.keys().collect();
        names.sort_unstable();
        f.debug_struct("CommandRegistry").field("names", &names).finish()
    }
}
