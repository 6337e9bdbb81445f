use serde::{Deserialize, Serialize};
use serde_json::Value;
use tileworld_command::Command;
use tileworld_kernel::Mutation;
use uuid::Uuid;

use crate::NetError;

/// Wire envelope: `{ ClientID, Content, ContentType }`.
///
/// `Content` is the payload of one type-tagged variant; `ContentType` is its
/// tag and selects the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "ClientID")]
    pub client_id: Uuid,
    #[serde(rename = "Content")]
    pub content: Value,
    #[serde(rename = "ContentType")]
    pub content_type: String,
}

impl Message {
    pub fn new(client_id: Uuid, content_type: impl Into<String>, content: Value) -> Self {
        Self {
            client_id,
            content,
            content_type: content_type.into(),
        }
    }

    /// Wrap a command for the server.
    pub fn from_command(client_id: Uuid, command: &Command) -> Result<Self, NetError> {
        Ok(Self::new(client_id, command.type_tag(), command.content()?))
    }

    /// Wrap a mutation for a client.
    pub fn from_mutation(client_id: Uuid, mutation: &Mutation) -> Result<Self, NetError> {
        Ok(Self::new(client_id, mutation.type_tag(), mutation.content()?))
    }

    /// Decode the payload as a command.
    pub fn to_command(&self) -> Result<Command, NetError> {
        Ok(Command::decode(&self.content_type, &self.content)?)
    }

    /// Decode the payload as a mutation.
    pub fn to_mutation(&self) -> Result<Mutation, NetError> {
        Ok(Mutation::decode(&self.content_type, &self.content)?)
    }
}
