//! Closed set of capability operations.
//!
//! Operations are dispatched as enum variants everywhere inside the crate;
//! the snake_case wire string only appears at the serialisation boundary.

use adaptor_config::Capability;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// A named operation exposed by a capability plugin.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Opens a plugin context for one session.
    CreateContext,
    /// Closes a plugin context.
    DestroyContext,
    /// Reports whether the context holds a valid authorisation.
    IsAuth,
    /// Registers the context user with the service.
    Join,
    /// Authenticates and yields an access token.
    Login,
    /// Renews the access token.
    Refresh,
    /// Uploads a fresh contact list.
    NewContactList,
    /// Replaces the stored contact list.
    SetContactList,
    /// Fetches a contact profile.
    GetProfile,
    /// Updates the profile image.
    SetProfileImage,
    /// Removes the profile.
    DeleteProfile,
    /// Opens a chat room.
    CreateChatroom,
    /// Sends a chat message.
    SendMessage,
    /// Marks a message as read.
    ReadMessage,
    /// Lists unread messages.
    GetUnreadMessages,
    /// Leaves a chat room.
    EndChat,
    /// Opens the push channel.
    Connect,
    /// Closes the push channel.
    Disconnect,
    /// Reports push channel state.
    IsConnected,
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Returns `true` for the context lifecycle operations shared by every
    /// capability.
    #[must_use]
    pub const fn is_lifecycle(self) -> bool {
        matches!(self, Self::CreateContext | Self::DestroyContext)
    }
}

const AUTH_OPERATIONS: &[Operation] = &[
    Operation::CreateContext,
    Operation::DestroyContext,
    Operation::IsAuth,
    Operation::Join,
    Operation::Login,
    Operation::Refresh,
];

const CONTACT_OPERATIONS: &[Operation] = &[
    Operation::CreateContext,
    Operation::DestroyContext,
    Operation::NewContactList,
    Operation::SetContactList,
    Operation::GetProfile,
    Operation::SetProfileImage,
    Operation::DeleteProfile,
];

const MESSAGE_OPERATIONS: &[Operation] = &[
    Operation::CreateContext,
    Operation::DestroyContext,
    Operation::CreateChatroom,
    Operation::SendMessage,
    Operation::ReadMessage,
    Operation::GetUnreadMessages,
    Operation::EndChat,
];

const PUSH_OPERATIONS: &[Operation] = &[
    Operation::CreateContext,
    Operation::DestroyContext,
    Operation::Connect,
    Operation::Disconnect,
    Operation::IsConnected,
];

const LIFECYCLE_OPERATIONS: &[Operation] = &[Operation::CreateContext, Operation::DestroyContext];

const AUTH_MANDATORY: &[Operation] = &[
    Operation::CreateContext,
    Operation::DestroyContext,
    Operation::Login,
];

/// Operation tables of a [`Capability`].
pub trait CapabilityOperations {
    /// Every operation an adaptor of this capability dispatches.
    fn operations(self) -> &'static [Operation];

    /// Operations every plugin of this capability must provide.
    fn mandatory_operations(self) -> &'static [Operation];

    /// Returns `true` when `operation` belongs to this capability.
    fn supports(self, operation: Operation) -> bool;
}

impl CapabilityOperations for Capability {
    fn operations(self) -> &'static [Operation] {
        match self {
            Self::Auth => AUTH_OPERATIONS,
            Self::Contact => CONTACT_OPERATIONS,
            Self::Message => MESSAGE_OPERATIONS,
            Self::Push => PUSH_OPERATIONS,
        }
    }

    fn mandatory_operations(self) -> &'static [Operation] {
        match self {
            Self::Auth => AUTH_MANDATORY,
            Self::Contact | Self::Message | Self::Push => LIFECYCLE_OPERATIONS,
        }
    }

    fn supports(self, operation: Operation) -> bool {
        self.operations().contains(&operation)
    }
}
