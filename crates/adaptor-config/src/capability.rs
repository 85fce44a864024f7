//! Capability domains an adaptor can serve.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Capability domain served by one adaptor instance.
///
/// Each domain owns its own plugin directory, registry and listener. The
/// snake_case spelling is shared by configuration files, plugin directory
/// names and log fields.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Capability {
    /// Account authentication and token management.
    Auth,
    /// Contact list and profile synchronisation.
    Contact,
    /// Chat rooms and message delivery.
    Message,
    /// Push channel connectivity.
    Push,
}

impl Capability {
    /// Every capability, in the order adaptors are created.
    pub const ALL: [Self; 4] = [Self::Auth, Self::Contact, Self::Message, Self::Push];

    /// Numeric code carried across the in-process plugin ABI.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Auth => 1,
            Self::Contact => 2,
            Self::Message => 3,
            Self::Push => 4,
        }
    }

    /// Resolves a capability from its ABI code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Auth),
            2 => Some(Self::Contact),
            3 => Some(Self::Message),
            4 => Some(Self::Push),
            _ => None,
        }
    }

    /// Name of the plugin sub-directory scanned for this capability.
    #[must_use]
    pub fn directory_name(self) -> &'static str {
        self.into()
    }
}

/// Errors encountered while parsing a [`Capability`] from text.
pub type CapabilityParseError = strum::ParseError;
