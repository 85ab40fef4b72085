//! Control-protocol command ids and flags.
//!
//! Ids below 1000 are reserved for transport-internal system messages.
//! The numeric values are wire-visible and must not be renumbered.

/// Control byte flag: the payload is RSA-chunk encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x01;
/// Control byte flag: the cleartext starts with a command id.
pub const FLAG_COMMAND: u8 = 0x02;

/// Lowest id available to regular commands; everything below is a
/// system message.
pub const SYSTEM_ID_LIMIT: u16 = 1000;

/// A control-protocol command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    /// Credentials check; must be the first message on a connection.
    Auth = 1000,
    /// Bind the connection's scope to one service.
    SelectService = 1001,
    /// Server greeting, sent unsolicited right after accept.
    Helo = 1002,
    /// Application-defined command (COMMAND bit unset on the wire).
    CustomCmd = 1003,
    /// List every client in the selected scope.
    ListClients = 1004,
    /// Deliver a message to one or many clients.
    SendMessage = 1005,
}

impl CommandId {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Convert from a wire value.
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            1000 => Some(Self::Auth),
            1001 => Some(Self::SelectService),
            1002 => Some(Self::Helo),
            1003 => Some(Self::CustomCmd),
            1004 => Some(Self::ListClients),
            1005 => Some(Self::SendMessage),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::SelectService => "SELECT_SERVICE",
            Self::Helo => "HELO",
            Self::CustomCmd => "CUSTOM_CMD",
            Self::ListClients => "LIST_CLIENTS",
            Self::SendMessage => "SEND_MESSAGE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(CommandId::Auth.as_u16(), 1000);
        assert_eq!(CommandId::SelectService.as_u16(), 1001);
        assert_eq!(CommandId::Helo.as_u16(), 1002);
        assert_eq!(CommandId::CustomCmd.as_u16(), 1003);
        assert_eq!(CommandId::ListClients.as_u16(), 1004);
        assert_eq!(CommandId::SendMessage.as_u16(), 1005);
    }

    #[test]
    fn test_roundtrip() {
        for id in 1000..=1005 {
            assert_eq!(CommandId::from_u16(id).unwrap().as_u16(), id);
        }
        assert!(CommandId::from_u16(999).is_none());
        assert!(CommandId::from_u16(1006).is_none());
    }
}
