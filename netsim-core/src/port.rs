//! Symbolic names for the reserved [`Port`] numbers.

use crate::Port;
use std::fmt::{self, Display, Formatter};

/// Port numbers with a reserved meaning. Any other integer is a valid,
/// unreserved port.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KnownPort {
    /// Reserved; also used when the port does not matter
    Unknown = 0,
    /// The port routers advertise their routing tables from
    Rip = 1,
    /// The application port of the HTTP demonstration
    Http = 2,
    /// "Who are you": routers ask their neighbors on this port and leaf
    /// hosts answer that they are not routers
    Discovery = 3,
}

impl KnownPort {
    const ALL: [KnownPort; 4] = [Self::Unknown, Self::Rip, Self::Http, Self::Discovery];

    /// The port number.
    pub const fn number(self) -> Port {
        self as Port
    }

    /// Whether `number` is this port.
    pub const fn is(self, number: Port) -> bool {
        self.number() == number
    }

    /// Gets the known port with the given number, if it is reserved.
    pub fn with_number(number: Port) -> Option<Self> {
        usize::try_from(number)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// The symbolic name of the port.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Rip => "RIP",
            Self::Http => "HTTP",
            Self::Discovery => "DISCOVERY",
        }
    }
}

impl Display for KnownPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<KnownPort> for Port {
    fn from(port: KnownPort) -> Self {
        port.number()
    }
}

/// Formats a port number as its symbolic name if it is reserved and as the
/// number itself otherwise.
pub fn format_port(number: Port) -> String {
    PortDisplay(number).to_string()
}

/// Adapter that displays a port number the way [`format_port`] does without
/// allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortDisplay(pub Port);

impl Display for PortDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match KnownPort::with_number(self.0) {
            Some(port) => port.fmt(f),
            None => self.0.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ports_format_as_names() {
        assert_eq!(format_port(0), "UNKNOWN");
        assert_eq!(format_port(1), "RIP");
        assert_eq!(format_port(2), "HTTP");
        assert_eq!(format_port(3), "DISCOVERY");
    }

    #[test]
    fn unreserved_ports_format_as_numbers() {
        assert_eq!(format_port(4), "4");
        assert_eq!(format_port(8080), "8080");
        assert_eq!(format_port(-7), "-7");
    }

    #[test]
    fn numbers_round_trip() {
        for port in KnownPort::ALL {
            assert_eq!(KnownPort::with_number(port.number()), Some(port));
            assert!(port.is(port.number()));
        }
        assert_eq!(KnownPort::with_number(KnownPort::ALL.len() as Port), None);
    }
}
