use std::collections::HashSet;

use policy_engine::{Direction, Query};

use crate::wire::{parse_header, DecodeError, Header, MessageType};

/// Well-known name, path prefix and interface of the bus driver.
pub const BUS_DRIVER: &str = "org.freedesktop.DBus";

/// A call or signal crossing the boundary, reduced to what rules match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub direction: Direction,
    pub kind: MessageType,
    /// Empty when the message names no interface.
    pub interface: String,
    pub object_path: String,
    pub method: String,
}

impl Envelope {
    pub fn query(&self) -> Query<'_> {
        Query::new(self.direction, &self.interface, &self.object_path, &self.method)
    }
}

/// What the relay should do with a message before any policy is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Traffic to or from the bus driver. The relay is not a bus daemon, so
    /// `Hello`, match rules and name-ownership signals pass untouched.
    Control,
    /// A method return or error. `destination` is the caller it goes back to.
    Reply {
        reply_serial: u32,
        destination: Option<String>,
    },
    /// A call or signal subject to the policy.
    Boundary(Envelope),
    /// A copy of a message between two outside peers, delivered only because
    /// the inside peer is eavesdropping. Never evaluated, never relayed.
    Observed,
}

/// Per-direction message classifier.
///
/// The incoming side also learns which names the inside peer owns on the
/// outside bus, so it can tell messages addressed to it from eavesdropped
/// copies.
#[derive(Debug)]
pub struct Classifier {
    direction: Direction,
    unique_name: Option<String>,
    owned: HashSet<String>,
}

impl Classifier {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            unique_name: None,
            owned: HashSet::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    pub fn owns(&self, name: &str) -> bool {
        self.owned.contains(name)
    }

    pub fn classify(&mut self, frame: &[u8]) -> Result<(Header, Classification), DecodeError> {
        let header = parse_header(frame)?;
        let class = self.classify_header(&header, frame);
        Ok((header, class))
    }

    fn classify_header(&mut self, header: &Header, frame: &[u8]) -> Classification {
        if self.direction == Direction::Incoming {
            self.track_names(header, frame);
        }

        if self.is_driver_traffic(header) {
            return Classification::Control;
        }

        if self.direction == Direction::Incoming && !self.addressed_to_inside(header) {
            return Classification::Observed;
        }

        match header.message_type {
            MessageType::MethodReturn | MessageType::Error => Classification::Reply {
                reply_serial: header.reply_serial.unwrap_or_default(),
                destination: header.destination.clone(),
            },
            MessageType::MethodCall | MessageType::Signal => Classification::Boundary(Envelope {
                direction: self.direction,
                kind: header.message_type,
                interface: header.interface.clone().unwrap_or_default(),
                object_path: header.path.clone().unwrap_or_default(),
                method: header.member.clone().unwrap_or_default(),
            }),
        }
    }

    /// Outgoing, only the destination counts: the inside peer writes every
    /// other header itself. Incoming, only the sender counts, since the
    /// daemon stamps it.
    fn is_driver_traffic(&self, header: &Header) -> bool {
        let field = match self.direction {
            Direction::Outgoing => &header.destination,
            Direction::Incoming => &header.sender,
        };
        field.as_deref() == Some(BUS_DRIVER)
    }

    /// Broadcast signals have no destination and are always for us. Until
    /// the `Hello` reply arrives nothing can be told apart.
    fn addressed_to_inside(&self, header: &Header) -> bool {
        match &header.destination {
            None => true,
            Some(_) if self.unique_name.is_none() => true,
            Some(dest) => self.owned.contains(dest),
        }
    }

    fn track_names(&mut self, header: &Header, frame: &[u8]) {
        if header.sender.as_deref() != Some(BUS_DRIVER) {
            return;
        }

        let Some(dest) = header.destination.as_deref() else {
            return;
        };

        if self.unique_name.is_none() {
            // The first message the driver sends us is the Hello reply.
            if header.message_type == MessageType::MethodReturn && dest.starts_with(':') {
                tracing::debug!(unique_name = dest, "inside peer registered");
                self.unique_name = Some(dest.to_string());
                self.owned.insert(dest.to_string());
            }
            return;
        }

        if header.message_type != MessageType::Signal
            || header.interface.as_deref() != Some(BUS_DRIVER)
            || self.unique_name.as_deref() != Some(dest)
        {
            return;
        }

        match header.member.as_deref() {
            Some("NameAcquired") => {
                if let Some(name) = header.first_string_arg(frame) {
                    tracing::debug!(%name, "name acquired by inside peer");
                    self.owned.insert(name);
                }
            }
            Some("NameLost") => {
                if let Some(name) = header.first_string_arg(frame) {
                    tracing::debug!(%name, "name lost by inside peer");
                    if self.unique_name.as_deref() != Some(name.as_str()) {
                        self.owned.remove(&name);
                    }
                }
            }
            _ => {}
        }
    }
}
