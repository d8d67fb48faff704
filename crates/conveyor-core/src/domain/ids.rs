//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`, so an `EventId` can never be
//! passed where a `MessageId` is expected. ULIDs sort by creation time, which keeps
//! outbox rows roughly ordered even before `created_at` is consulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Display prefix ("evt-", "msg-").
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed display form and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "evt-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Identifier of an outbox event.
pub type EventId = Id<Event>;

/// Identifier of a queue message.
pub type MessageId = Id<Message>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        let event = EventId::from_ulid(Ulid::new());
        let message = MessageId::from_ulid(Ulid::new());

        assert!(event.to_string().starts_with("evt-"));
        assert!(message.to_string().starts_with("msg-"));
        // let _: EventId = message; // <- does not compile
    }

    #[test]
    fn ids_parse_prefixed_and_bare_forms() {
        let ulid = Ulid::new();
        let id = EventId::from_ulid(ulid);

        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: EventId = ulid.to_string().parse().unwrap();
        assert_eq!(bare, id);

        assert!("evt-not-a-ulid".parse::<EventId>().is_err());
    }

    #[test]
    fn ids_serialize_as_plain_ulid() {
        let id = MessageId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));

        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let first = EventId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EventId::from_ulid(Ulid::new());
        assert!(first < second);
    }
}
