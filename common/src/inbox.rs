use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{constants::MQTT_MAX_PAYLOAD_BYTES, types::Channel};

/// Single-item mailbox. A new arrival replaces whatever is unread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InboundSlot {
    payload: String,
    dirty: bool,
}

impl InboundSlot {
    pub fn store(&mut self, payload: &str) {
        self.payload.clear();
        self.payload.push_str(truncate_payload(payload));
        self.dirty = true;
    }

    pub fn has_new(&self) -> bool {
        self.dirty
    }

    pub fn take(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(std::mem::take(&mut self.payload))
    }
}

#[derive(Debug, Default)]
struct Slots {
    slots: [InboundSlot; 4],
    activity: bool,
}

/// Shared set of inbound slots, one per [`Channel`].
///
/// Delivery also latches an activity flag that is independent of the
/// slots, so a command consumed before the sleep monitor polls still
/// counts as activity.
#[derive(Debug, Default, Clone)]
pub struct Inbox {
    inner: Arc<Mutex<Slots>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn deliver(&self, channel: Channel, payload: &str) {
        let mut slots = self.slots();
        let slot = &mut slots.slots[channel.index()];
        if slot.has_new() {
            log::debug!("{channel:?} slot overwritten before it was consumed");
        }
        slot.store(payload);
        slots.activity = true;
    }

    pub fn has_new(&self, channel: Channel) -> bool {
        self.slots().slots[channel.index()].has_new()
    }

    pub fn take(&self, channel: Channel) -> Option<String> {
        self.slots().slots[channel.index()].take()
    }

    /// Returns and clears the activity latch.
    pub fn take_activity(&self) -> bool {
        std::mem::replace(&mut self.slots().activity, false)
    }
}

pub(crate) fn truncate_payload(payload: &str) -> &str {
    if payload.len() <= MQTT_MAX_PAYLOAD_BYTES {
        return payload;
    }
    let mut end = MQTT_MAX_PAYLOAD_BYTES;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn newer_message_overwrites_unread_one() {
        let inbox = Inbox::new();
        inbox.deliver(Channel::Tcp, "first");
        inbox.deliver(Channel::Tcp, "second");

        assert_eq!(inbox.take(Channel::Tcp), Some("second".to_string()));
        assert_eq!(inbox.take(Channel::Tcp), None);
        assert!(!inbox.has_new(Channel::Tcp));
    }

    #[test]
    fn channels_are_independent() {
        let inbox = Inbox::new();
        inbox.deliver(Channel::MqttSound, "volume:10");

        assert!(inbox.has_new(Channel::MqttSound));
        assert!(!inbox.has_new(Channel::MqttLight));
        assert_eq!(inbox.take(Channel::Serial), None);
    }

    #[test]
    fn activity_survives_consumption() {
        let inbox = Inbox::new();
        inbox.deliver(Channel::Serial, "+");
        let _ = inbox.take(Channel::Serial);

        assert!(inbox.take_activity());
        assert!(!inbox.take_activity());
    }

    #[test]
    fn oversized_payload_is_cut_on_char_boundary() {
        let mut slot = InboundSlot::default();
        let payload = format!("{}é", "a".repeat(254));
        slot.store(&payload);

        let stored = slot.take().unwrap();
        assert_eq!(stored.len(), 254);
    }
}
