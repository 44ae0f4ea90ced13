use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// A committed change, addressed to a room or instructor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    /// JSON description of the change.
    pub payload: String,
}

pub fn room_channel(room_id: RoomId) -> String {
    format!("room_{room_id}")
}

pub fn instructor_channel(instructor_id: InstructorId) -> String {
    format!("instructor_{instructor_id}")
}

#[derive(Serialize)]
struct Payload {
    event: &'static str,
    id: String,
    room_id: RoomId,
    instructor_id: InstructorId,
    weekday: &'static str,
    start_time: String,
    end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<Box<Payload>>,
}

impl Payload {
    fn describe(event: &'static str, b: &Booking) -> Self {
        Self {
            event,
            id: b.id.to_string(),
            room_id: b.room_id,
            instructor_id: b.instructor_id,
            weekday: b.window.weekday.as_str(),
            start_time: b.window.start.to_string(),
            end_time: b.window.end.to_string(),
            previous: None,
        }
    }
}

/// Render an event as the JSON payload delivered to subscribers.
pub fn render_payload(event: &Event) -> String {
    let payload = match event {
        Event::BookingUpdated { previous, booking } => Payload {
            previous: Some(Box::new(Payload::describe("previous", previous))),
            ..Payload::describe(event.label(), booking)
        },
        Event::BookingCreated { booking } | Event::BookingDeleted { booking } => {
            Payload::describe(event.label(), booking)
        }
    };
    serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
}

/// Channels touched by an event: the room and instructor of the booking, and
/// for updates also those it moved away from.
pub fn channels_for(event: &Event) -> Vec<String> {
    let mut channels = Vec::with_capacity(4);
    let mut add = |b: &Booking| {
        for ch in [room_channel(b.room_id), instructor_channel(b.instructor_id)] {
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
    };
    match event {
        Event::BookingCreated { booking } | Event::BookingDeleted { booking } => add(booking),
        Event::BookingUpdated { previous, booking } => {
            add(booking);
            add(previous);
        }
    }
    channels
}

/// Broadcast hub keyed by channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver `event` on every channel it touches. No-op for channels
    /// nobody listens to; channels whose listeners are all gone are dropped.
    pub fn publish(&self, event: &Event) {
        let channels = channels_for(event);
        if channels.iter().all(|ch| !self.channels.contains_key(ch)) {
            return;
        }
        let payload = render_payload(event);
        for channel in channels {
            let Some(sender) = self.channels.get(&channel).map(|s| s.value().clone()) else {
                continue;
            };
            let note = Notification {
                channel: channel.clone(),
                payload: payload.clone(),
            };
            if sender.send(note).is_err() {
                self.channels
                    .remove_if(&channel, |_, s| s.receiver_count() == 0);
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
