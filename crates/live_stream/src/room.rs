use serde::{Serialize, Deserialize};

/// Room metadata as reported by the monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomInfo {
    /// Real (long) room id
    pub room_id: u64,
    /// Short vanity id, 0 when the room has none
    pub short_room_id: u64,
    /// Streamer display name
    pub user_name: String,
    /// Current broadcast title
    pub title: String,
    /// Whether the room reported itself live when fetched
    pub is_streaming: bool,
}

impl RoomInfo {
    pub fn new(room_id: u64) -> Self {
        Self {
            room_id,
            ..Default::default()
        }
    }

    pub fn with_short_room_id(mut self, short_room_id: u64) -> Self {
        self.short_room_id = short_room_id;
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_streaming(mut self, is_streaming: bool) -> Self {
        self.is_streaming = is_streaming;
        self
    }

    /// Id to show users: the short id when there is one
    pub fn display_id(&self) -> u64 {
        if self.short_room_id != 0 {
            self.short_room_id
        } else {
            self.room_id
        }
    }
}
