//! Configuration and presets for a sync session.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Number of messages requested per history page.
pub const DEFAULT_PAGE_SIZE: usize = 40;

/// Preset configurations for common client profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// Balanced defaults for a desktop or browser client.
    #[default]
    Default,
    /// Busy channels with bursty push traffic.
    /// - Large event queue (1024)
    /// - Large notification channel (4096)
    LowLatency,
    /// Small footprint for constrained clients.
    /// - Small queues (64)
    /// - Smaller pages (20)
    Constrained,
}

impl Preset {
    /// Capacity of the per-session command and event queues.
    pub fn queue_capacity(&self) -> usize {
        match self {
            Preset::Default => 256,
            Preset::LowLatency => 1024,
            Preset::Constrained => 64,
        }
    }

    /// Capacity of the notification broadcast channel.
    pub fn notification_capacity(&self) -> usize {
        match self {
            Preset::Default => 1024,
            Preset::LowLatency => 4096,
            Preset::Constrained => 128,
        }
    }

    /// History page size.
    pub fn page_size(&self) -> usize {
        match self {
            Preset::Constrained => 20,
            _ => DEFAULT_PAGE_SIZE,
        }
    }
}

/// Configuration for a [`ChatSession`](crate::session::ChatSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Messages per history page; a shorter page ends pagination.
    pub page_size: usize,
    /// Bound of the session command queue.
    pub command_queue_capacity: usize,
    /// Bound of each channel's push-event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_preset(Preset::Default)
    }
}

impl SyncConfig {
    /// Build a configuration from a preset.
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            page_size: preset.page_size(),
            command_queue_capacity: preset.queue_capacity(),
            event_queue_capacity: preset.queue_capacity(),
            notification_capacity: preset.notification_capacity(),
        }
    }

    /// Set the history page size.
    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    /// Set the command queue bound.
    pub fn command_queue_capacity(mut self, n: usize) -> Self {
        self.command_queue_capacity = n;
        self
    }

    /// Set the push-event queue bound.
    pub fn event_queue_capacity(mut self, n: usize) -> Self {
        self.event_queue_capacity = n;
        self
    }

    /// Set the notification channel capacity.
    pub fn notification_capacity(mut self, n: usize) -> Self {
        self.notification_capacity = n;
        self
    }

    /// Reject zero sizes, which tokio channels and pagination cannot use.
    pub fn validate(&self) -> SyncResult<()> {
        let fields = [
            ("page_size", self.page_size),
            ("command_queue_capacity", self.command_queue_capacity),
            ("event_queue_capacity", self.event_queue_capacity),
            ("notification_capacity", self.notification_capacity),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
