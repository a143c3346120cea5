//! Boundary to the platform: external actions and the permission store

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A concrete side effect a tool handler asks the platform to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalAction {
    OpenLink {
        url: String,
    },
    Dial {
        number: String,
    },
    LaunchApp {
        app: String,
        scheme: String,
    },
    CalendarEvent {
        title: String,
        date: Option<String>,
        time: Option<String>,
        duration_minutes: Option<u32>,
    },
    ComposeEmail {
        to: String,
        subject: Option<String>,
        body: Option<String>,
    },
    ControlLight {
        brightness: u8,
        color_temperature: Option<String>,
    },
}

impl ExternalAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenLink { .. } => "open_link",
            Self::Dial { .. } => "dial",
            Self::LaunchApp { .. } => "launch_app",
            Self::CalendarEvent { .. } => "calendar_event",
            Self::ComposeEmail { .. } => "compose_email",
            Self::ControlLight { .. } => "control_light",
        }
    }
}

/// Performs external actions on behalf of tool handlers.
///
/// Returns a short description of what happened, or an error the handler
/// turns into an error result.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: ExternalAction) -> Result<String>;
}

/// Read-only view of the user's capability toggles.
pub trait PermissionStore: Send + Sync {
    fn is_allowed(&self, capability: &str) -> bool;
}

/// In-memory capability map; capabilities not listed use `default_allow`.
#[derive(Debug, Default)]
pub struct PermissionSet {
    entries: RwLock<HashMap<String, bool>>,
    default_allow: bool,
}

impl PermissionSet {
    pub fn new(default_allow: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_allow,
        }
    }

    pub fn with(self, capability: &str, allowed: bool) -> Self {
        self.set(capability, allowed);
        self
    }

    pub fn set(&self, capability: &str, allowed: bool) {
        self.entries
            .write()
            .insert(capability.to_ascii_lowercase(), allowed);
    }
}

impl PermissionStore for PermissionSet {
    fn is_allowed(&self, capability: &str) -> bool {
        self.entries
            .read()
            .get(&capability.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_allow)
    }
}
