//! Registered storage actions
//!
//! Every mutation a handler asks of the engine is recorded as one `StorageAction`
//! in registration order. The `ActionLog` is what a real installer would later
//! execute; here it is also the observable output of a planning run.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::DeviceId;

// ============================================================================
// Action Types
// ============================================================================

/// A single atomic action registered with the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StorageAction {
    /// Schedule creation of a new device
    CreateDevice { device: DeviceId, name: String, kind: String },

    /// Remove a device (and, implicitly, its format)
    DestroyDevice { device: DeviceId, name: String },

    /// Change the size of a device's container
    ResizeDevice { device: DeviceId, name: String, size_mib: u64 },

    /// Write a new format (filesystem, signature, LUKS header)
    CreateFormat { device: DeviceId, name: String, format: String },

    /// Wipe the existing format of a device
    DestroyFormat { device: DeviceId, name: String, format: String },

    /// Change the size of the format's contents
    ResizeFormat { device: DeviceId, name: String, size_mib: u64 },
}

impl StorageAction {
    pub fn device(&self) -> DeviceId {
        match self {
            Self::CreateDevice { device, .. }
            | Self::DestroyDevice { device, .. }
            | Self::ResizeDevice { device, .. }
            | Self::CreateFormat { device, .. }
            | Self::DestroyFormat { device, .. }
            | Self::ResizeFormat { device, .. } => *device,
        }
    }

    /// Returns true for actions that lose data already on disk
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::DestroyDevice { .. } | Self::DestroyFormat { .. } | Self::CreateFormat { .. }
        )
    }

    pub fn is_resize(&self) -> bool {
        matches!(self, Self::ResizeDevice { .. } | Self::ResizeFormat { .. })
    }
}

impl fmt::Display for StorageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDevice { name, kind, .. } => write!(f, "CreateDevice({}, {})", name, kind),
            Self::DestroyDevice { name, .. } => write!(f, "DestroyDevice({})", name),
            Self::ResizeDevice { name, size_mib, .. } => {
                write!(f, "ResizeDevice({}, {} MiB)", name, size_mib)
            }
            Self::CreateFormat { name, format, .. } => {
                write!(f, "CreateFormat({}, {})", name, format)
            }
            Self::DestroyFormat { name, format, .. } => {
                write!(f, "DestroyFormat({}, {})", name, format)
            }
            Self::ResizeFormat { name, size_mib, .. } => {
                write!(f, "ResizeFormat({}, {} MiB)", name, size_mib)
            }
        }
    }
}

/// Ordered list of registered actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    actions: Vec<StorageAction>,
}

impl ActionLog {
    pub fn push(&mut self, action: StorageAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[StorageAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions registered for one device, in order.
    pub fn for_device(&self, id: DeviceId) -> Vec<&StorageAction> {
        self.actions.iter().filter(|a| a.device() == id).collect()
    }

    /// Drop every pending action of a device that is being cancelled before creation.
    pub fn cancel_device(&mut self, id: DeviceId) {
        self.actions.retain(|a| a.device() != id);
    }

    /// Drop pending format actions of a device whose planned format is replaced.
    pub fn cancel_format(&mut self, id: DeviceId) {
        self.actions
            .retain(|a| !(a.device() == id && matches!(a, StorageAction::CreateFormat { .. })));
    }

    /// Returns true if executing the log would destroy existing data.
    pub fn is_destructive(&self) -> bool {
        self.actions.iter().any(StorageAction::is_destructive)
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Storage actions ({}):", self.actions.len())];
        for (i, action) in self.actions.iter().enumerate() {
            lines.push(format!("    {}. {}", i + 1, action));
        }
        lines.join("\n")
    }
}
