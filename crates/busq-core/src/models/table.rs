use serde::{Deserialize, Serialize};

/// Which kind of queue a table backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFlavor {
    /// Dispatch as soon as possible.
    Bus,
    /// Dispatch once `effective_date` has passed.
    Notification,
}

/// Main table plus its history table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueTable {
    pub table_name: String,
    pub history_table_name: String,
    pub flavor: QueueFlavor,
}

impl QueueTable {
    pub fn new(table_name: &str, history_table_name: &str, flavor: QueueFlavor) -> Self {
        Self {
            table_name: table_name.to_string(),
            history_table_name: history_table_name.to_string(),
            flavor,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.flavor == QueueFlavor::Notification
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
