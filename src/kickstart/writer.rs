//! Ordered kickstart output for modules.
//!
//! Modules regenerate their part of the kickstart command by command. Each
//! command has a write priority; lower priorities are written first and
//! commands of equal priority keep the order they were added in.

use std::fmt::Write as _;

/// Write priority of commands that do not care.
pub const DEFAULT_WRITE_PRIORITY: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: u32,
    order: usize,
    text: String,
}

#[derive(Debug, Clone, Default)]
pub struct KickstartWriter {
    entries: Vec<Entry>,
}

impl KickstartWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command or a whole section.
    pub fn add(&mut self, priority: u32, text: impl Into<String>) -> &mut Self {
        let order = self.entries.len();
        self.entries.push(Entry {
            priority,
            order,
            text: text.into(),
        });
        self
    }

    pub fn add_command(&mut self, text: impl Into<String>) -> &mut Self {
        self.add(DEFAULT_WRITE_PRIORITY, text)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry on its own line, ordered by `(priority, order)`.
    pub fn render(&self) -> String {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by_key(|entry| (entry.priority, entry.order));

        let mut output = String::new();
        for entry in entries {
            let text = entry.text.trim_end_matches('\n');
            if text.is_empty() {
                continue;
            }
            let _ = writeln!(output, "{}", text);
        }
        output
    }
}
