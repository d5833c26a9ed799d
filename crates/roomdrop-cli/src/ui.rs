//! UI utilities for Roomdrop CLI.

const BOX_WIDTH: usize = 33;

/// A formatted box for displaying room ids.
pub struct RoomBox<'a> {
    room: &'a str,
    receivers: Option<usize>,
}

impl<'a> RoomBox<'a> {
    /// Create a new room box.
    #[must_use]
    pub const fn new(room: &'a str) -> Self {
        Self {
            room,
            receivers: None,
        }
    }

    /// Show how many receivers the sender waits for.
    #[must_use]
    pub const fn with_receivers(mut self, receivers: usize) -> Self {
        self.receivers = Some(receivers);
        self
    }

    /// Display the room box to stdout.
    pub fn display(&self) {
        let room_line = format!("Room:  {}", format_code_spaced(self.room));

        println!("  ┌{}┐", "─".repeat(BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));
        println!("  │{}│", center_in_box(&room_line, BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));

        if let Some(receivers) = self.receivers {
            let line = if receivers == 1 {
                "Waiting for 1 receiver".to_string()
            } else {
                format!("Waiting for {} receivers", receivers)
            };
            println!("  │{}│", center_in_box(&line, BOX_WIDTH));
            println!("  │{}│", " ".repeat(BOX_WIDTH));
        }

        println!("  └{}┘", "─".repeat(BOX_WIDTH));
    }
}

fn format_code_spaced(code: &str) -> String {
    code.chars()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn center_in_box(content: &str, width: usize) -> String {
    let content_len = content.chars().count();
    let padding = width.saturating_sub(content_len);
    let left = padding / 2;
    let right = padding - left;
    format!("{}{}{}", " ".repeat(left), content, " ".repeat(right))
}

pub use roomdrop_core::config::parse_duration;

/// Format a byte count with a binary unit, e.g. "1.5 MB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
