//! Message rendering for the subscribe command.

use std::io::{self, Write};

use crossterm::style::Stylize;
use pong_bus::{Message, MessageError};

/// Writes received messages to stdout, one canonical JSON object per line.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    color: bool,
}

impl Printer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    /// Render a message as a single output line without the newline.
    pub fn render(&self, message: &Message) -> Result<String, MessageError> {
        let json = String::from_utf8_lossy(&message.to_json()?).into_owned();
        if self.color {
            Ok(json.green().to_string())
        } else {
            Ok(json)
        }
    }

    pub fn print(&self, message: &Message) -> io::Result<()> {
        let line = self
            .render(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()
    }
}
