//! Escape-sequence recogniser for console input.
//!
//! An escape byte typed right after CR or LF starts a command; the byte after
//! it selects the command. Unknown selectors are sent as data together with
//! the escape byte, so the escape character can still be typed literally.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeCommand {
    Disconnect,
    Help,
    Break,
    Reset,
}

impl EscapeCommand {
    fn from_selector(b: u8) -> Option<Self> {
        match b {
            b'.' => Some(EscapeCommand::Disconnect),
            b'?' => Some(EscapeCommand::Help),
            b'#' => Some(EscapeCommand::Break),
            b'r' | b'R' => Some(EscapeCommand::Reset),
            _ => None,
        }
    }
}

fn is_line_end(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

#[derive(Debug, Clone)]
pub struct EscapeFilter {
    escape: u8,
    /// The last two raw bytes, oldest first.
    history: [u8; 2],
}

impl EscapeFilter {
    /// Starts as if a line had just ended, so an escape works as the very
    /// first input.
    pub fn new(escape: u8) -> Self {
        Self {
            escape,
            history: [b'\r', b'\r'],
        }
    }

    pub fn escape(&self) -> u8 {
        self.escape
    }

    /// Feed one raw byte. Data to forward is appended to `data`; a
    /// recognised command is returned instead.
    pub fn filter(&mut self, b: u8, data: &mut Vec<u8>) -> Option<EscapeCommand> {
        let mut command = None;
        if is_line_end(self.history[0]) && self.history[1] == self.escape {
            command = EscapeCommand::from_selector(b);
            if command.is_none() {
                data.push(self.escape);
                data.push(b);
            }
        } else if b != self.escape || !is_line_end(self.history[1]) {
            data.push(b);
        }
        self.history = [self.history[1], b];
        command
    }

    /// Help lines for the current escape byte.
    pub fn help(&self) -> String {
        let e = self.escape as char;
        format!(
            "{e} .  disconnect\r\n{e} ?  help\r\n{e} #  send break\r\n{e} r  send reset to node H8\r\n"
        )
    }
}
