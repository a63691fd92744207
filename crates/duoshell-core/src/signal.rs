use duoshell_types::TerminalError;

/// Control signal deliverable to a session's running command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl-C
    Interrupt,
    /// Ctrl-D
    Terminate,
    /// Ctrl-Z
    Suspend,
}

impl Signal {
    /// Control byte written to the channel
    pub fn byte(&self) -> u8 {
        match self {
            Signal::Interrupt => 0x03,
            Signal::Terminate => 0x04,
            Signal::Suspend => 0x1a,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "interrupt",
            Signal::Terminate => "terminate",
            Signal::Suspend => "suspend",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Signal {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "interrupt" | "sigint" | "int" => Ok(Signal::Interrupt),
            "terminate" | "sigterm" | "quit" | "sigquit" => Ok(Signal::Terminate),
            "suspend" | "sigtstp" | "tstp" => Ok(Signal::Suspend),
            _ => Err(TerminalError::UnsupportedSignal(s.to_string())),
        }
    }
}
