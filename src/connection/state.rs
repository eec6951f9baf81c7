use std::fmt;

/// Lifecycle of a connection.
///
/// The clean path is `Running -> ExitRequested -> Exited`. Any transport
/// failure moves the connection to `Error`, which is absorbing. There is no
/// way back to `Running`: an exited or failed connection must be closed and
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Messages flow in both directions.
    Running,
    /// One side asked to stop. No new work is accepted.
    ExitRequested,
    /// The engine stopped after a clean exit.
    Exited,
    /// A transport failure ended the engine.
    Error,
}

impl ConnectionState {
    /// Value carried in the tag field of every frame.
    pub const fn wire_tag(self) -> u32 {
        match self {
            ConnectionState::Running => 1,
            ConnectionState::ExitRequested => 2,
            ConnectionState::Exited => 4,
            ConnectionState::Error => 8,
        }
    }

    pub fn from_wire_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(ConnectionState::Running),
            2 => Some(ConnectionState::ExitRequested),
            4 => Some(ConnectionState::Exited),
            8 => Some(ConnectionState::Error),
            _ => None,
        }
    }

    /// True only for `Running`.
    pub fn accepts_work(self) -> bool {
        self == ConnectionState::Running
    }

    /// True once the engine can no longer produce messages.
    pub fn is_finished(self) -> bool {
        matches!(self, ConnectionState::Exited | ConnectionState::Error)
    }

    fn rank(self) -> u8 {
        match self {
            ConnectionState::Running => 0,
            ConnectionState::ExitRequested => 1,
            ConnectionState::Exited => 2,
            ConnectionState::Error => 3,
        }
    }

    // Requests never move a connection backwards and never leave Error.
    pub(crate) fn advance(self, requested: ConnectionState) -> ConnectionState {
        if requested.rank() > self.rank() {
            requested
        } else {
            self
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Running => "RUNNING",
            ConnectionState::ExitRequested => "EXIT_REQUESTED",
            ConnectionState::Exited => "EXITED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Whether the sender/receiver thread pair is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Stopped,
    Started,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => f.write_str("STOPPED"),
            EngineState::Started => f.write_str("STARTED"),
        }
    }
}

// Both states live behind one mutex so a reader never sees a torn pair.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatePair {
    pub(crate) connection: ConnectionState,
    pub(crate) engine: EngineState,
}

impl Default for StatePair {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Running,
            engine: EngineState::Stopped,
        }
    }
}
