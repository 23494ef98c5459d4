//! The well-known message-type registry (§6). Numeric type -> name, used
//! for logging unhandled types and for the handler-table keys used
//! throughout [`crate::exec_env`] and [`crate::worker`].

/// Numeric message-type constants, matching the §6 table exactly.
pub mod raw {
    pub const STDIN: u16 = 0;
    pub const STDOUT: u16 = 1;
    pub const STDERR: u16 = 2;
    pub const EXCEPT: u16 = 10;
    pub const NEED_STDIN: u16 = 90;
    pub const DONE: u16 = 99;
    pub const NO: u16 = 100;
    pub const YES: u16 = 101;
    pub const INTERRUPT: u16 = 110;
    pub const SHUTDOWN: u16 = 111;
    pub const EXEC_CELL: u16 = 120;
    pub const IS_COMPUTING: u16 = 130;
    pub const GET_COMPLETIONS: u16 = 140;
    pub const COMPLETIONS: u16 = 141;
    pub const GET_DOC: u16 = 142;
    pub const DOC: u16 = 143;
    pub const GET_SOURCE: u16 = 144;
    pub const SOURCE: u16 = 145;
}

/// A well-known message type, or an application-defined one the decoder
/// doesn't recognize (§4.2: unknown types are a non-fatal data condition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Stdin,
    Stdout,
    Stderr,
    Except,
    NeedStdin,
    Done,
    No,
    Yes,
    Interrupt,
    Shutdown,
    ExecCell,
    IsComputing,
    GetCompletions,
    Completions,
    GetDoc,
    Doc,
    GetSource,
    Source,
    Unknown(u16),
}

impl MessageType {
    pub fn from_raw(raw: u16) -> Self {
        use raw::*;
        match raw {
            STDIN => Self::Stdin,
            STDOUT => Self::Stdout,
            STDERR => Self::Stderr,
            EXCEPT => Self::Except,
            NEED_STDIN => Self::NeedStdin,
            DONE => Self::Done,
            NO => Self::No,
            YES => Self::Yes,
            INTERRUPT => Self::Interrupt,
            SHUTDOWN => Self::Shutdown,
            EXEC_CELL => Self::ExecCell,
            IS_COMPUTING => Self::IsComputing,
            GET_COMPLETIONS => Self::GetCompletions,
            COMPLETIONS => Self::Completions,
            GET_DOC => Self::GetDoc,
            DOC => Self::Doc,
            GET_SOURCE => Self::GetSource,
            SOURCE => Self::Source,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        use raw::*;
        match self {
            Self::Stdin => STDIN,
            Self::Stdout => STDOUT,
            Self::Stderr => STDERR,
            Self::Except => EXCEPT,
            Self::NeedStdin => NEED_STDIN,
            Self::Done => DONE,
            Self::No => NO,
            Self::Yes => YES,
            Self::Interrupt => INTERRUPT,
            Self::Shutdown => SHUTDOWN,
            Self::ExecCell => EXEC_CELL,
            Self::IsComputing => IS_COMPUTING,
            Self::GetCompletions => GET_COMPLETIONS,
            Self::Completions => COMPLETIONS,
            Self::GetDoc => GET_DOC,
            Self::Doc => DOC,
            Self::GetSource => GET_SOURCE,
            Self::Source => SOURCE,
            Self::Unknown(raw) => raw,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "Unknown({raw})"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<u16> for MessageType {
    fn from(raw: u16) -> Self {
        Self::from_raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_well_known_types() {
        for raw in [
            raw::STDIN,
            raw::STDOUT,
            raw::STDERR,
            raw::EXCEPT,
            raw::NEED_STDIN,
            raw::DONE,
            raw::NO,
            raw::YES,
            raw::INTERRUPT,
            raw::SHUTDOWN,
            raw::EXEC_CELL,
            raw::IS_COMPUTING,
            raw::GET_COMPLETIONS,
            raw::COMPLETIONS,
            raw::GET_DOC,
            raw::DOC,
            raw::GET_SOURCE,
            raw::SOURCE,
        ] {
            assert_eq!(MessageType::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn unknown_type_round_trips() {
        let mt = MessageType::from_raw(9999);
        assert_eq!(mt, MessageType::Unknown(9999));
        assert_eq!(mt.raw(), 9999);
    }
}
