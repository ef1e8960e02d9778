//! Command-phase opcodes sent by clients.

use derive_more::Display;

/// Opcode carried in the first payload byte of a client command.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Command {
    #[display("COM_QUIT")]
    Quit,
    #[display("COM_INIT_DB")]
    InitDb,
    #[display("COM_QUERY")]
    Query,
    #[display("COM_FIELD_LIST")]
    FieldList,
    #[display("COM_REFRESH")]
    Refresh,
    #[display("COM_STATISTICS")]
    Statistics,
    #[display("COM_PROCESS_INFO")]
    ProcessInfo,
    #[display("COM_PROCESS_KILL")]
    ProcessKill,
    #[display("COM_DEBUG")]
    Debug,
    #[display("COM_PING")]
    Ping,
    #[display("COM_CHANGE_USER")]
    ChangeUser,
    #[display("COM_STMT_PREPARE")]
    StmtPrepare,
    #[display("COM_STMT_EXECUTE")]
    StmtExecute,
    #[display("COM_STMT_SEND_LONG_DATA")]
    StmtSendLongData,
    #[display("COM_STMT_CLOSE")]
    StmtClose,
    #[display("COM_STMT_RESET")]
    StmtReset,
    #[display("COM_SET_OPTION")]
    SetOption,
    #[display("COM_STMT_FETCH")]
    StmtFetch,
    #[display("COM_RESET_CONNECTION")]
    ResetConnection,
    /// Any opcode this proxy has no dedicated handling for.
    #[display("COM_UNKNOWN({_0:#04x})")]
    Other(u8),
}

impl Command {
    pub const QUIT: u8 = 0x01;
    pub const INIT_DB: u8 = 0x02;
    pub const QUERY: u8 = 0x03;
    pub const FIELD_LIST: u8 = 0x04;
    pub const REFRESH: u8 = 0x07;
    pub const STATISTICS: u8 = 0x08;
    pub const PROCESS_INFO: u8 = 0x0a;
    pub const PROCESS_KILL: u8 = 0x0c;
    pub const DEBUG: u8 = 0x0d;
    pub const PING: u8 = 0x0e;
    pub const CHANGE_USER: u8 = 0x11;
    pub const STMT_PREPARE: u8 = 0x16;
    pub const STMT_EXECUTE: u8 = 0x17;
    pub const STMT_SEND_LONG_DATA: u8 = 0x18;
    pub const STMT_CLOSE: u8 = 0x19;
    pub const STMT_RESET: u8 = 0x1a;
    pub const SET_OPTION: u8 = 0x1b;
    pub const STMT_FETCH: u8 = 0x1c;
    pub const RESET_CONNECTION: u8 = 0x1f;

    /// Raw opcode byte.
    #[must_use]
    pub fn opcode(self) -> u8 {
        match self {
            Self::Quit => Self::QUIT,
            Self::InitDb => Self::INIT_DB,
            Self::Query => Self::QUERY,
            Self::FieldList => Self::FIELD_LIST,
            Self::Refresh => Self::REFRESH,
            Self::Statistics => Self::STATISTICS,
            Self::ProcessInfo => Self::PROCESS_INFO,
            Self::ProcessKill => Self::PROCESS_KILL,
            Self::Debug => Self::DEBUG,
            Self::Ping => Self::PING,
            Self::ChangeUser => Self::CHANGE_USER,
            Self::StmtPrepare => Self::STMT_PREPARE,
            Self::StmtExecute => Self::STMT_EXECUTE,
            Self::StmtSendLongData => Self::STMT_SEND_LONG_DATA,
            Self::StmtClose => Self::STMT_CLOSE,
            Self::StmtReset => Self::STMT_RESET,
            Self::SetOption => Self::SET_OPTION,
            Self::StmtFetch => Self::STMT_FETCH,
            Self::ResetConnection => Self::RESET_CONNECTION,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            Self::QUIT => Self::Quit,
            Self::INIT_DB => Self::InitDb,
            Self::QUERY => Self::Query,
            Self::FIELD_LIST => Self::FieldList,
            Self::REFRESH => Self::Refresh,
            Self::STATISTICS => Self::Statistics,
            Self::PROCESS_INFO => Self::ProcessInfo,
            Self::PROCESS_KILL => Self::ProcessKill,
            Self::DEBUG => Self::Debug,
            Self::PING => Self::Ping,
            Self::CHANGE_USER => Self::ChangeUser,
            Self::STMT_PREPARE => Self::StmtPrepare,
            Self::STMT_EXECUTE => Self::StmtExecute,
            Self::STMT_SEND_LONG_DATA => Self::StmtSendLongData,
            Self::STMT_CLOSE => Self::StmtClose,
            Self::STMT_RESET => Self::StmtReset,
            Self::SET_OPTION => Self::SetOption,
            Self::STMT_FETCH => Self::StmtFetch,
            Self::RESET_CONNECTION => Self::ResetConnection,
            other => Self::Other(other),
        }
    }
}
