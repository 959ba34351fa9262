//! Error types for the ARINC 429 engine
//!
//! Every failure the engine reports maps onto the board's stable numeric
//! error code space, so a host written against the numeric codes keeps
//! working. Use [`A429Error::code`] to get the numeric value and
//! [`ErrorCode::description`] for the canonical text.

use thiserror::Error;

/// Result type for ARINC 429 engine operations
pub type Result<T> = std::result::Result<T, A429Error>;

/// Errors reported by the engine
///
/// The payload carries operation specific context. The numeric code is
/// stable across releases.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum A429Error {
    /// Unable to access the board
    #[error("Unable to access board: {0}")]
    UnableToAccess(String),

    /// Command acknowledge mismatch
    #[error("Acknowledge error: {0}")]
    Ack(String),

    /// Secondary command acknowledge mismatch
    #[error("Acknowledge error 2: {0}")]
    Ack2(String),

    /// Command not acknowledged
    #[error("Command not acknowledged: {0}")]
    Nak(String),

    /// Host to target communication failed
    #[error("Host to target communication failed: {0}")]
    HostToTarget(String),

    /// Driver handle is not valid
    #[error("Invalid driver handle: {0}")]
    InvalidDriverHandle(String),

    /// Driver I/O control timed out
    #[error("I/O control timeout: {0}")]
    IoctlTimeout(String),

    /// Driver I/O control failed
    #[error("I/O control error: {0}")]
    IoctlError(String),

    /// Operation is not available on this board
    #[error("Function not implemented: {0}")]
    FunctionNotImplemented(String),

    /// Command size is invalid
    #[error("Invalid command size: {0}")]
    CommandSize(String),

    /// Transfer identifier out of range or unknown
    #[error("Invalid transfer id: {0}")]
    XferId(String),

    /// Minor frame identifier out of range or unknown
    #[error("Invalid minor frame id: {0}")]
    MinorFrameId(String),

    /// Board memory exhausted
    #[error("No more memory: {0}")]
    NoMoreMemory(String),

    /// Size argument invalid
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// Board identifier invalid
    #[error("Invalid board: {0}")]
    InvalidBoard(String),

    /// Pollution block identifier invalid
    #[error("Invalid pollution block id: {0}")]
    InvalidPollutionBlockId(String),

    /// SDI value used while SDI sorting is disabled
    #[error("SDI not enabled: {0}")]
    SdiNotEnabled(String),

    /// Channel identifier invalid or capability mismatch
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Mode argument invalid
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// Required data missing
    #[error("Missing data: {0}")]
    NullPointer(String),

    /// Identifier invalid
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Remote server failure
    #[error("Server error: {0}")]
    Server(String),

    /// Module handle invalid
    #[error("Invalid module handle: {0}")]
    InvalidModuleHandle(String),

    /// Module identifier invalid
    #[error("Invalid module id: {0}")]
    InvalidModuleId(String),

    /// Monitor library failure
    #[error("Monitor library error: {0}")]
    MyMon(String),

    /// Parameter outside the accepted range
    #[error("Parameter out of range: {0}")]
    ParameterRange(String),

    /// Dynamic tag buffer size must be exactly one entry
    #[error("Invalid dyntag buffer size: {0}")]
    DyntagSize(String),

    /// Acknowledge size mismatch
    #[error("Acknowledge size mismatch: {0}")]
    AckSize(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Data outside the range of a 24 bit transfer
    #[error("32 bit transfer required: {0}")]
    Transfer32BitRequired(String),

    /// Buffer overflow
    #[error("Buffer overflow: {0}")]
    BufferOverflow(String),

    /// Network command failed
    #[error("Network command failed: {0}")]
    NetCommand(String),

    /// Channel connection not allowed
    #[error("Invalid channel connection: {0}")]
    InvalidChannelConnection(String),

    /// Board firmware too old
    #[error("Firmware too old: {0}")]
    OldFirmware(String),

    /// Requested rate cannot be scheduled
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// Operation needs a halted channel
    #[error("Channel active: {0}")]
    ChannelActive(String),

    /// Channel configuration cannot be changed
    #[error("Channel is fixed: {0}")]
    FixChannel(String),

    /// Operation not valid in the channel's current mode
    #[error("Invalid channel mode: {0}")]
    InvalidChannelMode(String),

    /// Frame invalid
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Target software too old
    #[error("Target software too old: {0}")]
    OldTargetSoftware(String),

    /// Remote server incompatible
    #[error("Server incompatible: {0}")]
    ServerIncompatible(String),

    /// Discrete channel configuration invalid
    #[error("Invalid discrete configuration: {0}")]
    DiscreteConfig(String),
}

impl A429Error {
    /// Create a new NoMoreMemory error
    pub fn no_more_memory(msg: impl Into<String>) -> Self {
        A429Error::NoMoreMemory(msg.into())
    }

    /// Create a new InvalidSize error
    pub fn invalid_size(msg: impl Into<String>) -> Self {
        A429Error::InvalidSize(msg.into())
    }

    /// Create a new InvalidChannel error
    pub fn invalid_channel(msg: impl Into<String>) -> Self {
        A429Error::InvalidChannel(msg.into())
    }

    /// Create a new InvalidChannelMode error
    pub fn invalid_channel_mode(msg: impl Into<String>) -> Self {
        A429Error::InvalidChannelMode(msg.into())
    }

    /// Create a new ChannelActive error
    pub fn channel_active(msg: impl Into<String>) -> Self {
        A429Error::ChannelActive(msg.into())
    }

    /// Create a new ParameterRange error
    pub fn parameter_range(msg: impl Into<String>) -> Self {
        A429Error::ParameterRange(msg.into())
    }

    /// Create a new XferId error
    pub fn xfer_id(msg: impl Into<String>) -> Self {
        A429Error::XferId(msg.into())
    }

    /// Create a new MinorFrameId error
    pub fn minor_frame_id(msg: impl Into<String>) -> Self {
        A429Error::MinorFrameId(msg.into())
    }

    /// Create a new InvalidRate error
    pub fn invalid_rate(msg: impl Into<String>) -> Self {
        A429Error::InvalidRate(msg.into())
    }

    /// Create a new SdiNotEnabled error
    pub fn sdi_not_enabled(msg: impl Into<String>) -> Self {
        A429Error::SdiNotEnabled(msg.into())
    }

    /// Create a new InvalidMode error
    pub fn invalid_mode(msg: impl Into<String>) -> Self {
        A429Error::InvalidMode(msg.into())
    }

    /// Create a new InvalidId error
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        A429Error::InvalidId(msg.into())
    }

    /// Create a new Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        A429Error::Internal(msg.into())
    }

    /// The stable numeric error code
    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    /// The error code category of this error
    pub fn kind(&self) -> ErrorCode {
        use A429Error::*;
        match self {
            UnableToAccess(_) => ErrorCode::UnableToAccess,
            Ack(_) => ErrorCode::Ack,
            Ack2(_) => ErrorCode::Ack2,
            Nak(_) => ErrorCode::Nak,
            HostToTarget(_) => ErrorCode::HostToTarget,
            InvalidDriverHandle(_) => ErrorCode::InvalidDriverHandle,
            IoctlTimeout(_) => ErrorCode::IoctlTimeout,
            IoctlError(_) => ErrorCode::IoctlError,
            FunctionNotImplemented(_) => ErrorCode::FunctionNotImplemented,
            CommandSize(_) => ErrorCode::CommandSize,
            XferId(_) => ErrorCode::XferId,
            MinorFrameId(_) => ErrorCode::MinorFrameId,
            NoMoreMemory(_) => ErrorCode::NoMoreMemory,
            InvalidSize(_) => ErrorCode::InvalidSize,
            InvalidBoard(_) => ErrorCode::InvalidBoard,
            InvalidPollutionBlockId(_) => ErrorCode::InvalidPollutionBlockId,
            SdiNotEnabled(_) => ErrorCode::SdiNotEnabled,
            InvalidChannel(_) => ErrorCode::InvalidChannel,
            InvalidMode(_) => ErrorCode::InvalidMode,
            NullPointer(_) => ErrorCode::NullPointer,
            InvalidId(_) => ErrorCode::InvalidId,
            Server(_) => ErrorCode::Server,
            InvalidModuleHandle(_) => ErrorCode::InvalidModuleHandle,
            InvalidModuleId(_) => ErrorCode::InvalidModuleId,
            MyMon(_) => ErrorCode::MyMon,
            ParameterRange(_) => ErrorCode::ParameterRange,
            DyntagSize(_) => ErrorCode::DyntagSize,
            AckSize(_) => ErrorCode::AckSize,
            Timeout(_) => ErrorCode::Timeout,
            Transfer32BitRequired(_) => ErrorCode::Transfer32BitRequired,
            BufferOverflow(_) => ErrorCode::BufferOverflow,
            NetCommand(_) => ErrorCode::NetCommand,
            InvalidChannelConnection(_) => ErrorCode::InvalidChannelConnection,
            OldFirmware(_) => ErrorCode::OldFirmware,
            InvalidRate(_) => ErrorCode::InvalidRate,
            ChannelActive(_) => ErrorCode::ChannelActive,
            FixChannel(_) => ErrorCode::FixChannel,
            InvalidChannelMode(_) => ErrorCode::InvalidChannelMode,
            InvalidFrame(_) => ErrorCode::InvalidFrame,
            Internal(_) => ErrorCode::Internal,
            OldTargetSoftware(_) => ErrorCode::OldTargetSoftware,
            ServerIncompatible(_) => ErrorCode::ServerIncompatible,
            DiscreteConfig(_) => ErrorCode::DiscreteConfig,
        }
    }
}

/// Numeric error codes shared with board firmware and host tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    None = 0,
    UnableToAccess = 1,
    Ack = 2,
    Ack2 = 3,
    Nak = 4,
    HostToTarget = 5,
    InvalidDriverHandle = 6,
    IoctlTimeout = 7,
    IoctlError = 8,
    FunctionNotImplemented = 9,
    CommandSize = 10,
    XferId = 11,
    MinorFrameId = 12,
    NoMoreMemory = 13,
    InvalidSize = 14,
    InvalidBoard = 15,
    InvalidPollutionBlockId = 16,
    SdiNotEnabled = 17,
    InvalidChannel = 18,
    InvalidMode = 19,
    NullPointer = 20,
    InvalidId = 21,
    Server = 22,
    InvalidModuleHandle = 23,
    InvalidModuleId = 24,
    MyMon = 25,
    ParameterRange = 26,
    DyntagSize = 27,
    AckSize = 28,
    Timeout = 29,
    Transfer32BitRequired = 30,
    BufferOverflow = 31,
    NetCommand = 32,
    InvalidChannelConnection = 33,
    OldFirmware = 34,
    InvalidRate = 35,
    ChannelActive = 36,
    FixChannel = 37,
    InvalidChannelMode = 38,
    InvalidFrame = 39,
    Internal = 40,
    OldTargetSoftware = 41,
    /// Reserved code, never produced
    Reserved = 42,
    ServerIncompatible = 43,
    DiscreteConfig = 44,
    /// Any code outside the known table
    Unknown = -1,
}

impl ErrorCode {
    const ALL: [ErrorCode; 45] = [
        ErrorCode::None,
        ErrorCode::UnableToAccess,
        ErrorCode::Ack,
        ErrorCode::Ack2,
        ErrorCode::Nak,
        ErrorCode::HostToTarget,
        ErrorCode::InvalidDriverHandle,
        ErrorCode::IoctlTimeout,
        ErrorCode::IoctlError,
        ErrorCode::FunctionNotImplemented,
        ErrorCode::CommandSize,
        ErrorCode::XferId,
        ErrorCode::MinorFrameId,
        ErrorCode::NoMoreMemory,
        ErrorCode::InvalidSize,
        ErrorCode::InvalidBoard,
        ErrorCode::InvalidPollutionBlockId,
        ErrorCode::SdiNotEnabled,
        ErrorCode::InvalidChannel,
        ErrorCode::InvalidMode,
        ErrorCode::NullPointer,
        ErrorCode::InvalidId,
        ErrorCode::Server,
        ErrorCode::InvalidModuleHandle,
        ErrorCode::InvalidModuleId,
        ErrorCode::MyMon,
        ErrorCode::ParameterRange,
        ErrorCode::DyntagSize,
        ErrorCode::AckSize,
        ErrorCode::Timeout,
        ErrorCode::Transfer32BitRequired,
        ErrorCode::BufferOverflow,
        ErrorCode::NetCommand,
        ErrorCode::InvalidChannelConnection,
        ErrorCode::OldFirmware,
        ErrorCode::InvalidRate,
        ErrorCode::ChannelActive,
        ErrorCode::FixChannel,
        ErrorCode::InvalidChannelMode,
        ErrorCode::InvalidFrame,
        ErrorCode::Internal,
        ErrorCode::OldTargetSoftware,
        ErrorCode::Reserved,
        ErrorCode::ServerIncompatible,
        ErrorCode::DiscreteConfig,
    ];

    /// Numeric value of the code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a numeric code; anything outside the table is `Unknown`
    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .unwrap_or(ErrorCode::Unknown)
    }

    /// Canonical human readable description
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::None => "No error",
            ErrorCode::UnableToAccess => "Unable to access board",
            ErrorCode::Ack => "Command acknowledge error",
            ErrorCode::Ack2 => "Command acknowledge error 2",
            ErrorCode::Nak => "Command not acknowledged",
            ErrorCode::HostToTarget => "Host to target communication error",
            ErrorCode::InvalidDriverHandle => "Invalid driver handle",
            ErrorCode::IoctlTimeout => "Driver I/O control timeout",
            ErrorCode::IoctlError => "Driver I/O control error",
            ErrorCode::FunctionNotImplemented => "Function not implemented",
            ErrorCode::CommandSize => "Invalid command size",
            ErrorCode::XferId => "Invalid transfer id",
            ErrorCode::MinorFrameId => "Invalid minor frame id",
            ErrorCode::NoMoreMemory => "No more memory available on board",
            ErrorCode::InvalidSize => "Invalid size",
            ErrorCode::InvalidBoard => "Invalid board",
            ErrorCode::InvalidPollutionBlockId => "Invalid pollution block id",
            ErrorCode::SdiNotEnabled => "SDI not enabled",
            ErrorCode::InvalidChannel => "Invalid channel",
            ErrorCode::InvalidMode => "Invalid mode",
            ErrorCode::NullPointer => "Required data missing",
            ErrorCode::InvalidId => "Invalid id",
            ErrorCode::Server => "Server error",
            ErrorCode::InvalidModuleHandle => "Invalid module handle",
            ErrorCode::InvalidModuleId => "Invalid module id",
            ErrorCode::MyMon => "Monitor library error",
            ErrorCode::ParameterRange => "Parameter out of range",
            ErrorCode::DyntagSize => "Dyntag transfers need a buffer size of one",
            ErrorCode::AckSize => "Acknowledge size mismatch",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Transfer32BitRequired => "Buffer is out of range, 32 bit label transfer required",
            ErrorCode::BufferOverflow => "Buffer overflow",
            ErrorCode::NetCommand => "Network command failed",
            ErrorCode::InvalidChannelConnection => "Invalid channel connection",
            ErrorCode::OldFirmware => "Firmware too old",
            ErrorCode::InvalidRate => "Invalid rate",
            ErrorCode::ChannelActive => "Channel is active",
            ErrorCode::FixChannel => "Channel configuration is fixed",
            ErrorCode::InvalidChannelMode => "Invalid channel mode",
            ErrorCode::InvalidFrame => "Invalid frame",
            ErrorCode::Internal => "Internal error",
            ErrorCode::OldTargetSoftware => "Target software too old",
            ErrorCode::Reserved => "Reserved",
            ErrorCode::ServerIncompatible => "Server incompatible",
            ErrorCode::DiscreteConfig => "Invalid discrete configuration",
            ErrorCode::Unknown => "Unknown error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = A429Error::channel_active("channel 3");
        assert!(err.to_string().contains("Channel active"));
        assert_eq!(err.code(), 36);
    }

    #[test]
    fn test_code_table_is_dense() {
        for (idx, code) in ErrorCode::ALL.iter().enumerate() {
            assert_eq!(code.code(), idx as i32);
            assert_eq!(ErrorCode::from_code(idx as i32), *code);
        }
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(ErrorCode::from_code(-7), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_code(45), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_code(9999).description(), "Unknown error");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(A429Error::invalid_rate("x").kind(), ErrorCode::InvalidRate);
        assert_eq!(A429Error::DyntagSize("x".into()).code(), 27);
        assert_eq!(A429Error::sdi_not_enabled("x").code(), 17);
        assert_eq!(ErrorCode::NoMoreMemory.to_string(), "No more memory available on board (13)");
    }
}
