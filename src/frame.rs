//! Bridge framing
//!
//! Host to device, every USB transfer carries one frame:
//!
//! ```text
//! [channel] [opcode] [arg len] [args: 0..=5] [payload ...]
//! ```
//!
//! Device to host, replies reuse the layout, with a reply code in place of
//! the opcode and a single argument holding the channel's sticky status:
//!
//! ```text
//! [channel] [reply code] [1] [status] [payload ...]
//! ```
//!
//! A frame ends with the USB transfer that carries it, which is a short
//! packet or a zero length packet.

use bitflags::bitflags;

/// Bytes in a command or reply buffer, not counting the channel byte
pub const BRIDGE_BUF_SIZE: usize = 256;
/// Maximum number of arguments in a command frame
pub const BRIDGE_ARG_SIZE: usize = 5;
/// Number of routable channels
pub const BRIDGE_NUM_CHAN: usize = 3;
/// Size of a reply header
pub const REPLY_HEADER: usize = 4;
/// Largest payload that fits behind a reply header
pub const REPLY_PAYLOAD: usize = BRIDGE_BUF_SIZE - REPLY_HEADER;

/// A logical bridge channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelId {
    /// Host control channel
    Control = 0,
    PortA = 1,
    PortB = 2,
}

/// Channel id to channel
///
/// The fourth slot is reserved. Frames that name it are rejected like any
/// other unknown id.
const CHANNELS: [Option<ChannelId>; 4] = [
    Some(ChannelId::Control),
    Some(ChannelId::PortA),
    Some(ChannelId::PortB),
    None,
];

impl ChannelId {
    /// Look up a channel by its wire id
    pub fn from_id(id: u8) -> Option<Self> {
        CHANNELS.get(id as usize).copied().flatten()
    }

    /// Returns the wire id
    pub fn id(self) -> u8 {
        self as u8
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Port commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Nop = 0,
    Flush = 1,
    Echo = 2,
    GpioIn = 3,
    GpioHigh = 4,
    GpioLow = 5,
    GpioCfg = 6,
    GpioInt = 8,
    EnableSpi = 10,
    DisableSpi = 11,
    EnableI2c = 12,
    DisableI2c = 13,
    EnableUart = 14,
    DisableUart = 15,
    Tx = 16,
    Rx = 17,
    TxRx = 18,
    Start = 19,
    Stop = 20,
    GpioToggle = 21,
}

impl TryFrom<u8> for Command {
    type Error = u8;
    fn try_from(opcode: u8) -> Result<Self, Self::Error> {
        Ok(match opcode {
            0 => Command::Nop,
            1 => Command::Flush,
            2 => Command::Echo,
            3 => Command::GpioIn,
            4 => Command::GpioHigh,
            5 => Command::GpioLow,
            6 => Command::GpioCfg,
            8 => Command::GpioInt,
            10 => Command::EnableSpi,
            11 => Command::DisableSpi,
            12 => Command::EnableI2c,
            13 => Command::DisableI2c,
            14 => Command::EnableUart,
            15 => Command::DisableUart,
            16 => Command::Tx,
            17 => Command::Rx,
            18 => Command::TxRx,
            19 => Command::Start,
            20 => Command::Stop,
            21 => Command::GpioToggle,
            _ => return Err(opcode),
        })
    }
}

impl Command {
    /// The fewest arguments the command accepts
    ///
    /// Extra arguments are ignored.
    pub fn min_args(self) -> usize {
        match self {
            Command::GpioIn
            | Command::GpioHigh
            | Command::GpioLow
            | Command::GpioToggle
            | Command::Rx
            | Command::Start
            | Command::EnableI2c => 1,
            Command::GpioCfg | Command::GpioInt | Command::EnableSpi | Command::EnableUart => 2,
            _ => 0,
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    High,
    Low,
    Data,
    Error,
    /// Unsolicited UART bytes
    UartData,
    /// Unsolicited pin interrupt, carrying the pin number
    PinChange(u8),
}

impl Reply {
    pub fn code(self) -> u8 {
        match self {
            Reply::Ack => 0x80,
            Reply::Nack => 0x81,
            Reply::High => 0x82,
            Reply::Low => 0x83,
            Reply::Data => 0x84,
            Reply::Error => 0x85,
            Reply::UartData => 0xA0,
            Reply::PinChange(pin) => 0xC0 | (pin & 0x1F),
        }
    }
}

bitflags! {
    /// Sticky conditions, reported (then cleared) in the next reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status : u8 {
        /// Bytes were dropped: UART ring or command buffer full
        const OVERFLOW = 1 << 0;
        /// A malformed frame was received
        const FRAMING = 1 << 1;
        /// A DMA transfer failed, and the port was restarted
        const DMA_FAULT = 1 << 2;
    }
}

/// Write a reply header for `payload` bytes already placed behind it
///
/// Returns the length of the whole reply.
pub fn write_reply_header(
    buf: &mut [u8],
    chan: ChannelId,
    reply: Reply,
    status: Status,
    payload: usize,
) -> usize {
    buf[0] = chan.id();
    buf[1] = reply.code();
    buf[2] = 1;
    buf[3] = status.bits();
    REPLY_HEADER + payload
}

/// A command frame, parsed in one go
#[derive(Debug, PartialEq, Eq)]
pub struct Parsed<'a> {
    pub opcode: u8,
    pub args: &'a [u8],
    pub payload: &'a [u8],
}

/// Why a frame couldn't be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Ended before the opcode, arg length and args were complete
    Truncated,
    /// Declared more than [`BRIDGE_ARG_SIZE`] arguments
    TooManyArgs(u8),
}

/// Parse a complete frame that's had its channel byte removed
pub fn parse(frame: &[u8]) -> Result<Parsed<'_>, FrameError> {
    let [opcode, arg_len, rest @ ..] = frame else {
        return Err(FrameError::Truncated);
    };
    let arg_len = *arg_len;
    if arg_len as usize > BRIDGE_ARG_SIZE {
        return Err(FrameError::TooManyArgs(arg_len));
    }
    if rest.len() < arg_len as usize {
        return Err(FrameError::Truncated);
    }
    let (args, payload) = rest.split_at(arg_len as usize);
    Ok(Parsed {
        opcode: *opcode,
        args,
        payload,
    })
}
