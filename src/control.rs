//! Host control channel
//!
//! Channel 0 talks to the bridge itself. It uses the port frame format,
//! with its own opcodes. Requests that reach beyond the channel, like
//! resetting a port, are handed to the runtime as a [`Request`].
//!
//! The control channel also reports frames that named an unknown channel,
//! with an `ERROR` reply carrying the bad id.

use crate::{
    bridge::{Chunk, Inbound},
    frame::{
        self, write_reply_header, ChannelId, Reply, Status, BRIDGE_BUF_SIZE, REPLY_HEADER,
        REPLY_PAYLOAD,
    },
};

/// Control channel opcodes
pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const ECHO: u8 = 0x02;
    /// Disable, then enable, a port. Argument: the port's channel id.
    pub const PORT_RESET: u8 = 0x30;
    /// `DATA [state, mode, status, buffered UART bytes]`. Argument: the
    /// port's channel id.
    pub const PORT_STATUS: u8 = 0x31;
    /// Hand the pipe to the flash programmer, once the `ACK` is sent
    pub const ENTER_FLASH: u8 = 0x32;
    /// Enable a closed port. Argument: the port's channel id.
    pub const PORT_OPEN: u8 = 0x33;
    /// Disable a port; it stays silent until opened. Argument: the port's
    /// channel id.
    pub const PORT_CLOSE: u8 = 0x34;
}

/// Work the runtime does for the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Reset the port, then [`ack`](Control::ack)
    PortReset(ChannelId),
    /// Collect the port's status, then [`port_status`](Control::port_status)
    PortStatus(ChannelId),
    /// Enable the port if it's closed, then [`ack`](Control::ack)
    PortOpen(ChannelId),
    /// Disable the port, then [`ack`](Control::ack)
    PortClose(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Reply(Reply),
    Echo { start: usize },
    Status([u8; 4]),
}

/// The host control channel
pub struct Control {
    cmd_buf: [u8; BRIDGE_BUF_SIZE],
    cmd_len: usize,
    frame_done: bool,
    reply_buf: [u8; BRIDGE_BUF_SIZE],
    reply_len: usize,
    status: Status,
    outcome: Option<Outcome>,
    /// Waiting on the runtime
    request: Option<Request>,
    /// An unknown channel id to report
    rejected: Option<u8>,
    pending_in: bool,
    pending_out: bool,
    command_reply: bool,
    enter_flash: bool,
}

impl Control {
    pub const fn new() -> Self {
        Control {
            cmd_buf: [0; BRIDGE_BUF_SIZE],
            cmd_len: 0,
            frame_done: false,
            reply_buf: [0; BRIDGE_BUF_SIZE],
            reply_len: 0,
            status: Status::empty(),
            outcome: None,
            request: None,
            rejected: None,
            pending_in: false,
            pending_out: false,
            command_reply: false,
            enter_flash: false,
        }
    }

    /// Forget everything, as if just constructed
    pub fn reset(&mut self) {
        *self = Control::new();
    }

    pub fn pending_in(&self) -> bool {
        self.pending_in
    }

    pub fn pending_out(&self) -> bool {
        self.pending_out
    }

    /// Where the next chunk of a control frame should land
    ///
    /// The buffer is inside the control channel, so the channel must stay
    /// put while the bridge holds it.
    pub fn poll_inbound(&mut self) -> Option<Inbound> {
        if self.pending_in || self.frame_done {
            return None;
        }
        self.pending_in = true;
        let ptr = self.cmd_buf.as_mut_ptr().wrapping_add(self.cmd_len);
        Some(Inbound::new(ptr, BRIDGE_BUF_SIZE - self.cmd_len))
    }

    /// A chunk of a control frame arrived
    pub fn bridge_out_completion(&mut self, chunk: Chunk) -> Option<Request> {
        self.pending_in = false;
        self.cmd_len = (self.cmd_len + chunk.len).min(BRIDGE_BUF_SIZE);
        if chunk.dropped > 0 {
            self.status |= Status::OVERFLOW;
        }
        if !chunk.last {
            return None;
        }
        self.frame_done = true;

        let parsed = match frame::parse(&self.cmd_buf[..self.cmd_len]) {
            Ok(parsed) => parsed,
            Err(_err) => {
                warn!("Control frame rejected: {:?}", _err);
                return self.fail(Status::FRAMING);
            }
        };
        let port = parsed.args.first().copied().and_then(ChannelId::from_id);
        let port = port.filter(|&port| port != ChannelId::Control);
        let outcome = match (parsed.opcode, port) {
            (opcode::NOP, _) => Outcome::Reply(Reply::Ack),
            (opcode::ECHO, _) => Outcome::Echo {
                start: 2 + parsed.args.len(),
            },
            (opcode::PORT_RESET, Some(port)) => return self.request(Request::PortReset(port)),
            (opcode::PORT_STATUS, Some(port)) => return self.request(Request::PortStatus(port)),
            (opcode::PORT_OPEN, Some(port)) => return self.request(Request::PortOpen(port)),
            (opcode::PORT_CLOSE, Some(port)) => return self.request(Request::PortClose(port)),
            (opcode::ENTER_FLASH, _) => {
                self.enter_flash = true;
                Outcome::Reply(Reply::Ack)
            }
            (
                opcode::PORT_RESET | opcode::PORT_STATUS | opcode::PORT_OPEN | opcode::PORT_CLOSE,
                None,
            ) => Outcome::Reply(Reply::Error),
            (_op, _) => {
                warn!("Control opcode {} unknown", _op);
                return self.fail(Status::FRAMING);
            }
        };
        self.outcome = Some(outcome);
        None
    }

    fn request(&mut self, request: Request) -> Option<Request> {
        self.request = Some(request);
        self.request
    }

    fn fail(&mut self, status: Status) -> Option<Request> {
        self.status |= status;
        self.outcome = Some(Outcome::Reply(Reply::Error));
        None
    }

    /// Flag `status` in the next reply
    pub fn raise(&mut self, status: Status) {
        self.status |= status;
    }

    /// The runtime finished a [`Request::PortReset`], [`Request::PortOpen`]
    /// or [`Request::PortClose`]
    pub fn ack(&mut self) {
        if self.request.take().is_some() {
            self.outcome = Some(Outcome::Reply(Reply::Ack));
        }
    }

    /// The runtime collected a port's status for [`Request::PortStatus`]
    pub fn port_status(&mut self, status: [u8; 4]) {
        if self.request.take().is_some() {
            self.outcome = Some(Outcome::Status(status));
        }
    }

    /// Report a frame for an unknown channel id
    pub fn reject_channel(&mut self, id: u8) {
        if let Some(_previous) = self.rejected.replace(id) {
            warn!("Control dropped a rejection for channel {}", _previous);
        }
    }

    /// Build the next reply, if there's one to send
    ///
    /// The bytes are in [`reply`](Control::reply) until
    /// [`bridge_in_completion`](Control::bridge_in_completion).
    pub fn poll_outbound(&mut self) -> Option<usize> {
        if self.pending_out {
            return None;
        }
        let len = if let (true, Some(outcome)) = (self.frame_done, self.outcome) {
            self.command_reply = true;
            match outcome {
                Outcome::Reply(reply) => self.header(reply, 0),
                Outcome::Echo { start } => {
                    let len = (self.cmd_len - start).min(REPLY_PAYLOAD);
                    self.reply_buf[REPLY_HEADER..][..len]
                        .copy_from_slice(&self.cmd_buf[start..start + len]);
                    self.header(Reply::Data, len)
                }
                Outcome::Status(status) => {
                    self.reply_buf[REPLY_HEADER..][..status.len()].copy_from_slice(&status);
                    self.header(Reply::Data, status.len())
                }
            }
        } else if let Some(id) = self.rejected.take() {
            self.reply_buf[REPLY_HEADER] = id;
            self.status |= Status::FRAMING;
            self.header(Reply::Error, 1)
        } else {
            return None;
        };
        self.reply_len = len;
        self.pending_out = true;
        Some(len)
    }

    fn header(&mut self, reply: Reply, payload: usize) -> usize {
        let status = core::mem::replace(&mut self.status, Status::empty());
        write_reply_header(
            &mut self.reply_buf,
            ChannelId::Control,
            reply,
            status,
            payload,
        )
    }

    pub fn reply(&self) -> &[u8] {
        &self.reply_buf[..self.reply_len]
    }

    /// The bridge finished sending the last reply
    ///
    /// Returns `true` when that reply acknowledged `ENTER_FLASH`, and it's
    /// time to switch the pipe over.
    pub fn bridge_in_completion(&mut self) -> bool {
        self.pending_out = false;
        if !core::mem::take(&mut self.command_reply) {
            return false;
        }
        self.cmd_len = 0;
        self.frame_done = false;
        self.outcome = None;
        core::mem::take(&mut self.enter_flash)
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}
