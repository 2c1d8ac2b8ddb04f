//! Expansion port state machine
//!
//! A [`Port`] terminates the bridge protocol for one physical port. Command
//! frames arrive from the bridge, in chunks, into the port's command buffer.
//! The port parses them as they land, runs them against its transport, and
//! leaves a reply for the runtime to collect with
//! [`poll_outbound`](Port::poll_outbound).
//!
//! ```text
//! Idle -> ReceivingArgs -> Executing -> SendingReply -> Idle
//!               |               |
//!               +---> Error <---+
//! ```
//!
//! `Error` is only left through [`disable`](Port::disable) and
//! [`enable`](Port::enable).
//!
//! Every byte between memory and the transport moves by DMA. The command
//! buffer doubles as the receive buffer for `RX` and `TXRX`; the reply
//! buffer is only written while no reply is in flight.

use crate::{
    bridge::{Chunk, Inbound},
    dma::{Dma, DmaChan, Dmac, Transfer},
    frame::{
        write_reply_header, ChannelId, Command, Reply, Status, BRIDGE_ARG_SIZE, BRIDGE_BUF_SIZE,
        REPLY_HEADER, REPLY_PAYLOAD,
    },
    uart::UartBuf,
};
use bitflags::bitflags;

/// Pins per port
pub const PORT_PINS: u8 = 8;

/// Port protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortState {
    Idle = 0,
    ReceivingArgs = 1,
    Executing = 2,
    SendingReply = 3,
    Error = 4,
}

/// Transport personality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    None = 0,
    Uart = 1,
    I2c = 2,
    Spi = 3,
}

/// What fires a pin interrupt
///
/// Level triggers disarm themselves after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinTrigger {
    Disabled,
    Rise,
    Fall,
    Change,
    High,
    Low,
}

impl PinTrigger {
    fn from_arg(arg: u8) -> Option<Self> {
        Some(match arg {
            0 => PinTrigger::Disabled,
            1 => PinTrigger::Rise,
            2 => PinTrigger::Fall,
            3 => PinTrigger::Change,
            4 => PinTrigger::High,
            5 => PinTrigger::Low,
            _ => return None,
        })
    }

    fn is_level(self) -> bool {
        matches!(self, PinTrigger::High | PinTrigger::Low)
    }
}

bitflags! {
    /// `GPIO_CFG` pin configuration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PinConfig : u8 {
        const OUTPUT = 1 << 0;
        const PULL_UP = 1 << 1;
        const PULL_DOWN = 1 << 2;
        /// Enable the input buffer, so that the pin can be read
        const INPUT = 1 << 3;
    }
}

/// The physical side of a port
///
/// # Safety
///
/// `data_register` must return the address of the transport's data
/// register. The DMA controller reads and writes it while transfers run.
pub unsafe trait PortHardware {
    /// Power the port, and route `clock_channel` to it
    fn enable(&mut self, clock_channel: u8);
    /// Release the transport and the pins
    fn disable(&mut self);
    /// Switch the transport personality
    ///
    /// `args` are the enable command's arguments. `Mode::None` tears the
    /// current personality down.
    fn configure(&mut self, mode: Mode, args: &[u8]);
    /// The transport's data register, for DMA
    fn data_register(&self) -> *mut u8;

    fn pin_set(&mut self, pin: u8, high: bool);
    fn pin_toggle(&mut self, pin: u8);
    fn pin_read(&mut self, pin: u8) -> bool;
    fn pin_configure(&mut self, pin: u8, config: PinConfig);
    fn pin_interrupt(&mut self, pin: u8, trigger: PinTrigger);

    /// Address an I2C target; returns `true` if the target acknowledged
    fn i2c_start(&mut self, addr: u8) -> bool;
    fn i2c_stop(&mut self);
    /// Indicates if the target stopped acknowledging during the last write
    fn i2c_nacked(&mut self) -> bool;
}

/// How a finished command replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Header only
    Reply(Reply),
    /// Data reply, echoing the payload
    Echo,
    /// Data reply, draining the UART ring
    Flush,
    /// Data reply, carrying bytes received into the command buffer
    Read { start: usize, len: usize },
}

static ZERO: u8 = 0;

/// A physical port
pub struct Port<H> {
    chan: ChannelId,
    hw: H,
    clock_channel: u8,
    dma_tx: DmaChan,
    dma_rx: DmaChan,
    enabled: bool,

    state: PortState,
    mode: Mode,
    status: Status,

    cmd_buf: [u8; BRIDGE_BUF_SIZE],
    cmd_len: usize,
    cmd_pos: usize,
    /// The bridge marked the end of the command frame
    frame_done: bool,
    reply_buf: [u8; BRIDGE_BUF_SIZE],
    reply_len: usize,

    cmd: u8,
    arg: [u8; BRIDGE_ARG_SIZE],
    arg_len: usize,
    arg_pos: usize,
    outcome: Option<Outcome>,

    pending_in: bool,
    pending_out: bool,
    /// The reply in flight answers a command (not an async event)
    command_reply: bool,

    /// Command transfers on the transport
    xfer_tx: bool,
    xfer_rx: bool,
    /// End of the payload handed to the transmit DMA
    tx_end: usize,
    /// One byte UART receive into the ring
    uart_rx: bool,
    uart_buf: UartBuf,

    pin_int: u8,
    pin_level: u8,
    pin_events: u8,
}

impl<H: PortHardware> Port<H> {
    /// Describe a port; it starts disabled
    pub const fn new(
        chan: ChannelId,
        hw: H,
        clock_channel: u8,
        dma_tx: DmaChan,
        dma_rx: DmaChan,
    ) -> Self {
        Port {
            chan,
            hw,
            clock_channel,
            dma_tx,
            dma_rx,
            enabled: false,
            state: PortState::Idle,
            mode: Mode::None,
            status: Status::empty(),
            cmd_buf: [0; BRIDGE_BUF_SIZE],
            cmd_len: 0,
            cmd_pos: 0,
            frame_done: false,
            reply_buf: [0; BRIDGE_BUF_SIZE],
            reply_len: 0,
            cmd: 0,
            arg: [0; BRIDGE_ARG_SIZE],
            arg_len: 0,
            arg_pos: 0,
            outcome: None,
            pending_in: false,
            pending_out: false,
            command_reply: false,
            xfer_tx: false,
            xfer_rx: false,
            tx_end: 0,
            uart_rx: false,
            uart_buf: UartBuf::new(),
            pin_int: 0,
            pin_level: 0,
            pin_events: 0,
        }
    }

    /// Power the port and reset it to idle
    ///
    /// # Safety
    ///
    /// Once enabled, the port's buffers are DMA targets. The port must not
    /// move until it's disabled.
    pub unsafe fn enable(&mut self) {
        self.hw.enable(self.clock_channel);
        self.reset();
        self.enabled = true;
        debug!("Port {} enabled", self.chan.id());
    }

    /// Cancel all transfers, release the hardware, and reset to idle
    ///
    /// Safe to call on a disabled port. The bridge holds its own transfer
    /// state; cancel the port's channel there too.
    pub fn disable<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        dma.abort(self.dma_tx);
        dma.abort(self.dma_rx);
        if self.enabled {
            self.hw.disable();
        }
        self.reset();
        self.enabled = false;
        debug!("Port {} disabled", self.chan.id());
    }

    fn reset(&mut self) {
        self.state = PortState::Idle;
        self.mode = Mode::None;
        self.status = Status::empty();
        self.reset_frame();
        self.reply_len = 0;
        self.pending_in = false;
        self.pending_out = false;
        self.command_reply = false;
        self.uart_rx = false;
        self.uart_buf.clear();
        self.pin_int = 0;
        self.pin_level = 0;
        self.pin_events = 0;
    }

    /// Forget the bytes received so far, keeping `cmd_pos <= cmd_len`
    fn clear_cursors(&mut self) {
        self.cmd_len = 0;
        self.cmd_pos = 0;
        self.arg_len = 0;
        self.arg_pos = 0;
    }

    fn reset_frame(&mut self) {
        self.cmd_len = 0;
        self.cmd_pos = 0;
        self.frame_done = false;
        self.cmd = 0;
        self.arg = [0; BRIDGE_ARG_SIZE];
        self.arg_len = 0;
        self.arg_pos = 0;
        self.outcome = None;
        self.xfer_tx = false;
        self.xfer_rx = false;
        self.tx_end = 0;
    }

    pub fn channel(&self) -> ChannelId {
        self.chan
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Opcode of the current command
    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    /// Arguments of the current command
    pub fn arg(&self) -> &[u8] {
        &self.arg[..self.arg_len]
    }

    /// The bytes of the current command frame, as received so far
    pub fn command(&self) -> &[u8] {
        &self.cmd_buf[..self.cmd_len]
    }

    pub fn pending_in(&self) -> bool {
        self.pending_in
    }

    pub fn pending_out(&self) -> bool {
        self.pending_out
    }

    /// The reply handed out by the last [`poll_outbound`](Port::poll_outbound)
    pub fn reply(&self) -> &[u8] {
        &self.reply_buf[..self.reply_len]
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// `[state, mode, status, buffered UART bytes]`
    ///
    /// Status flags are not cleared.
    pub fn status_bytes(&self) -> [u8; 4] {
        [
            self.state as u8,
            self.mode as u8,
            self.status.bits(),
            self.uart_buf.len() as u8,
        ]
    }

    /// Set the UART flush timeout, in milliseconds
    pub fn set_flush_timeout(&mut self, timeout_ms: u16) {
        self.uart_buf.set_timeout(timeout_ms);
    }

    /// Raise a status flag for the next reply
    pub fn raise(&mut self, status: Status) {
        self.status |= status;
    }

    /// Where the next chunk of the command frame should land
    ///
    /// Returns `None` if the port doesn't want data now, or if it already
    /// asked for it. Hand the result to the bridge.
    pub fn poll_inbound(&mut self) -> Option<Inbound> {
        if !self.enabled || self.pending_in {
            return None;
        }
        let wants = match self.state {
            PortState::Idle | PortState::ReceivingArgs => true,
            PortState::Executing | PortState::Error => !self.frame_done,
            PortState::SendingReply => false,
        };
        if !wants {
            return None;
        }
        self.pending_in = true;
        let capacity = BRIDGE_BUF_SIZE - self.cmd_len;
        // cmd_len <= BRIDGE_BUF_SIZE, so this is at most one past the end.
        let ptr = self.cmd_buf.as_mut_ptr().wrapping_add(self.cmd_len);
        Some(Inbound::new(ptr, capacity))
    }

    /// A chunk of the command frame landed in the command buffer
    pub fn bridge_out_completion<D: Dmac>(&mut self, chunk: Chunk, dma: &mut Dma<D>) {
        self.pending_in = false;
        if chunk.last {
            self.frame_done = true;
        }

        if self.state == PortState::Error {
            self.clear_cursors();
            if self.frame_done && self.outcome.is_none() {
                self.outcome = Some(Outcome::Reply(Reply::Error));
            }
            return;
        }

        self.cmd_len = (self.cmd_len + chunk.len).min(BRIDGE_BUF_SIZE);
        if chunk.dropped > 0 {
            warn!("Port {} dropped {} command bytes", self.chan.id(), chunk.dropped);
            self.status |= Status::OVERFLOW;
        }
        self.parse(dma);
    }

    fn parse<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        if self.state == PortState::Idle {
            if self.cmd_len == 0 {
                if self.frame_done {
                    // An empty frame carries no command.
                    self.frame_done = false;
                }
                return;
            }
            self.cmd = self.cmd_buf[0];
            self.cmd_pos = 1;
            self.state = PortState::ReceivingArgs;
        }

        if self.state == PortState::ReceivingArgs {
            if self.cmd_pos == 1 && self.cmd_len > 1 {
                let arg_len = self.cmd_buf[1] as usize;
                if arg_len > BRIDGE_ARG_SIZE {
                    warn!("Port {} declared {} args", self.chan.id(), arg_len);
                    return self.enter_error();
                }
                self.arg_len = arg_len;
                self.cmd_pos = 2;
            }
            if self.cmd_pos >= 2 {
                while self.arg_pos < self.arg_len && self.cmd_pos < self.cmd_len {
                    self.arg[self.arg_pos] = self.cmd_buf[self.cmd_pos];
                    self.arg_pos += 1;
                    self.cmd_pos += 1;
                }
            }
            if self.cmd_pos >= 2 && self.arg_pos == self.arg_len {
                self.execute(dma);
            } else if self.frame_done {
                warn!("Port {} frame ended in its header", self.chan.id());
                return self.enter_error();
            } else {
                return;
            }
        }

        if self.state == PortState::Executing {
            self.progress(dma);
        }
    }

    fn enter_error(&mut self) {
        self.state = PortState::Error;
        self.status |= Status::FRAMING;
        self.clear_cursors();
        if self.frame_done {
            self.outcome = Some(Outcome::Reply(Reply::Error));
        }
    }

    fn execute<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        let cmd = match Command::try_from(self.cmd) {
            Ok(cmd) if self.arg_len >= cmd.min_args() => cmd,
            _ => {
                warn!("Port {} rejected opcode {}", self.chan.id(), self.cmd);
                return self.enter_error();
            }
        };
        self.state = PortState::Executing;
        trace!("Port {} executing {:?}", self.chan.id(), cmd);

        let outcome = match cmd {
            Command::Nop => Outcome::Reply(Reply::Ack),
            Command::Flush => Outcome::Flush,
            Command::Echo => Outcome::Echo,
            Command::GpioIn => match self.pin(0) {
                Some(pin) if self.hw.pin_read(pin) => Outcome::Reply(Reply::High),
                Some(_) => Outcome::Reply(Reply::Low),
                None => Outcome::Reply(Reply::Error),
            },
            Command::GpioHigh | Command::GpioLow | Command::GpioToggle => match self.pin(0) {
                Some(pin) => {
                    match cmd {
                        Command::GpioToggle => self.hw.pin_toggle(pin),
                        _ => self.hw.pin_set(pin, cmd == Command::GpioHigh),
                    }
                    Outcome::Reply(Reply::Ack)
                }
                None => Outcome::Reply(Reply::Error),
            },
            Command::GpioCfg => match self.pin(0) {
                Some(pin) => {
                    self.hw
                        .pin_configure(pin, PinConfig::from_bits_truncate(self.arg[1]));
                    Outcome::Reply(Reply::Ack)
                }
                None => Outcome::Reply(Reply::Error),
            },
            Command::GpioInt => match (self.pin(0), PinTrigger::from_arg(self.arg[1])) {
                (Some(pin), Some(trigger)) => {
                    self.arm_pin(pin, trigger);
                    Outcome::Reply(Reply::Ack)
                }
                _ => Outcome::Reply(Reply::Error),
            },
            Command::EnableSpi => self.switch_mode(Mode::None, Mode::Spi, dma),
            Command::EnableI2c => self.switch_mode(Mode::None, Mode::I2c, dma),
            Command::EnableUart => self.switch_mode(Mode::None, Mode::Uart, dma),
            Command::DisableSpi => self.switch_mode(Mode::Spi, Mode::None, dma),
            Command::DisableI2c => self.switch_mode(Mode::I2c, Mode::None, dma),
            Command::DisableUart => self.switch_mode(Mode::Uart, Mode::None, dma),
            Command::Tx if self.mode != Mode::None => return self.pump_tx(dma),
            // Both run from progress, once the frame is complete.
            Command::TxRx if self.mode == Mode::Spi => return,
            Command::Rx if matches!(self.mode, Mode::Spi | Mode::I2c) => return,
            Command::Start if self.mode == Mode::I2c => {
                if self.hw.i2c_start(self.arg[0]) {
                    Outcome::Reply(Reply::Ack)
                } else {
                    Outcome::Reply(Reply::Nack)
                }
            }
            Command::Stop if self.mode == Mode::I2c => {
                self.hw.i2c_stop();
                Outcome::Reply(Reply::Ack)
            }
            Command::Tx | Command::TxRx | Command::Rx | Command::Start | Command::Stop => {
                Outcome::Reply(Reply::Error)
            }
        };
        self.outcome = Some(outcome);
    }

    /// Move a running command along, now that more of its frame arrived
    fn progress<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        if self.outcome.is_some() {
            return;
        }
        match Command::try_from(self.cmd) {
            Ok(Command::Tx) => self.pump_tx(dma),
            Ok(Command::TxRx) if self.frame_done && !self.xfer_rx => {
                let len = self.cmd_len - self.cmd_pos;
                if len == 0 || len > REPLY_PAYLOAD {
                    self.outcome = Some(Outcome::Reply(Reply::Error));
                    return;
                }
                let start = self.cmd_pos;
                let data = self.hw.data_register();
                let buf = self.cmd_buf[start..].as_mut_ptr();
                // Safety: the port is pinned while enabled, and disable aborts
                // both channels. The receive lags the transmit, so receiving in
                // place never overwrites a byte before it's sent.
                unsafe {
                    dma.start(self.dma_rx, Transfer::from_peripheral(data, buf, len as u16));
                    dma.start(self.dma_tx, Transfer::to_peripheral(buf, len as u16, data));
                }
                self.cmd_pos = self.cmd_len;
                self.xfer_rx = true;
                self.xfer_tx = true;
                self.tx_end = start;
            }
            // The receive lands in the command buffer, so wait until the
            // bridge is done writing there.
            Ok(Command::Rx) if self.frame_done && !self.xfer_rx => {
                if let Err(outcome) = self.start_rx(self.arg[0] as usize, dma) {
                    self.outcome = Some(outcome);
                }
            }
            _ => {}
        }
    }

    fn pin(&self, idx: usize) -> Option<u8> {
        let pin = self.arg[idx];
        (pin < PORT_PINS).then_some(pin)
    }

    fn arm_pin(&mut self, pin: u8, trigger: PinTrigger) {
        let mask = 1 << pin;
        if trigger == PinTrigger::Disabled {
            self.pin_int &= !mask;
        } else {
            self.pin_int |= mask;
        }
        if trigger.is_level() {
            self.pin_level |= mask;
        } else {
            self.pin_level &= !mask;
        }
        self.pin_events &= !mask;
        self.hw.pin_interrupt(pin, trigger);
    }

    fn switch_mode<D: Dmac>(&mut self, from: Mode, to: Mode, dma: &mut Dma<D>) -> Outcome {
        let valid = self.mode == from && (from == Mode::None) != (to == Mode::None);
        if !valid {
            return Outcome::Reply(Reply::Error);
        }
        if self.mode == Mode::Uart {
            dma.abort(self.dma_rx);
            self.uart_rx = false;
            self.uart_buf.clear();
        }
        self.hw.configure(to, &self.arg[..self.arg_len]);
        self.mode = to;
        if to == Mode::Uart {
            self.start_uart_rx(dma);
        }
        Outcome::Reply(Reply::Ack)
    }

    fn start_uart_rx<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        let slot = self.uart_buf.slot();
        // Safety: the slot is inside the port, which is pinned while enabled.
        // The transfer is aborted when leaving UART mode, or on disable.
        unsafe {
            dma.start(
                self.dma_rx,
                Transfer::from_peripheral(self.hw.data_register(), slot, 1),
            );
        }
        self.uart_rx = true;
    }

    fn start_rx<D: Dmac>(&mut self, len: usize, dma: &mut Dma<D>) -> Result<(), Outcome> {
        let start = self.cmd_pos;
        if len == 0 || len > REPLY_PAYLOAD || start + len > BRIDGE_BUF_SIZE {
            return Err(Outcome::Reply(Reply::Error));
        }
        let data = self.hw.data_register();
        let buf = self.cmd_buf[start..].as_mut_ptr();
        // Safety: the port is pinned while enabled, and disable aborts both
        // channels. The frame is complete, so the bridge no longer writes the
        // command buffer, and replies aren't built until the transfer is done.
        unsafe {
            dma.start(self.dma_rx, Transfer::from_peripheral(data, buf, len as u16));
            if self.mode == Mode::Spi {
                dma.start(self.dma_tx, Transfer::fill_peripheral(&ZERO, len as u16, data));
                self.xfer_tx = true;
            }
        }
        self.xfer_rx = true;
        self.tx_end = start;
        Ok(())
    }

    /// Send whatever payload has arrived, or finish if there's no more
    fn pump_tx<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        if self.xfer_tx {
            return;
        }
        let len = self.cmd_len - self.cmd_pos;
        if len > 0 {
            let buf = self.cmd_buf[self.cmd_pos..].as_ptr();
            // Safety: the port is pinned while enabled, and disable aborts the
            // channel. Bytes before cmd_len are never rewritten in this frame.
            unsafe {
                dma.start(
                    self.dma_tx,
                    Transfer::to_peripheral(buf, len as u16, self.hw.data_register()),
                );
            }
            self.xfer_tx = true;
            self.tx_end = self.cmd_len;
        } else if self.frame_done {
            let reply = if self.mode == Mode::I2c && self.hw.i2c_nacked() {
                Reply::Nack
            } else {
                Reply::Ack
            };
            self.outcome = Some(Outcome::Reply(reply));
        }
    }

    /// The transmit DMA channel finished
    pub fn dma_tx_completion<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        if !self.xfer_tx {
            return;
        }
        self.xfer_tx = false;
        if self.state == PortState::Executing && self.cmd == Command::Tx as u8 {
            self.cmd_pos = self.tx_end;
            self.pump_tx(dma);
        }
    }

    /// The receive DMA channel finished
    pub fn dma_rx_completion<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        if self.uart_rx {
            self.uart_rx = false;
            if self.uart_buf.commit().is_err() {
                warn!("Port {} UART ring overflow", self.chan.id());
            }
            self.start_uart_rx(dma);
        } else if self.xfer_rx {
            self.xfer_rx = false;
            let start = self.tx_end;
            let len = if self.cmd == Command::Rx as u8 {
                self.arg[0] as usize
            } else {
                self.cmd_len - start
            };
            self.outcome = Some(Outcome::Read { start, len });
        }
    }

    /// External interrupt flags for this port's pins
    pub fn handle_extint(&mut self, flags: u32) {
        let fired = flags as u8 & self.pin_int;
        self.pin_events |= fired;
        let disarm = fired & self.pin_level;
        if disarm != 0 {
            self.pin_int &= !disarm;
            self.pin_level &= !disarm;
            for pin in 0..PORT_PINS {
                if disarm & (1 << pin) != 0 {
                    self.hw.pin_interrupt(pin, PinTrigger::Disabled);
                }
            }
        }
    }

    /// Millisecond tick
    pub fn tick(&mut self) {
        self.uart_buf.tick();
    }

    /// Build the next reply, if there's one to send
    ///
    /// Command replies come first, then buffered UART data, then pin
    /// changes. Returns the reply length; the bytes are in
    /// [`reply`](Port::reply) until [`bridge_in_completion`](Port::bridge_in_completion).
    pub fn poll_outbound(&mut self) -> Option<usize> {
        if !self.enabled || self.pending_out {
            return None;
        }

        let command_ready = self.frame_done && !self.xfer_tx && !self.xfer_rx;
        let len = if let (true, Some(outcome)) = (command_ready, self.outcome) {
            if self.state != PortState::Error {
                self.state = PortState::SendingReply;
            }
            self.command_reply = true;
            self.build_reply(outcome)
        } else if self.state == PortState::Error {
            return None;
        } else if self.uart_buf.should_flush() {
            let count = self
                .uart_buf
                .drain(&mut self.reply_buf[REPLY_HEADER..][..REPLY_PAYLOAD]);
            self.header(Reply::UartData, count)
        } else if self.pin_events != 0 {
            let pin = self.pin_events.trailing_zeros() as u8;
            self.pin_events &= !(1 << pin);
            self.header(Reply::PinChange(pin), 0)
        } else {
            return None;
        };

        self.reply_len = len;
        self.pending_out = true;
        Some(len)
    }

    fn build_reply(&mut self, outcome: Outcome) -> usize {
        let payload = &mut self.reply_buf[REPLY_HEADER..][..REPLY_PAYLOAD];
        match outcome {
            Outcome::Reply(reply) => self.header(reply, 0),
            Outcome::Echo => {
                let echo = &self.cmd_buf[self.cmd_pos..self.cmd_len];
                let len = echo.len().min(REPLY_PAYLOAD);
                payload[..len].copy_from_slice(&echo[..len]);
                self.header(Reply::Data, len)
            }
            Outcome::Flush => {
                let len = self.uart_buf.drain(payload);
                self.header(Reply::Data, len)
            }
            Outcome::Read { start, len } => {
                payload[..len].copy_from_slice(&self.cmd_buf[start..start + len]);
                self.header(Reply::Data, len)
            }
        }
    }

    fn header(&mut self, reply: Reply, payload: usize) -> usize {
        let mut status = core::mem::replace(&mut self.status, Status::empty());
        if self.uart_buf.take_overflow() {
            status |= Status::OVERFLOW;
        }
        write_reply_header(&mut self.reply_buf, self.chan, reply, status, payload)
    }

    /// The bridge finished sending the last reply
    pub fn bridge_in_completion(&mut self) {
        self.pending_out = false;
        if core::mem::take(&mut self.command_reply) {
            if self.state == PortState::SendingReply {
                self.state = PortState::Idle;
            }
            self.reset_frame();
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Mode, PinTrigger, Port, PortState};
    use crate::{
        dma::Dma,
        frame::{ChannelId, Status},
        resources::{DMA_PORT_A_RX, DMA_PORT_A_TX, GCLK_PORT_A},
        testing::{self, FakeDmac, FakePort},
    };

    type TestPort = Port<FakePort>;

    fn port() -> std::boxed::Box<TestPort> {
        let mut port = std::boxed::Box::new(Port::new(
            ChannelId::PortA,
            FakePort::default(),
            GCLK_PORT_A,
            DMA_PORT_A_TX,
            DMA_PORT_A_RX,
        ));
        // Safety: boxed, so it won't move.
        unsafe { port.enable() };
        port
    }

    fn dma() -> Dma<FakeDmac> {
        Dma::new(FakeDmac::default())
    }

    /// Collect a reply, and complete it
    fn reply(port: &mut TestPort) -> std::vec::Vec<u8> {
        port.poll_outbound().expect("reply");
        let reply = port.reply().to_vec();
        port.bridge_in_completion();
        reply
    }

    fn assert_baseline(port: &TestPort) {
        assert_eq!(port.state(), PortState::Idle);
        assert_eq!(port.mode(), Mode::None);
        assert_eq!(port.command(), &[]);
        assert_eq!(port.cmd_pos, 0);
        assert_eq!(port.arg(), &[]);
        assert_eq!(port.arg_pos, 0);
        assert!(!port.pending_in());
        assert!(!port.pending_out());
        assert!(port.uart_buf.is_empty());
        assert_eq!(port.status, Status::empty());
        assert_eq!(port.outcome, None);
        assert_eq!(port.pin_int, 0);
    }

    #[test]
    fn tx_header_scenario() {
        let mut port = port();
        let mut dma = dma();
        assert_eq!(port.state(), PortState::Idle);

        testing::feed(&mut port, &mut dma, &[0x10], false);
        assert_eq!(port.state(), PortState::ReceivingArgs);
        testing::feed(&mut port, &mut dma, &[2, 0xAB], false);
        assert_eq!(port.state(), PortState::ReceivingArgs);
        testing::feed(&mut port, &mut dma, &[0xCD], true);
        assert_eq!(port.state(), PortState::Executing);
        assert_eq!(port.cmd(), 0x10);
        assert_eq!(port.arg(), &[0xAB, 0xCD]);
        assert_eq!(port.arg_len, 2);
    }

    #[test]
    fn chunks_reassemble() {
        let mut port = port();
        let mut dma = dma();
        let frame: std::vec::Vec<u8> = [0x02, 1, 0x55]
            .into_iter()
            .chain((0..200u8).map(|b| b ^ 0x5A))
            .collect();
        for (i, chunk) in frame.chunks(63).enumerate() {
            let last = (i + 1) * 63 >= frame.len();
            testing::feed(&mut port, &mut dma, chunk, last);
        }
        assert_eq!(port.command(), &frame[..]);

        let reply = reply(&mut port);
        assert_eq!(&reply[..4], &[1, 0x84, 1, 0]);
        assert_eq!(&reply[4..], &frame[3..]);
        assert_eq!(port.state(), PortState::Idle);
    }

    #[test]
    fn too_many_args_is_a_framing_error() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x10, 6, 1, 2, 3, 4, 5, 6], true);
        assert_eq!(port.state(), PortState::Error);
        assert_eq!(reply(&mut port), [1, 0x85, 1, Status::FRAMING.bits()]);
        assert_eq!(port.state(), PortState::Error);

        // Still rejecting, until reset.
        testing::feed(&mut port, &mut dma, &[0x00, 0], true);
        assert_eq!(reply(&mut port), [1, 0x85, 1, 0]);

        port.disable(&mut dma);
        unsafe { port.enable() };
        testing::feed(&mut port, &mut dma, &[0x00, 0], true);
        assert_eq!(reply(&mut port), [1, 0x80, 1, 0]);
    }

    #[test]
    fn unknown_opcode_is_a_framing_error() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x07, 0], true);
        assert_eq!(port.state(), PortState::Error);
        assert_eq!(reply(&mut port)[1], 0x85);
    }

    #[test]
    fn error_state_keeps_cursors_ordered() {
        for frame in [&[0x07, 3, 1, 2, 3][..], &[0x10, 6, 1, 2, 3, 4, 5, 6]] {
            let mut port = port();
            let mut dma = dma();
            testing::feed(&mut port, &mut dma, frame, true);
            assert_eq!(port.state(), PortState::Error);
            assert_eq!((port.cmd_pos, port.cmd_len), (0, 0));
            assert_eq!((port.arg_pos, port.arg_len), (0, 0));
            reply(&mut port);

            // Frames received while in the error state are dropped whole.
            testing::feed(&mut port, &mut dma, &[0x00, 2, 1], false);
            assert!(port.cmd_pos <= port.cmd_len);
            assert_eq!(port.command(), &[]);
            testing::feed(&mut port, &mut dma, &[2], true);
            assert!(port.cmd_pos <= port.cmd_len);
            assert!(port.arg_pos <= port.arg_len);
            assert_eq!(reply(&mut port), [1, 0x85, 1, 0]);
        }
    }

    #[test]
    fn wrong_mode_is_not_fatal() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x13, 1, 0x50], true);
        assert_eq!(reply(&mut port), [1, 0x85, 1, 0]);
        assert_eq!(port.state(), PortState::Idle);
    }

    #[test]
    fn gpio() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x04, 1, 3], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert!(port.hardware().pins[3]);
        testing::feed(&mut port, &mut dma, &[0x03, 1, 3], true);
        assert_eq!(reply(&mut port)[1], 0x82);
        testing::feed(&mut port, &mut dma, &[0x15, 1, 3], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        testing::feed(&mut port, &mut dma, &[0x03, 1, 3], true);
        assert_eq!(reply(&mut port)[1], 0x83);
        testing::feed(&mut port, &mut dma, &[0x04, 1, 9], true);
        assert_eq!(reply(&mut port)[1], 0x85);
    }

    #[test]
    fn pin_interrupts() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x08, 2, 2, 1], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        testing::feed(&mut port, &mut dma, &[0x08, 2, 5, 4], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(port.hardware().triggers[5], PinTrigger::High);

        port.handle_extint(1 << 2 | 1 << 5 | 1 << 6);
        assert_eq!(reply(&mut port), [1, 0xC2, 1, 0]);
        assert_eq!(reply(&mut port), [1, 0xC5, 1, 0]);
        assert_eq!(port.poll_outbound(), None);
        assert_eq!(port.hardware().triggers[5], PinTrigger::Disabled);

        // Edge stays armed, level doesn't.
        port.handle_extint(1 << 2 | 1 << 5);
        assert_eq!(reply(&mut port), [1, 0xC2, 1, 0]);
        assert_eq!(port.poll_outbound(), None);
    }

    #[test]
    fn spi_tx_streams_payload() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0A, 2, 0, 4], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(port.mode(), Mode::Spi);

        testing::feed(&mut port, &mut dma, &[0x10, 0, 1, 2, 3], false);
        assert!(dma.is_active(DMA_PORT_A_TX));
        testing::feed(&mut port, &mut dma, &[4, 5], true);
        assert!(testing::run(&mut dma, DMA_PORT_A_TX));
        port.dma_tx_completion(&mut dma);
        assert!(dma.is_active(DMA_PORT_A_TX));
        assert_eq!(port.poll_outbound(), None);
        assert!(testing::run(&mut dma, DMA_PORT_A_TX));
        port.dma_tx_completion(&mut dma);

        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(dma.dmac().sent(DMA_PORT_A_TX), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn spi_txrx_in_place() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0A, 2, 0, 4], true);
        reply(&mut port);

        dma.dmac_mut().feed(DMA_PORT_A_RX, &[9, 8, 7]);
        testing::feed(&mut port, &mut dma, &[0x12, 0, 1, 2, 3], true);
        assert!(testing::run(&mut dma, DMA_PORT_A_TX));
        port.dma_tx_completion(&mut dma);
        assert_eq!(port.poll_outbound(), None);
        assert!(testing::run(&mut dma, DMA_PORT_A_RX));
        port.dma_rx_completion(&mut dma);

        assert_eq!(reply(&mut port), [1, 0x84, 1, 0, 9, 8, 7]);
        assert_eq!(dma.dmac().sent(DMA_PORT_A_TX), &[1, 2, 3]);
    }

    #[test]
    fn i2c_read() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0C, 1, 0x10], true);
        reply(&mut port);
        testing::feed(&mut port, &mut dma, &[0x13, 1, 0x21], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(port.hardware().i2c_addr, Some(0x21));

        dma.dmac_mut().feed(DMA_PORT_A_RX, &[0xDE, 0xAD]);
        testing::feed(&mut port, &mut dma, &[0x11, 1, 2], true);
        assert!(!dma.is_active(DMA_PORT_A_TX));
        assert!(testing::run(&mut dma, DMA_PORT_A_RX));
        port.dma_rx_completion(&mut dma);
        assert_eq!(reply(&mut port), [1, 0x84, 1, 0, 0xDE, 0xAD]);

        testing::feed(&mut port, &mut dma, &[0x14, 0], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(port.hardware().i2c_addr, None);
    }

    #[test]
    fn rx_waits_for_the_whole_frame() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0C, 1, 0x10], true);
        reply(&mut port);

        let mut frame = std::vec![0x11, 1, 100];
        frame.extend(0..60u8);
        testing::feed(&mut port, &mut dma, &frame, false);
        assert_eq!(port.state(), PortState::Executing);
        assert!(!dma.is_active(DMA_PORT_A_RX));

        testing::feed(&mut port, &mut dma, &[], true);
        assert!(dma.is_active(DMA_PORT_A_RX));
        assert_eq!(dma.descriptor(DMA_PORT_A_RX).transfer().count, 100);
        assert!(port.poll_inbound().is_none());

        dma.dmac_mut().feed(DMA_PORT_A_RX, &[0x42; 100]);
        assert!(testing::run(&mut dma, DMA_PORT_A_RX));
        port.dma_rx_completion(&mut dma);
        let reply = reply(&mut port);
        assert_eq!(&reply[..4], &[1, 0x84, 1, 0]);
        assert_eq!(&reply[4..], &[0x42; 100][..]);
    }

    #[test]
    fn i2c_write_nack() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0C, 1, 0x10], true);
        reply(&mut port);
        port.hardware_mut().nack = true;
        testing::feed(&mut port, &mut dma, &[0x10, 0, 0xFF], true);
        assert!(testing::run(&mut dma, DMA_PORT_A_TX));
        port.dma_tx_completion(&mut dma);
        assert_eq!(reply(&mut port)[1], 0x81);
    }

    #[test]
    fn uart_receive_and_flush() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0E, 2, 0x25, 0x80], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert_eq!(port.hardware().config, Some((Mode::Uart, std::vec![0x25, 0x80])));

        dma.dmac_mut().feed(DMA_PORT_A_RX, b"ok");
        for _ in 0..2 {
            assert!(testing::run(&mut dma, DMA_PORT_A_RX));
            port.dma_rx_completion(&mut dma);
        }
        assert!(dma.is_active(DMA_PORT_A_RX));
        assert_eq!(port.poll_outbound(), None);

        for _ in 0..crate::uart::UART_MS_TIMEOUT {
            port.tick();
        }
        assert_eq!(reply(&mut port), [1, 0xA0, 1, 0, b'o', b'k']);
        assert_eq!(port.poll_outbound(), None);
    }

    #[test]
    fn uart_overflow_is_reported() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0E, 2, 0x25, 0x80], true);
        reply(&mut port);

        dma.dmac_mut().feed(DMA_PORT_A_RX, &[0x41; 25]);
        for _ in 0..25 {
            assert!(testing::run(&mut dma, DMA_PORT_A_RX));
            port.dma_rx_completion(&mut dma);
        }
        let reply = reply(&mut port);
        assert_eq!(&reply[..4], &[1, 0xA0, 1, Status::OVERFLOW.bits()]);
        assert_eq!(reply.len(), 4 + 19);
    }

    #[test]
    fn flush_command_drains_ring() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0E, 2, 0x25, 0x80], true);
        reply(&mut port);
        dma.dmac_mut().feed(DMA_PORT_A_RX, b"x");
        assert!(testing::run(&mut dma, DMA_PORT_A_RX));
        port.dma_rx_completion(&mut dma);

        testing::feed(&mut port, &mut dma, &[0x01, 0], true);
        assert_eq!(reply(&mut port), [1, 0x84, 1, 0, b'x']);

        testing::feed(&mut port, &mut dma, &[0x0F, 0], true);
        assert_eq!(reply(&mut port)[1], 0x80);
        assert!(!dma.is_active(DMA_PORT_A_RX));
    }

    #[test]
    fn command_overflow_is_sticky() {
        let mut port = port();
        let mut dma = dma();
        let mut frame = std::vec![0x02, 0];
        frame.extend(core::iter::repeat(7).take(300));
        for (i, chunk) in frame.chunks(64).enumerate() {
            testing::feed(&mut port, &mut dma, chunk, (i + 1) * 64 >= frame.len());
        }
        let reply = reply(&mut port);
        assert_eq!(reply[3], Status::OVERFLOW.bits());
        assert_eq!(reply.len(), 4 + 252);
    }

    #[test]
    fn disable_enable_returns_to_baseline() {
        let mut dma = dma();

        // Mid-frame
        let mut a = port();
        testing::feed(&mut a, &mut dma, &[0x10, 4, 1], false);
        assert!(a.poll_inbound().is_some());
        a.disable(&mut dma);
        a.disable(&mut dma);
        unsafe { a.enable() };
        assert_baseline(&a);

        // UART running, reply in flight, error pending
        let mut b = port();
        testing::feed(&mut b, &mut dma, &[0x0E, 2, 0x25, 0x80], true);
        b.poll_outbound();
        b.handle_extint(0xFF);
        b.raise(Status::DMA_FAULT);
        assert!(dma.is_active(DMA_PORT_A_RX));
        b.disable(&mut dma);
        assert!(!dma.is_active(DMA_PORT_A_RX));
        assert!(!b.is_enabled());
        unsafe { b.enable() };
        assert_baseline(&b);
        assert_eq!(b.hardware().enables, 2);
    }

    #[test]
    fn status_bytes() {
        let mut port = port();
        let mut dma = dma();
        testing::feed(&mut port, &mut dma, &[0x0C, 1, 0x10], true);
        reply(&mut port);
        port.raise(Status::DMA_FAULT);
        assert_eq!(port.status_bytes(), [0, 2, Status::DMA_FAULT.bits(), 0]);
    }
}
