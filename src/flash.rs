//! SPI flash programmer
//!
//! While the bridge is off, the bulk pipe carries flash requests instead
//! of frames. Each USB transfer from the host is one request:
//!
//! | Request                      | Reply                    |
//! | ---------------------------- | ------------------------ |
//! | `9F`                         | `ACK` + 3 byte JEDEC id  |
//! | `03 a2 a1 a0 n`              | `ACK` + `n` bytes (0: 256) |
//! | `20 a2 a1 a0`                | `ACK` once erased        |
//! | `02 a2 a1 a0 data(1..=256)`  | `ACK` once programmed    |
//! | `FF`                         | `ACK`, then back to the bridge |
//!
//! Anything else, or a request that doesn't fit, replies `ERROR`.
//!
//! The flash programmer borrows the bridge's DMA channels,
//! [`DMA_FLASH_TX`] and [`DMA_FLASH_RX`]. SPI is full duplex; every
//! exchange clocks a buffer out and receives into the same buffer, and
//! completes on the receive channel.

use crate::{
    dma::{Dma, Dmac, Transfer},
    frame::Reply,
    pipe::{InTransfer, Pipe, MAX_PACKET},
    resources::{DMA_FLASH_RX, DMA_FLASH_TX},
};
use core::ops::Range;
use usb_device::UsbError;

/// Flash request opcodes
pub mod op {
    pub const ID: u8 = 0x9F;
    pub const READ: u8 = 0x03;
    pub const ERASE: u8 = 0x20;
    pub const PROGRAM: u8 = 0x02;
    pub const EXIT: u8 = 0xFF;
}

const WRITE_ENABLE: u8 = 0x06;
const READ_STATUS: u8 = 0x05;
/// Write in progress
const STATUS_WIP: u8 = 1 << 0;

/// Opcode and a 24 bit address
const HEADER: usize = 4;
const PAGE: usize = 256;
const REPLY_SIZE: usize = 1 + PAGE;

/// The chip select and SPI data register of the flash
///
/// # Safety
///
/// `data_register` must return the SPI data register. The DMA controller
/// reads and writes it while exchanges run.
pub unsafe trait FlashHardware {
    /// Claim the SPI peripheral and the pins
    fn enable(&mut self);
    fn disable(&mut self);
    /// Assert chip select
    fn select(&mut self);
    /// Release chip select
    fn deselect(&mut self);
    fn data_register(&self) -> *mut u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Receiving,
    WriteEnable,
    Command,
    Polling,
    /// The pipe refused the reply; try again on the next pipe event
    ReplyPending,
    Replying,
}

/// Things the runtime acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    /// The host is done; return the pipe to the bridge
    Exit,
}

/// Flash programmer state
pub struct Flash {
    state: State,
    /// Opcode of the running request; the exchange overwrites the buffer
    op: u8,
    buf: [u8; HEADER + PAGE],
    len: usize,
    overflow: bool,
    /// Bytes exchanged in the command phase
    xfer_len: usize,
    /// Write enable and status polls
    small: [u8; 2],
    reply: InTransfer<REPLY_SIZE>,
    reply_len: usize,
    exit: bool,
}

impl Flash {
    pub const fn new() -> Self {
        Flash {
            state: State::Idle,
            op: 0,
            buf: [0; HEADER + PAGE],
            len: 0,
            overflow: false,
            xfer_len: 0,
            small: [0; 2],
            reply: InTransfer::new(),
            reply_len: 0,
            exit: false,
        }
    }

    /// Claim the flash, and wait for the first request
    ///
    /// # Safety
    ///
    /// The flash buffers are DMA targets. `Flash` must not move until it's
    /// disabled. The bridge must be disabled, since the two share DMA
    /// channels and USB endpoints.
    pub unsafe fn enable<H: FlashHardware>(&mut self, hw: &mut H) {
        hw.enable();
        self.reset();
        debug!("Flash enabled");
    }

    /// Abort any exchange, and release the flash
    pub fn disable<D: Dmac, H: FlashHardware>(&mut self, dma: &mut Dma<D>, hw: &mut H) {
        dma.abort(DMA_FLASH_TX);
        dma.abort(DMA_FLASH_RX);
        hw.deselect();
        hw.disable();
        self.reset();
        debug!("Flash disabled");
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.len = 0;
        self.overflow = false;
        self.xfer_len = 0;
        self.exit = false;
        self.reply_len = 0;
        self.reply.cancel();
    }

    /// Indicates if the programmer is waiting for a request
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Collect request packets
    ///
    /// Reads until the pipe runs dry, or the request ends with a short
    /// packet. Packets are left in the pipe while a request is running.
    pub fn usb_out_completion<P: Pipe, D: Dmac, H: FlashHardware>(
        &mut self,
        pipe: &mut P,
        dma: &mut Dma<D>,
        hw: &mut H,
    ) {
        if self.state == State::ReplyPending {
            self.send_reply(pipe);
            return;
        }
        let mut packet = [0u8; MAX_PACKET];
        while matches!(self.state, State::Idle | State::Receiving) {
            let count = match pipe.read_packet(&mut packet) {
                Ok(count) => count,
                Err(UsbError::WouldBlock) => return,
                Err(_err) => {
                    warn!("Flash OUT read failed: {:?}", _err);
                    return;
                }
            };
            let take = count.min(self.buf.len() - self.len);
            self.buf[self.len..self.len + take].copy_from_slice(&packet[..take]);
            self.len += take;
            self.overflow |= take < count;
            self.state = State::Receiving;
            if count < pipe.max_packet_size() {
                self.execute(pipe, dma, hw);
            }
        }
    }

    fn execute<P: Pipe, D: Dmac, H: FlashHardware>(
        &mut self,
        pipe: &mut P,
        dma: &mut Dma<D>,
        hw: &mut H,
    ) {
        if self.overflow || self.len == 0 {
            warn!("Flash request of {} bytes refused", self.len);
            return self.reply(Reply::Error, 0..0, pipe);
        }
        self.op = self.buf[0];
        trace!("Flash op {} with {} bytes", self.op, self.len);
        match self.op {
            op::ID => {
                self.buf[1..HEADER].fill(0);
                self.xfer_len = HEADER;
                self.command(dma, hw);
            }
            op::READ if self.len > HEADER => {
                let count = match self.buf[HEADER] {
                    0 => PAGE,
                    n => n as usize,
                };
                self.xfer_len = HEADER + count;
                self.command(dma, hw);
            }
            op::ERASE if self.len >= HEADER => {
                self.xfer_len = HEADER;
                self.write_enable(dma, hw);
            }
            op::PROGRAM if self.len > HEADER => {
                self.xfer_len = self.len;
                self.write_enable(dma, hw);
            }
            op::EXIT => {
                self.exit = true;
                self.reply(Reply::Ack, 0..0, pipe);
            }
            _ => self.reply(Reply::Error, 0..0, pipe),
        }
    }

    fn write_enable<D: Dmac, H: FlashHardware>(&mut self, dma: &mut Dma<D>, hw: &mut H) {
        self.small[0] = WRITE_ENABLE;
        let ptr = self.small.as_mut_ptr();
        // Safety: the buffer is inside Flash, pinned while enabled.
        unsafe { exchange(dma, hw, ptr, 1) };
        self.state = State::WriteEnable;
    }

    fn command<D: Dmac, H: FlashHardware>(&mut self, dma: &mut Dma<D>, hw: &mut H) {
        let ptr = self.buf.as_mut_ptr();
        // Safety: see write_enable. xfer_len is at most the buffer size.
        unsafe { exchange(dma, hw, ptr, self.xfer_len) };
        self.state = State::Command;
    }

    fn poll_status<D: Dmac, H: FlashHardware>(&mut self, dma: &mut Dma<D>, hw: &mut H) {
        self.small = [READ_STATUS, 0];
        let ptr = self.small.as_mut_ptr();
        // Safety: see write_enable.
        unsafe { exchange(dma, hw, ptr, 2) };
        self.state = State::Polling;
    }

    fn reply<P: Pipe>(&mut self, reply: Reply, data: Range<usize>, pipe: &mut P) {
        let len = data.len();
        let out = self.reply.buffer_mut();
        out[0] = reply.code();
        out[1..1 + len].copy_from_slice(&self.buf[data]);
        self.reply_len = 1 + len;
        self.send_reply(pipe);
    }

    /// Start the prepared reply, or leave it pending if the pipe refuses
    fn send_reply<P: Pipe>(&mut self, pipe: &mut P) {
        match self.reply.start(self.reply_len, pipe) {
            Ok(()) => self.state = State::Replying,
            Err(_err) => {
                warn!("Flash reply deferred: {:?}", _err);
                self.state = State::ReplyPending;
            }
        }
    }

    /// An SPI exchange finished
    pub fn dma_rx_completion<P: Pipe, D: Dmac, H: FlashHardware>(
        &mut self,
        pipe: &mut P,
        dma: &mut Dma<D>,
        hw: &mut H,
    ) {
        hw.deselect();
        match self.state {
            State::WriteEnable => self.command(dma, hw),
            State::Command => match self.op {
                op::ID => self.reply(Reply::Ack, 1..HEADER, pipe),
                op::READ => self.reply(Reply::Ack, HEADER..self.xfer_len, pipe),
                _ => self.poll_status(dma, hw),
            },
            State::Polling if self.small[1] & STATUS_WIP != 0 => self.poll_status(dma, hw),
            State::Polling => self.reply(Reply::Ack, 0..0, pipe),
            _ => {}
        }
    }

    /// An SPI exchange failed
    pub fn dma_error<P: Pipe, D: Dmac, H: FlashHardware>(
        &mut self,
        pipe: &mut P,
        dma: &mut Dma<D>,
        hw: &mut H,
    ) {
        dma.abort(DMA_FLASH_TX);
        dma.abort(DMA_FLASH_RX);
        hw.deselect();
        if matches!(
            self.state,
            State::WriteEnable | State::Command | State::Polling
        ) {
            warn!("Flash exchange failed");
            self.reply(Reply::Error, 0..0, pipe);
        }
    }

    /// The IN endpoint finished a packet
    pub fn usb_in_completion<P: Pipe>(&mut self, pipe: &mut P) -> Option<FlashEvent> {
        if self.state == State::ReplyPending {
            self.send_reply(pipe);
            return None;
        }
        if self.state != State::Replying || !self.reply.on_complete(pipe) {
            return None;
        }
        self.state = State::Idle;
        self.len = 0;
        self.overflow = false;
        core::mem::take(&mut self.exit).then_some(FlashEvent::Exit)
    }
}

impl Default for Flash {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock `len` bytes out of `buf`, and receive into `buf`
///
/// # Safety
///
/// `buf` must stay valid for `len` bytes until the receive completes, or
/// both channels are aborted.
unsafe fn exchange<D: Dmac, H: FlashHardware>(
    dma: &mut Dma<D>,
    hw: &mut H,
    buf: *mut u8,
    len: usize,
) {
    let data = hw.data_register();
    hw.select();
    dma.start(DMA_FLASH_RX, Transfer::from_peripheral(data, buf, len as u16));
    dma.start(DMA_FLASH_TX, Transfer::to_peripheral(buf, len as u16, data));
}

#[cfg(test)]
mod test {
    use super::{op, Flash, FlashEvent};
    use crate::{
        dma::Dma,
        resources::{DMA_FLASH_RX, DMA_FLASH_TX},
        testing::{self, FakeDmac, FakeFlash, FakePipe},
    };

    struct Rig {
        flash: std::boxed::Box<Flash>,
        dma: Dma<FakeDmac>,
        hw: FakeFlash,
        pipe: FakePipe,
    }

    impl Rig {
        fn new() -> Self {
            let mut rig = Rig {
                flash: std::boxed::Box::new(Flash::new()),
                dma: Dma::new(FakeDmac::default()),
                hw: FakeFlash::default(),
                pipe: FakePipe::new(),
            };
            // Safety: boxed, so it won't move.
            unsafe { rig.flash.enable(&mut rig.hw) };
            rig
        }

        fn request(&mut self, bytes: &[u8]) {
            self.pipe.host_transfer(bytes);
            self.flash
                .usb_out_completion(&mut self.pipe, &mut self.dma, &mut self.hw);
        }

        /// Run one SPI exchange, with the flash answering `response`
        fn exchange(&mut self, response: &[u8]) -> std::vec::Vec<u8> {
            let before = self.dma.dmac().sent(DMA_FLASH_TX).len();
            self.dma.dmac_mut().feed(DMA_FLASH_RX, response);
            assert!(testing::run(&mut self.dma, DMA_FLASH_TX));
            assert!(testing::run(&mut self.dma, DMA_FLASH_RX));
            assert!(self.hw.selected);
            self.flash
                .dma_rx_completion(&mut self.pipe, &mut self.dma, &mut self.hw);
            self.dma.dmac().sent(DMA_FLASH_TX)[before..].to_vec()
        }

        /// Collect a reply
        fn reply(&mut self) -> (std::vec::Vec<u8>, Option<FlashEvent>) {
            let mut reply = std::vec::Vec::new();
            loop {
                let packet = self.pipe.written().last().cloned().unwrap_or_default();
                reply.extend(packet);
                self.pipe.complete_in();
                if let Some(event) = self.flash.usb_in_completion(&mut self.pipe) {
                    return (reply, Some(event));
                }
                if self.flash.is_idle() {
                    return (reply, None);
                }
            }
        }
    }

    #[test]
    fn jedec_id() {
        let mut rig = Rig::new();
        rig.request(&[op::ID]);
        assert_eq!(rig.exchange(&[0xFF, 0xEF, 0x40, 0x18]), [0x9F, 0, 0, 0]);
        assert!(!rig.hw.selected);
        assert_eq!(rig.reply(), (std::vec![0x80, 0xEF, 0x40, 0x18], None));
    }

    #[test]
    fn read() {
        let mut rig = Rig::new();
        rig.request(&[op::READ, 0x01, 0x02, 0x03, 4]);
        let sent = rig.exchange(&[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(&sent[..4], &[0x03, 0x01, 0x02, 0x03]);
        assert_eq!(rig.reply(), (std::vec![0x80, 1, 2, 3, 4], None));
    }

    #[test]
    fn read_whole_page() {
        let mut rig = Rig::new();
        rig.request(&[op::READ, 0, 0, 0, 0]);
        let page: std::vec::Vec<u8> = (0..=255).collect();
        let response: std::vec::Vec<u8> = [0; 4].into_iter().chain(page.iter().copied()).collect();
        assert_eq!(rig.exchange(&response).len(), 260);
        let (reply, _) = rig.reply();
        assert_eq!(reply[0], 0x80);
        assert_eq!(&reply[1..], &page[..]);
        let sizes: std::vec::Vec<_> = rig.pipe.written().iter().map(|p| p.len()).collect();
        assert_eq!(sizes, [64, 64, 64, 64, 1]);
    }

    #[test]
    fn program_page() {
        let mut rig = Rig::new();
        let mut request = std::vec![op::PROGRAM, 0x00, 0x10, 0x00];
        request.extend((0..=255u8).rev());
        rig.request(&request);

        assert_eq!(rig.exchange(&[0xFF]), [0x06]);
        assert_eq!(rig.exchange(&[0xFF; 260]), request);
        assert_eq!(rig.exchange(&[0xFF, 0x03]), [0x05, 0]);
        assert_eq!(rig.exchange(&[0xFF, 0x01]), [0x05, 0]);
        assert!(rig.pipe.written().is_empty());
        assert_eq!(rig.exchange(&[0xFF, 0x00]), [0x05, 0]);
        assert_eq!(rig.reply(), (std::vec![0x80], None));
        assert_eq!(rig.hw.selects, 5);
    }

    #[test]
    fn erase_sector() {
        let mut rig = Rig::new();
        rig.request(&[op::ERASE, 0x00, 0x20, 0x00]);
        assert_eq!(rig.exchange(&[0xFF]), [0x06]);
        assert_eq!(rig.exchange(&[0xFF; 4]), [0x20, 0x00, 0x20, 0x00]);
        assert_eq!(rig.exchange(&[0xFF, 0x00]), [0x05, 0]);
        assert_eq!(rig.reply(), (std::vec![0x80], None));
    }

    #[test]
    fn oversize_and_unknown_requests() {
        let mut rig = Rig::new();
        rig.request(&[op::PROGRAM; 300]);
        assert!(!rig.dma.is_active(DMA_FLASH_TX));
        assert_eq!(rig.reply(), (std::vec![0x85], None));

        rig.request(&[0x42]);
        assert_eq!(rig.reply(), (std::vec![0x85], None));

        rig.request(&[op::READ, 0, 0]);
        assert_eq!(rig.reply(), (std::vec![0x85], None));
    }

    #[test]
    fn exit_after_ack() {
        let mut rig = Rig::new();
        rig.request(&[op::EXIT]);
        assert_eq!(rig.reply(), (std::vec![0x80], Some(FlashEvent::Exit)));
    }

    #[test]
    fn requests_wait_while_busy() {
        let mut rig = Rig::new();
        rig.request(&[op::ERASE, 0, 0, 0]);
        rig.request(&[op::ID]);
        assert_eq!(rig.exchange(&[0xFF]), [0x06]);
        assert_eq!(rig.exchange(&[0xFF; 4]), [0x20, 0, 0, 0]);
        assert_eq!(rig.exchange(&[0xFF, 0x00]), [0x05, 0]);
        assert_eq!(rig.reply(), (std::vec![0x80], None));

        rig.flash
            .usb_out_completion(&mut rig.pipe, &mut rig.dma, &mut rig.hw);
        assert_eq!(rig.exchange(&[0, 1, 2, 3]), [0x9F, 0, 0, 0]);
    }

    #[test]
    fn disable_aborts() {
        let mut rig = Rig::new();
        rig.request(&[op::ERASE, 0, 0, 0]);
        assert!(rig.dma.is_active(DMA_FLASH_RX));
        rig.flash.disable(&mut rig.dma, &mut rig.hw);
        assert!(!rig.dma.is_active(DMA_FLASH_RX));
        assert!(!rig.dma.is_active(DMA_FLASH_TX));
        assert!(!rig.hw.selected);
        assert!(!rig.hw.enabled);
        assert!(rig.flash.is_idle());
    }

    #[test]
    fn reply_waits_for_a_busy_pipe() {
        let mut rig = Rig::new();
        rig.request(&[op::ID]);
        rig.pipe.hold_in();
        rig.exchange(&[0xFF, 0xEF, 0x40, 0x18]);
        assert!(rig.pipe.written().is_empty());
        assert!(!rig.flash.is_idle());

        // Requests wait behind the owed reply.
        rig.request(&[op::ID]);
        assert!(!rig.hw.selected);

        rig.pipe.complete_in();
        assert_eq!(rig.flash.usb_in_completion(&mut rig.pipe), None);
        assert_eq!(rig.reply(), (std::vec![0x80, 0xEF, 0x40, 0x18], None));

        rig.flash
            .usb_out_completion(&mut rig.pipe, &mut rig.dma, &mut rig.hw);
        assert_eq!(rig.exchange(&[0, 1, 2, 3]), [0x9F, 0, 0, 0]);
    }

    #[test]
    fn dma_error_replies() {
        let mut rig = Rig::new();
        rig.request(&[op::ID]);
        rig.flash
            .dma_error(&mut rig.pipe, &mut rig.dma, &mut rig.hw);
        assert!(!rig.hw.selected);
        assert_eq!(rig.reply(), (std::vec![0x85], None));
    }
}
