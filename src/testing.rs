//! Host-side stand-ins for the hardware
//!
//! `FakeDmac` doesn't run anything on its own. Tests call [`run`] to carry
//! out the transfer described by a channel's descriptor, the way the
//! controller would.

use crate::{
    bridge::Chunk,
    dma::{Dma, DmaChan, Dmac},
    flash::FlashHardware,
    pipe::{Pipe, PipeEvents, MAX_PACKET},
    port::{Mode, PinConfig, PinTrigger, Port, PortHardware, PORT_PINS},
    resources::DMA_CHANNEL_COUNT,
    runtime::Board,
};
use std::{collections::VecDeque, vec::Vec};
use usb_device::UsbError;

/// Never dereferenced; peripheral sides of transfers are simulated
const FAKE_DATA_REGISTER: usize = 0x4200_0828;

#[derive(Default)]
pub struct FakeDmac {
    /// Bytes written to each channel's peripheral
    sent: [Vec<u8>; DMA_CHANNEL_COUNT],
    /// Bytes each channel's peripheral will produce
    feeds: [VecDeque<u8>; DMA_CHANNEL_COUNT],
    pub starts: Vec<DmaChan>,
    pub aborts: Vec<DmaChan>,
}

impl FakeDmac {
    pub fn feed(&mut self, chan: DmaChan, bytes: &[u8]) {
        self.feeds[chan.0 as usize].extend(bytes);
    }

    pub fn sent(&self, chan: DmaChan) -> &[u8] {
        &self.sent[chan.0 as usize]
    }
}

unsafe impl Dmac for FakeDmac {
    fn start(&mut self, chan: DmaChan) {
        self.starts.push(chan);
    }

    fn abort(&mut self, chan: DmaChan) {
        self.aborts.push(chan);
    }
}

/// Complete the transfer running on `chan`
///
/// Returns `false`, and leaves the channel running, if it isn't active or
/// if its peripheral hasn't been fed enough bytes.
pub fn run(dma: &mut Dma<FakeDmac>, chan: DmaChan) -> bool {
    if !dma.is_active(chan) {
        return false;
    }
    let xfer = dma.descriptor(chan).transfer();
    let count = xfer.count as usize;
    let src = xfer.src as *const u8;
    let dst = xfer.dst as *mut u8;
    let idx = chan.0 as usize;
    match (xfer.src_inc, xfer.dst_inc) {
        (src_inc, false) => {
            let bytes = (0..count).map(|i| {
                // Safety: the transfer's owner keeps the source valid.
                unsafe { *src.add(if src_inc { i } else { 0 }) }
            });
            let bytes: Vec<u8> = bytes.collect();
            dma.dmac_mut().sent[idx].extend(bytes);
        }
        (false, true) => {
            let feed = &mut dma.dmac_mut().feeds[idx];
            if feed.len() < count {
                return false;
            }
            for (i, byte) in feed.drain(..count).enumerate() {
                // Safety: the transfer's owner keeps the destination valid.
                unsafe { *dst.add(i) = byte };
            }
        }
        (true, true) => unsafe { core::ptr::copy(src, dst, count) },
    }
    dma.retire(chan);
    true
}

/// Hand `bytes` to a port, like the bridge would
pub fn feed(port: &mut Port<FakePort>, dma: &mut Dma<FakeDmac>, bytes: &[u8], last: bool) {
    let inbound = port.poll_inbound().expect("port isn't accepting data");
    let len = bytes.len().min(inbound.capacity());
    // Safety: the port handed out this buffer, and it's large enough.
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), inbound.as_ptr(), len) };
    port.bridge_out_completion(
        Chunk {
            len,
            dropped: bytes.len() - len,
            last,
        },
        dma,
    );
}

/// Both ends of a bulk endpoint pair
pub struct FakePipe {
    out: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    in_busy: bool,
    events: PipeEvents,
}

impl FakePipe {
    pub fn new() -> Self {
        FakePipe {
            out: VecDeque::new(),
            written: Vec::new(),
            in_busy: false,
            events: PipeEvents::empty(),
        }
    }

    /// Queue a host transfer as OUT packets, ending with a short packet
    pub fn host_transfer(&mut self, bytes: &[u8]) {
        self.out.extend(bytes.chunks(MAX_PACKET).map(<[u8]>::to_vec));
        if bytes.len() % MAX_PACKET == 0 {
            self.out.push_back(Vec::new());
        }
        self.events |= PipeEvents::OUT_READY;
    }

    /// The host took the IN packet
    pub fn complete_in(&mut self) {
        assert!(self.in_busy, "no IN packet to complete");
        self.in_busy = false;
        self.events |= PipeEvents::IN_COMPLETE;
    }

    /// Keep the IN endpoint busy, as if another packet were on its way
    pub fn hold_in(&mut self) {
        self.in_busy = true;
    }

    pub fn in_busy(&self) -> bool {
        self.in_busy
    }

    /// Every IN packet so far
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    /// Concatenate the IN packets into transfers, and forget them
    pub fn take_transfers(&mut self) -> Vec<Vec<u8>> {
        let mut transfers = Vec::new();
        let mut current = Vec::new();
        for packet in self.written.drain(..) {
            let short = packet.len() < MAX_PACKET;
            current.extend(packet);
            if short {
                transfers.push(core::mem::take(&mut current));
            }
        }
        assert!(current.is_empty(), "unfinished IN transfer");
        transfers
    }

    pub fn pending_out(&self) -> usize {
        self.out.len()
    }
}

impl Pipe for FakePipe {
    fn max_packet_size(&self) -> usize {
        MAX_PACKET
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<usize, UsbError> {
        if self.in_busy {
            return Err(UsbError::WouldBlock);
        }
        self.written.push(packet.to_vec());
        self.in_busy = true;
        Ok(packet.len())
    }

    fn read_packet(&mut self, packet: &mut [u8]) -> Result<usize, UsbError> {
        let next = self.out.front().ok_or(UsbError::WouldBlock)?;
        if next.len() > packet.len() {
            return Err(UsbError::BufferOverflow);
        }
        let len = next.len();
        packet[..len].copy_from_slice(next);
        self.out.pop_front();
        Ok(len)
    }

    fn take_events(&mut self) -> PipeEvents {
        core::mem::replace(&mut self.events, PipeEvents::empty())
    }
}

pub struct FakePort {
    pub enables: u32,
    pub clock: Option<u8>,
    pub config: Option<(Mode, Vec<u8>)>,
    pub pins: [bool; PORT_PINS as usize],
    pub pin_configs: [PinConfig; PORT_PINS as usize],
    pub triggers: [PinTrigger; PORT_PINS as usize],
    pub i2c_addr: Option<u8>,
    pub nack: bool,
}

impl Default for FakePort {
    fn default() -> Self {
        FakePort {
            enables: 0,
            clock: None,
            config: None,
            pins: [false; PORT_PINS as usize],
            pin_configs: [PinConfig::empty(); PORT_PINS as usize],
            triggers: [PinTrigger::Disabled; PORT_PINS as usize],
            i2c_addr: None,
            nack: false,
        }
    }
}

unsafe impl PortHardware for FakePort {
    fn enable(&mut self, clock_channel: u8) {
        self.enables += 1;
        self.clock = Some(clock_channel);
    }

    fn disable(&mut self) {
        self.clock = None;
        self.config = None;
    }

    fn configure(&mut self, mode: Mode, args: &[u8]) {
        self.config = Some((mode, args.to_vec()));
    }

    fn data_register(&self) -> *mut u8 {
        FAKE_DATA_REGISTER as *mut u8
    }

    fn pin_set(&mut self, pin: u8, high: bool) {
        self.pins[pin as usize] = high;
    }

    fn pin_toggle(&mut self, pin: u8) {
        self.pins[pin as usize] ^= true;
    }

    fn pin_read(&mut self, pin: u8) -> bool {
        self.pins[pin as usize]
    }

    fn pin_configure(&mut self, pin: u8, config: PinConfig) {
        self.pin_configs[pin as usize] = config;
    }

    fn pin_interrupt(&mut self, pin: u8, trigger: PinTrigger) {
        self.triggers[pin as usize] = trigger;
    }

    fn i2c_start(&mut self, addr: u8) -> bool {
        self.i2c_addr = Some(addr);
        true
    }

    fn i2c_stop(&mut self) {
        self.i2c_addr = None;
    }

    fn i2c_nacked(&mut self) -> bool {
        self.nack
    }
}

#[derive(Default)]
pub struct FakeFlash {
    pub enabled: bool,
    pub selected: bool,
    pub selects: u32,
}

unsafe impl FlashHardware for FakeFlash {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn select(&mut self) {
        assert!(!self.selected, "chip select asserted twice");
        self.selected = true;
        self.selects += 1;
    }

    fn deselect(&mut self) {
        self.selected = false;
    }

    fn data_register(&self) -> *mut u8 {
        FAKE_DATA_REGISTER as *mut u8
    }
}

pub struct TestBoard;

impl Board for TestBoard {
    type Dmac = FakeDmac;
    type Pipe = FakePipe;
    type Port = FakePort;
    type Flash = FakeFlash;
}
