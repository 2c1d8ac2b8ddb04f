//! Bridge multiplexer
//!
//! The bridge shares one bulk pipe between the host control channel and
//! the two ports. Every USB transfer from the host is one frame, and its
//! first byte names the channel. The bridge copies the rest of the frame,
//! packet by packet, into the buffer the channel armed with
//! [`start_inbound`](Bridge::start_inbound). Copies run on
//! [`DMA_BRIDGE_RX`](crate::resources::DMA_BRIDGE_RX).
//!
//! Toward the host, channels hand finished frames to
//! [`start_outbound`](Bridge::start_outbound). One frame is on the wire at a
//! time. Others wait their turn, at most one per channel.
//!
//! Each channel has at most one inbound and one outbound transfer. Since
//! there's only one OUT endpoint, only one inbound copy runs at a time; a
//! packet for a channel that hasn't armed a buffer waits in the bridge, and
//! holds up the pipe until the channel catches up.

use crate::{
    dma::{Dma, Dmac, Transfer},
    frame::{ChannelId, BRIDGE_BUF_SIZE, BRIDGE_NUM_CHAN},
    pipe::{InTransfer, Pipe, MAX_PACKET},
    resources::DMA_BRIDGE_RX,
};
use usb_device::UsbError;

/// A destination for inbound frame bytes
#[derive(Debug)]
pub struct Inbound {
    ptr: *mut u8,
    capacity: usize,
}

// Safety: an Inbound points into a buffer of the channel that armed it. The
// runtime owns both, and moves them together.
unsafe impl Send for Inbound {}

impl Inbound {
    /// `capacity` bytes, starting at `ptr`
    pub fn new(ptr: *mut u8, capacity: usize) -> Self {
        Inbound { ptr, capacity }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Bytes delivered into an [`Inbound`] buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes written to the buffer
    pub len: usize,
    /// Bytes that didn't fit, and were dropped
    pub dropped: usize,
    /// This chunk ends the frame
    pub last: bool,
}

/// Bridge errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The channel already has a transfer in that direction
    Busy,
    /// The frame doesn't fit in a bridge buffer
    Oversize,
    /// The pipe refused the transfer
    Usb(UsbError),
}

/// What an OUT packet turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutEvent {
    /// A chunk landed without a DMA copy
    Chunk(ChannelId, Chunk),
    /// A frame named a channel that doesn't exist
    ///
    /// The rest of the transfer is discarded.
    Rejected(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outbound {
    Idle,
    /// Ready, waiting for the pipe
    Queued,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rx {
    Empty,
    /// Waiting for the channel to arm a buffer. The payload starts at `start`.
    Held {
        chan: ChannelId,
        start: usize,
        last: bool,
    },
    /// DMA copy into the channel's buffer
    Copying {
        chan: ChannelId,
        len: usize,
        dropped: usize,
        last: bool,
    },
}

/// Routes frames between the pipe and the channels
pub struct Bridge {
    inbound: [Option<Inbound>; BRIDGE_NUM_CHAN],
    outbound: [Outbound; BRIDGE_NUM_CHAN],

    packet: [u8; MAX_PACKET],
    packet_len: usize,
    rx: Rx,
    /// Channel of the host transfer in progress, once its first packet is in
    frame_chan: Option<ChannelId>,
    /// Dropping packets until the end of the current host transfer
    discard: bool,

    tx: InTransfer<BRIDGE_BUF_SIZE>,
    tx_chan: Option<ChannelId>,
    /// Where the search for a queued channel starts
    next_queued: usize,
}

const CHANNELS: [ChannelId; BRIDGE_NUM_CHAN] =
    [ChannelId::Control, ChannelId::PortA, ChannelId::PortB];

impl Bridge {
    pub const fn new() -> Self {
        Bridge {
            inbound: [None, None, None],
            outbound: [Outbound::Idle; BRIDGE_NUM_CHAN],
            packet: [0; MAX_PACKET],
            packet_len: 0,
            rx: Rx::Empty,
            frame_chan: None,
            discard: false,
            tx: InTransfer::new(),
            tx_chan: None,
            next_queued: 0,
        }
    }

    /// Indicates if `chan` has an outbound frame, queued or in flight
    pub fn outbound_pending(&self, chan: ChannelId) -> bool {
        self.outbound[chan.index()] != Outbound::Idle
    }

    /// Indicates if `chan` has armed an inbound buffer
    pub fn inbound_pending(&self, chan: ChannelId) -> bool {
        self.inbound[chan.index()].is_some()
    }

    /// Send `frame` to the host on behalf of `chan`
    ///
    /// If another frame is on the wire, this one is queued; pick it up with
    /// [`queued`](Bridge::queued) and [`resume_outbound`](Bridge::resume_outbound)
    /// after the next IN completion. Until then, `frame` must stay as is.
    pub fn start_outbound<P: Pipe>(
        &mut self,
        chan: ChannelId,
        frame: &[u8],
        pipe: &mut P,
    ) -> Result<(), Error> {
        if self.outbound_pending(chan) {
            return Err(Error::Busy);
        }
        if frame.len() > BRIDGE_BUF_SIZE {
            return Err(Error::Oversize);
        }
        if self.tx.is_active() {
            trace!("Bridge queued {} bytes for {:?}", frame.len(), chan);
            self.outbound[chan.index()] = Outbound::Queued;
            return Ok(());
        }
        self.send(chan, frame, pipe)
    }

    /// The next queued channel, if the pipe is free to take it
    pub fn queued(&self) -> Option<ChannelId> {
        if self.tx.is_active() {
            return None;
        }
        (0..BRIDGE_NUM_CHAN)
            .map(|offset| CHANNELS[(self.next_queued + offset) % BRIDGE_NUM_CHAN])
            .find(|chan| self.outbound[chan.index()] == Outbound::Queued)
    }

    /// Send the frame `chan` queued with [`start_outbound`](Bridge::start_outbound)
    pub fn resume_outbound<P: Pipe>(
        &mut self,
        chan: ChannelId,
        frame: &[u8],
        pipe: &mut P,
    ) -> Result<(), Error> {
        if self.outbound[chan.index()] != Outbound::Queued || self.tx.is_active() {
            return Err(Error::Busy);
        }
        if frame.len() > BRIDGE_BUF_SIZE {
            self.outbound[chan.index()] = Outbound::Idle;
            return Err(Error::Oversize);
        }
        self.send(chan, frame, pipe)
    }

    fn send<P: Pipe>(&mut self, chan: ChannelId, frame: &[u8], pipe: &mut P) -> Result<(), Error> {
        self.tx.buffer_mut()[..frame.len()].copy_from_slice(frame);
        match self.tx.start(frame.len(), pipe) {
            Ok(()) => {
                trace!("Bridge sending {} bytes for {:?}", frame.len(), chan);
                self.outbound[chan.index()] = Outbound::InFlight;
                self.tx_chan = Some(chan);
                self.next_queued = (chan.index() + 1) % BRIDGE_NUM_CHAN;
                Ok(())
            }
            Err(UsbError::WouldBlock) => {
                self.outbound[chan.index()] = Outbound::Queued;
                Ok(())
            }
            Err(err) => {
                warn!("Bridge couldn't send for {:?}: {:?}", chan, err);
                self.outbound[chan.index()] = Outbound::Idle;
                Err(Error::Usb(err))
            }
        }
    }

    /// The IN endpoint finished a packet
    ///
    /// Returns the channel whose frame is now completely sent. Only that
    /// channel's outbound transfer is released.
    pub fn on_usb_in_completion<P: Pipe>(&mut self, pipe: &mut P) -> Option<ChannelId> {
        if !self.tx.on_complete(pipe) {
            return None;
        }
        let chan = self.tx_chan.take()?;
        self.outbound[chan.index()] = Outbound::Idle;
        Some(chan)
    }

    /// Arm `chan` to receive its next chunk into `dst`
    ///
    /// # Safety
    ///
    /// `dst` must stay valid, and untouched, until the chunk is delivered or
    /// `chan` is cancelled. The bridge must not move in that time.
    pub unsafe fn start_inbound(&mut self, chan: ChannelId, dst: Inbound) -> Result<(), Error> {
        let slot = &mut self.inbound[chan.index()];
        if slot.is_some() {
            return Err(Error::Busy);
        }
        *slot = Some(dst);
        Ok(())
    }

    /// Move the OUT pipe along
    ///
    /// Takes the next packet from the pipe, unless one is already waiting,
    /// and copies it toward its channel if the channel is armed. Call this
    /// when the OUT endpoint has data, and whenever a channel arms a buffer.
    /// Returns an event when there's something to deliver right away;
    /// otherwise, a DMA copy may be running. Keep calling while it returns
    /// `Some`.
    pub fn on_usb_out_completion<P: Pipe, D: Dmac>(
        &mut self,
        pipe: &mut P,
        dma: &mut Dma<D>,
    ) -> Option<OutEvent> {
        if self.rx == Rx::Empty {
            if let Some(rejected) = self.read_packet(pipe) {
                return Some(OutEvent::Rejected(rejected));
            }
        }

        let Rx::Held { chan, start, last } = self.rx else {
            return None;
        };
        let dst = self.inbound[chan.index()].as_ref()?;

        let payload = self.packet_len - start;
        let len = payload.min(dst.capacity());
        let dropped = payload - len;
        if len == 0 {
            self.inbound[chan.index()] = None;
            self.rx = Rx::Empty;
            return Some(OutEvent::Chunk(chan, Chunk { len, dropped, last }));
        }

        let src = self.packet[start..].as_ptr();
        // Safety: the destination was promised by start_inbound. The packet
        // buffer isn't touched until the copy completes or is aborted.
        unsafe {
            dma.start(DMA_BRIDGE_RX, Transfer::copy(src, dst.as_ptr(), len as u16));
        }
        self.rx = Rx::Copying {
            chan,
            len,
            dropped,
            last,
        };
        None
    }

    /// Read the next packet, and work out which channel it's for
    ///
    /// Returns the wire id of a frame that named an unknown channel.
    fn read_packet<P: Pipe>(&mut self, pipe: &mut P) -> Option<u8> {
        let len = match pipe.read_packet(&mut self.packet) {
            Ok(len) => len,
            Err(UsbError::WouldBlock) => return None,
            Err(_err) => {
                warn!("Bridge OUT read failed: {:?}", _err);
                return None;
            }
        };
        let last = len < pipe.max_packet_size();
        self.packet_len = len;

        if self.discard {
            self.discard = !last;
            return None;
        }

        let (chan, start) = match self.frame_chan {
            Some(chan) => (chan, 0),
            None if len == 0 => return None,
            None => match ChannelId::from_id(self.packet[0]) {
                Some(chan) => (chan, 1),
                None => {
                    warn!("Bridge rejected frame for channel {}", self.packet[0]);
                    self.discard = !last;
                    return Some(self.packet[0]);
                }
            },
        };
        self.frame_chan = if last { None } else { Some(chan) };
        trace!("Bridge OUT {} bytes for {:?}", len, chan);
        self.rx = Rx::Held { chan, start, last };
        None
    }

    /// The inbound DMA copy finished
    ///
    /// The channel's inbound slot is released before the chunk is handed
    /// back, so the channel may arm its next buffer right away.
    pub fn bridge_dma_rx_completion(&mut self) -> Option<(ChannelId, Chunk)> {
        let Rx::Copying {
            chan,
            len,
            dropped,
            last,
        } = self.rx
        else {
            return None;
        };
        self.inbound[chan.index()] = None;
        self.rx = Rx::Empty;
        Some((chan, Chunk { len, dropped, last }))
    }

    /// The channel whose packet is waiting for an armed buffer, if any
    pub fn held(&self) -> Option<ChannelId> {
        match self.rx {
            Rx::Held { chan, .. } => Some(chan),
            _ => None,
        }
    }

    /// The channel whose chunk is being copied, if any
    pub fn copying(&self) -> Option<ChannelId> {
        match self.rx {
            Rx::Copying { chan, .. } => Some(chan),
            _ => None,
        }
    }

    /// Drop everything the bridge holds for `chan`
    ///
    /// An armed buffer is forgotten, and a copy into it is aborted. The rest
    /// of a partially received frame is discarded. A queued frame is
    /// dropped; a frame on the wire finishes, but no one hears about it.
    pub fn cancel<D: Dmac>(&mut self, chan: ChannelId, dma: &mut Dma<D>) {
        self.inbound[chan.index()] = None;
        match self.rx {
            Rx::Copying { chan: c, .. } if c == chan => {
                dma.abort(DMA_BRIDGE_RX);
                self.rx = Rx::Empty;
            }
            Rx::Held { chan: c, .. } if c == chan => self.rx = Rx::Empty,
            _ => {}
        }
        if self.frame_chan == Some(chan) {
            self.frame_chan = None;
            self.discard = true;
        }
        if self.tx_chan == Some(chan) {
            self.tx_chan = None;
        }
        self.outbound[chan.index()] = Outbound::Idle;
        debug!("Bridge cancelled {:?}", chan);
    }

    /// Abort the inbound copy, and forget all channel state
    pub fn disable<D: Dmac>(&mut self, dma: &mut Dma<D>) {
        dma.abort(DMA_BRIDGE_RX);
        self.tx.cancel();
        *self = Bridge::new();
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}
