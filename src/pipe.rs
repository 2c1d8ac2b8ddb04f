//! USB bulk pipe
//!
//! The bridge and the flash path talk to the host over one pair of bulk
//! endpoints. [`Pipe`] is the packet level view they need. [`UsbPipe`] is
//! the `usb-device` class that implements it, and [`InTransfer`] turns a
//! buffer into a sequence of IN packets.

use crate::resources::{USB_EP_PIPE_IN, USB_EP_PIPE_OUT};
use bitflags::bitflags;
use usb_device::{
    bus::{InterfaceNumber, UsbBus, UsbBusAllocator},
    class::UsbClass,
    descriptor::DescriptorWriter,
    endpoint::{EndpointAddress, EndpointIn, EndpointOut, EndpointType},
    UsbError,
};

/// Bulk max packet size, full speed
pub const MAX_PACKET: usize = 64;

bitflags! {
    /// Pipe events since the last [`Pipe::take_events`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeEvents : u8 {
        /// The OUT endpoint holds a packet
        const OUT_READY = 1 << 0;
        /// The IN endpoint finished sending a packet
        const IN_COMPLETE = 1 << 1;
    }
}

/// A bulk endpoint pair
pub trait Pipe {
    /// Largest packet, in bytes; a shorter packet ends a transfer
    fn max_packet_size(&self) -> usize;
    /// Queue one IN packet
    ///
    /// Returns `WouldBlock` if the previous packet is still on its way.
    fn write_packet(&mut self, packet: &[u8]) -> Result<usize, UsbError>;
    /// Take one OUT packet
    ///
    /// Returns `WouldBlock` if no packet is waiting.
    fn read_packet(&mut self, packet: &mut [u8]) -> Result<usize, UsbError>;
    /// Returns, then clears, the events seen since the last call
    fn take_events(&mut self) -> PipeEvents;
}

/// A device to host transfer, sent one packet at a time
///
/// The transfer always ends with a short packet. When the data is a
/// multiple of the max packet size, a zero length packet follows it.
pub struct InTransfer<const N: usize> {
    buf: [u8; N],
    len: usize,
    pos: usize,
    last_packet: usize,
    active: bool,
}

impl<const N: usize> InTransfer<N> {
    pub const fn new() -> Self {
        InTransfer {
            buf: [0; N],
            len: 0,
            pos: 0,
            last_packet: 0,
            active: false,
        }
    }

    /// Access the buffer to prepare the next transfer
    ///
    /// Don't touch it while [`is_active`](InTransfer::is_active).
    pub fn buffer_mut(&mut self) -> &mut [u8; N] {
        &mut self.buf
    }

    pub fn buffer(&self) -> &[u8; N] {
        &self.buf
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Send the first `len` bytes of the buffer
    pub fn start<P: Pipe>(&mut self, len: usize, pipe: &mut P) -> Result<(), UsbError> {
        if self.active {
            return Err(UsbError::WouldBlock);
        }
        if len > N {
            return Err(UsbError::BufferOverflow);
        }
        self.len = len;
        self.pos = 0;
        self.send_next(pipe)?;
        self.active = true;
        Ok(())
    }

    fn send_next<P: Pipe>(&mut self, pipe: &mut P) -> Result<(), UsbError> {
        let size = (self.len - self.pos).min(pipe.max_packet_size());
        pipe.write_packet(&self.buf[self.pos..self.pos + size])?;
        self.pos += size;
        self.last_packet = size;
        Ok(())
    }

    /// Handle an IN completion
    ///
    /// Returns `true` when the whole transfer is done, and the buffer may
    /// be reused. A packet the pipe refuses ends the transfer early.
    pub fn on_complete<P: Pipe>(&mut self, pipe: &mut P) -> bool {
        if !self.active {
            return false;
        }
        if self.pos < self.len || self.last_packet == pipe.max_packet_size() {
            match self.send_next(pipe) {
                Ok(()) => return false,
                Err(_err) => {
                    warn!("IN transfer cut short after {} bytes: {:?}", self.pos, _err);
                }
            }
        }
        self.active = false;
        true
    }

    /// Forget the transfer
    ///
    /// A packet already handed to the pipe is still sent.
    pub fn cancel(&mut self) {
        self.active = false;
        self.len = 0;
        self.pos = 0;
        self.last_packet = 0;
    }
}

impl<const N: usize> Default for InTransfer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Vendor specific interface with one bulk OUT and one bulk IN endpoint
///
/// `usb-device` reports endpoint activity through the class callbacks.
/// The pipe latches them as [`PipeEvents`]; poll them from the runtime
/// after every `UsbDevice::poll`.
pub struct UsbPipe<'a, B: UsbBus> {
    iface: InterfaceNumber,
    ep_out: EndpointOut<'a, B>,
    ep_in: EndpointIn<'a, B>,
    events: PipeEvents,
}

impl<'a, B: UsbBus> UsbPipe<'a, B> {
    /// Allocate the interface and the bulk endpoints
    ///
    /// Fails if the bus can't provide the fixed endpoint addresses.
    pub fn new(alloc: &'a UsbBusAllocator<B>) -> usb_device::Result<Self> {
        Ok(UsbPipe {
            iface: alloc.interface(),
            ep_out: alloc.alloc(
                Some(EndpointAddress::from(USB_EP_PIPE_OUT)),
                EndpointType::Bulk,
                MAX_PACKET as u16,
                0,
            )?,
            ep_in: alloc.alloc(
                Some(EndpointAddress::from(USB_EP_PIPE_IN)),
                EndpointType::Bulk,
                MAX_PACKET as u16,
                0,
            )?,
            events: PipeEvents::empty(),
        })
    }
}

impl<B: UsbBus> UsbClass<B> for UsbPipe<'_, B> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(self.iface, 0xFF, 0, 0)?;
        writer.endpoint(&self.ep_out)?;
        writer.endpoint(&self.ep_in)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.events = PipeEvents::empty();
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.ep_out.address() {
            self.events |= PipeEvents::OUT_READY;
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.ep_in.address() {
            self.events |= PipeEvents::IN_COMPLETE;
        }
    }
}

impl<B: UsbBus> Pipe for UsbPipe<'_, B> {
    fn max_packet_size(&self) -> usize {
        MAX_PACKET
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<usize, UsbError> {
        self.ep_in.write(packet)
    }

    fn read_packet(&mut self, packet: &mut [u8]) -> Result<usize, UsbError> {
        self.ep_out.read(packet)
    }

    fn take_events(&mut self) -> PipeEvents {
        core::mem::replace(&mut self.events, PipeEvents::empty())
    }
}
