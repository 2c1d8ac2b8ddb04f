//! The runtime owns the ports, the control channel, and whichever of the
//! bridge or the flash programmer holds the pipe. Interrupt handlers feed it
//! events; it routes each one to its owner, then lets every channel make
//! what progress it can.
//!
//! # Example
//!
//! A sketch of the interrupt wiring. The board types and the
//! `DMAC_CHANNEL_COMPLETE` helper are yours to provide.
//!
//! ```ignore
//! use tessel_bridge::{ChannelId, Runtime, Shared};
//!
//! static RUNTIME: Shared<MyBoard> = Shared::new(Runtime::new(
//!     MyDmac::new(),
//!     MyPipe::new(),
//!     MyPort::a(),
//!     MyPort::b(),
//!     MyFlash::new(),
//! ));
//!
//! // Once, at boot. The runtime is in a static, so it won't move.
//! RUNTIME.with(|rt| unsafe { rt.enable() });
//!
//! #[interrupt]
//! fn DMAC() {
//!     for chan in DMAC_CHANNEL_COMPLETE() {
//!         RUNTIME.with(|rt| rt.dma_completion(chan));
//!     }
//! }
//!
//! #[interrupt]
//! fn USB() {
//!     RUNTIME.with(|rt| {
//!         // usb_device polling happens here, with rt.pipe_mut() as the class.
//!         rt.poll();
//!     });
//! }
//!
//! #[interrupt]
//! fn TC4() {
//!     RUNTIME.with(|rt| rt.tick());
//! }
//! ```

use crate::{
    bridge::{Bridge, Chunk, Inbound, OutEvent},
    control::{Control, Request},
    dma::{Dma, DmaChan, Dmac},
    flash::{Flash, FlashEvent, FlashHardware},
    frame::{ChannelId, Status},
    pipe::{Pipe, PipeEvents},
    port::{Port, PortHardware},
    resources::{
        DMA_BRIDGE_RX, DMA_BRIDGE_TX, DMA_PORT_A_RX, DMA_PORT_A_TX, DMA_PORT_B_RX, DMA_PORT_B_TX,
        GCLK_PORT_A, GCLK_PORT_B,
    },
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// The hardware a runtime drives
pub trait Board {
    type Dmac: Dmac;
    type Pipe: Pipe;
    type Port: PortHardware;
    type Flash: FlashHardware;
}

/// Who owns the pipe and the bridge DMA channels
enum Mode {
    Bridge(Bridge),
    Flash(Flash),
}

const CHANNELS: [ChannelId; 3] = [ChannelId::Control, ChannelId::PortA, ChannelId::PortB];

/// Everything behind the bridge
struct Channels<H> {
    control: Control,
    port_a: Port<H>,
    port_b: Port<H>,
}

impl<H: PortHardware> Channels<H> {
    fn port(&self, chan: ChannelId) -> Option<&Port<H>> {
        match chan {
            ChannelId::Control => None,
            ChannelId::PortA => Some(&self.port_a),
            ChannelId::PortB => Some(&self.port_b),
        }
    }

    fn port_mut(&mut self, chan: ChannelId) -> Option<&mut Port<H>> {
        match chan {
            ChannelId::Control => None,
            ChannelId::PortA => Some(&mut self.port_a),
            ChannelId::PortB => Some(&mut self.port_b),
        }
    }

    fn poll_outbound(&mut self, chan: ChannelId) -> Option<usize> {
        match self.port_mut(chan) {
            Some(port) => port.poll_outbound(),
            None => self.control.poll_outbound(),
        }
    }

    fn reply(&self, chan: ChannelId) -> &[u8] {
        match self.port(chan) {
            Some(port) => port.reply(),
            None => self.control.reply(),
        }
    }

    fn poll_inbound(&mut self, chan: ChannelId) -> Option<Inbound> {
        match self.port_mut(chan) {
            Some(port) => port.poll_inbound(),
            None => self.control.poll_inbound(),
        }
    }

    /// Returns `true` if it's time to enter flash mode
    fn bridge_in_completion(&mut self, chan: ChannelId) -> bool {
        match self.port_mut(chan) {
            Some(port) => {
                port.bridge_in_completion();
                false
            }
            None => self.control.bridge_in_completion(),
        }
    }

    fn deliver<D: Dmac>(
        &mut self,
        chan: ChannelId,
        chunk: Chunk,
        bridge: &mut Bridge,
        dma: &mut Dma<D>,
    ) {
        if let Some(port) = self.port_mut(chan) {
            return port.bridge_out_completion(chunk, dma);
        }
        match self.control.bridge_out_completion(chunk) {
            Some(Request::PortReset(port)) => {
                self.restart(port, bridge, dma);
                self.control.ack();
            }
            Some(Request::PortStatus(port)) => {
                if let Some(status) = self.port(port).map(Port::status_bytes) {
                    self.control.port_status(status);
                }
            }
            Some(Request::PortOpen(port)) => {
                self.open(port);
                self.control.ack();
            }
            Some(Request::PortClose(port)) => {
                self.close(port, bridge, dma);
                self.control.ack();
            }
            None => {}
        }
    }

    /// Enable a closed port; an open port is left as it is
    fn open(&mut self, chan: ChannelId) {
        if let Some(port) = self.port_mut(chan).filter(|port| !port.is_enabled()) {
            // Safety: the channels live in the runtime, which doesn't move
            // once enabled.
            unsafe { port.enable() };
        }
    }

    /// Disable a port, dropping whatever it had going
    fn close<D: Dmac>(&mut self, chan: ChannelId, bridge: &mut Bridge, dma: &mut Dma<D>) {
        if let Some(port) = self.port_mut(chan) {
            bridge.cancel(chan, dma);
            port.disable(dma);
        }
    }

    /// Indicates if frames for `chan` have somewhere to go
    fn is_open(&self, chan: ChannelId) -> bool {
        self.port(chan).map_or(true, Port::is_enabled)
    }

    /// Disable, then enable, a channel, dropping whatever it had going
    fn restart<D: Dmac>(&mut self, chan: ChannelId, bridge: &mut Bridge, dma: &mut Dma<D>) {
        bridge.cancel(chan, dma);
        match self.port_mut(chan) {
            Some(port) => {
                port.disable(dma);
                // Safety: the channels live in the runtime, which doesn't move
                // once enabled.
                unsafe { port.enable() };
            }
            None => self.control.reset(),
        }
    }

    /// Restart a channel after a DMA error, and say so in its next reply
    fn fault<D: Dmac>(&mut self, chan: ChannelId, bridge: &mut Bridge, dma: &mut Dma<D>) {
        warn!("DMA fault on {:?}", chan);
        self.restart(chan, bridge, dma);
        match self.port_mut(chan) {
            Some(port) => port.raise(Status::DMA_FAULT),
            None => self.control.raise(Status::DMA_FAULT),
        }
    }
}

/// The bridge firmware core
///
/// See the [module documentation](crate::runtime) for how to wire it up.
pub struct Runtime<B: Board> {
    dma: Dma<B::Dmac>,
    pipe: B::Pipe,
    flash_hw: B::Flash,
    channels: Channels<B::Port>,
    mode: Mode,
    enabled: bool,
}

impl<B: Board> Runtime<B> {
    /// Assemble a runtime; nothing runs until [`enable`](Runtime::enable)
    pub const fn new(
        dmac: B::Dmac,
        pipe: B::Pipe,
        port_a: B::Port,
        port_b: B::Port,
        flash: B::Flash,
    ) -> Self {
        Runtime {
            dma: Dma::new(dmac),
            pipe,
            flash_hw: flash,
            channels: Channels {
                control: Control::new(),
                port_a: Port::new(
                    ChannelId::PortA,
                    port_a,
                    GCLK_PORT_A,
                    DMA_PORT_A_TX,
                    DMA_PORT_A_RX,
                ),
                port_b: Port::new(
                    ChannelId::PortB,
                    port_b,
                    GCLK_PORT_B,
                    DMA_PORT_B_TX,
                    DMA_PORT_B_RX,
                ),
            },
            mode: Mode::Bridge(Bridge::new()),
            enabled: false,
        }
    }

    /// Enable both ports, and start the bridge
    ///
    /// # Safety
    ///
    /// From here on, the runtime's buffers are DMA targets, and the DMA
    /// descriptor table lives inside it. The runtime must not move again.
    /// Keep it in a `static`, like [`Shared`] allows.
    pub unsafe fn enable(&mut self) {
        self.channels.control.reset();
        self.channels.port_a.enable();
        self.channels.port_b.enable();
        self.mode = Mode::Bridge(Bridge::new());
        self.enabled = true;
        debug!("Runtime enabled");
        self.sync();
    }

    /// Stop everything, and release the hardware
    pub fn disable(&mut self) {
        match &mut self.mode {
            Mode::Bridge(bridge) => bridge.disable(&mut self.dma),
            Mode::Flash(flash) => flash.disable(&mut self.dma, &mut self.flash_hw),
        }
        self.channels.port_a.disable(&mut self.dma);
        self.channels.port_b.disable(&mut self.dma);
        self.channels.control.reset();
        self.mode = Mode::Bridge(Bridge::new());
        self.enabled = false;
        debug!("Runtime disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Indicates if the flash programmer holds the pipe
    pub fn is_flash_mode(&self) -> bool {
        matches!(self.mode, Mode::Flash(_))
    }

    pub fn port(&self, chan: ChannelId) -> Option<&Port<B::Port>> {
        self.channels.port(chan)
    }

    pub fn pipe(&self) -> &B::Pipe {
        &self.pipe
    }

    /// Access the pipe, for example to poll it as a USB class
    pub fn pipe_mut(&mut self) -> &mut B::Pipe {
        &mut self.pipe
    }

    pub fn dma(&self) -> &Dma<B::Dmac> {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut Dma<B::Dmac> {
        &mut self.dma
    }

    /// Enable a port that was closed
    ///
    /// Ports are open once the runtime is enabled. Does nothing in flash
    /// mode, or for the control channel.
    pub fn open_port(&mut self, chan: ChannelId) {
        if !self.enabled || self.is_flash_mode() {
            return;
        }
        self.channels.open(chan);
        self.sync();
    }

    /// Disable a port
    ///
    /// A closed port sends nothing to the host, and frames addressed to it
    /// are rejected like frames for an unknown channel.
    pub fn close_port(&mut self, chan: ChannelId) {
        if let Mode::Bridge(bridge) = &mut self.mode {
            self.channels.close(chan, bridge, &mut self.dma);
        }
        self.sync();
    }

    /// Hand the pipe and the bridge DMA channels to the flash programmer
    ///
    /// Both ports are disabled. Does nothing if the runtime isn't enabled,
    /// or is already in flash mode.
    pub fn enter_flash(&mut self) {
        let Mode::Bridge(bridge) = &mut self.mode else {
            return;
        };
        if !self.enabled {
            return;
        }
        bridge.disable(&mut self.dma);
        self.channels.port_a.disable(&mut self.dma);
        self.channels.port_b.disable(&mut self.dma);
        self.channels.control.reset();

        self.mode = Mode::Flash(Flash::new());
        if let Mode::Flash(flash) = &mut self.mode {
            // Safety: the flash state lives in the runtime, which doesn't move
            // once enabled. The bridge is disabled.
            unsafe { flash.enable(&mut self.flash_hw) };
            flash.usb_out_completion(&mut self.pipe, &mut self.dma, &mut self.flash_hw);
        }
        debug!("Entered flash mode");
    }

    /// Give the pipe back to the bridge, and enable the ports again
    pub fn enter_bridge(&mut self) {
        let Mode::Flash(flash) = &mut self.mode else {
            return;
        };
        flash.disable(&mut self.dma, &mut self.flash_hw);
        self.mode = Mode::Bridge(Bridge::new());
        // Safety: the ports live in the runtime, which doesn't move once
        // enabled. The flash programmer is gone.
        unsafe {
            self.channels.port_a.enable();
            self.channels.port_b.enable();
        }
        self.channels.control.reset();
        debug!("Entered bridge mode");
        self.sync();
    }

    /// Handle pipe events
    ///
    /// Call this after every `UsbDevice::poll`.
    pub fn poll(&mut self) {
        let events = self.pipe.take_events();
        if events.contains(PipeEvents::IN_COMPLETE) {
            self.on_usb_in_completion();
        }
        if events.contains(PipeEvents::OUT_READY) {
            self.on_usb_out_completion();
        }
    }

    /// The OUT endpoint has a packet
    pub fn on_usb_out_completion(&mut self) {
        if !self.enabled {
            return;
        }
        if let Mode::Flash(flash) = &mut self.mode {
            return flash.usb_out_completion(&mut self.pipe, &mut self.dma, &mut self.flash_hw);
        }
        self.sync();
    }

    /// The IN endpoint finished a packet
    pub fn on_usb_in_completion(&mut self) {
        if !self.enabled {
            return;
        }
        match &mut self.mode {
            Mode::Bridge(bridge) => {
                let flash = bridge
                    .on_usb_in_completion(&mut self.pipe)
                    .is_some_and(|chan| self.channels.bridge_in_completion(chan));
                if flash {
                    return self.enter_flash();
                }
            }
            Mode::Flash(flash) => {
                if let Some(FlashEvent::Exit) = flash.usb_in_completion(&mut self.pipe) {
                    return self.enter_bridge();
                }
                // A request may have arrived during the reply.
                return flash.usb_out_completion(&mut self.pipe, &mut self.dma, &mut self.flash_hw);
            }
        }
        self.sync();
    }

    /// A DMA channel completed its transfer
    pub fn dma_completion(&mut self, chan: DmaChan) {
        self.dma.retire(chan);
        match (chan, &mut self.mode) {
            (DMA_BRIDGE_RX, Mode::Bridge(bridge)) => {
                if let Some((chan, chunk)) = bridge.bridge_dma_rx_completion() {
                    self.channels.deliver(chan, chunk, bridge, &mut self.dma);
                }
            }
            (DMA_BRIDGE_RX, Mode::Flash(flash)) => {
                flash.dma_rx_completion(&mut self.pipe, &mut self.dma, &mut self.flash_hw);
            }
            // Exchanges finish on the receive side.
            (DMA_BRIDGE_TX, _) => {}
            (DMA_PORT_A_TX, _) => self.channels.port_a.dma_tx_completion(&mut self.dma),
            (DMA_PORT_A_RX, _) => self.channels.port_a.dma_rx_completion(&mut self.dma),
            (DMA_PORT_B_TX, _) => self.channels.port_b.dma_tx_completion(&mut self.dma),
            (DMA_PORT_B_RX, _) => self.channels.port_b.dma_rx_completion(&mut self.dma),
            _ => {
                warn!("Unexpected DMA completion on {}", chan.0);
            }
        }
        self.sync();
    }

    /// A DMA channel reported a transfer error
    ///
    /// The owning port is restarted, and its next reply carries
    /// [`Status::DMA_FAULT`]. Other channels carry on.
    pub fn dma_error(&mut self, chan: DmaChan) {
        self.dma.retire(chan);
        match (chan, &mut self.mode) {
            (DMA_BRIDGE_RX | DMA_BRIDGE_TX, Mode::Bridge(bridge)) => {
                if let Some(owner) = bridge.copying() {
                    self.channels.fault(owner, bridge, &mut self.dma);
                }
            }
            (DMA_BRIDGE_RX | DMA_BRIDGE_TX, Mode::Flash(flash)) => {
                flash.dma_error(&mut self.pipe, &mut self.dma, &mut self.flash_hw);
            }
            (DMA_PORT_A_TX | DMA_PORT_A_RX, Mode::Bridge(bridge)) => {
                self.channels.fault(ChannelId::PortA, bridge, &mut self.dma);
            }
            (DMA_PORT_B_TX | DMA_PORT_B_RX, Mode::Bridge(bridge)) => {
                self.channels.fault(ChannelId::PortB, bridge, &mut self.dma);
            }
            _ => {
                warn!("Unexpected DMA error on {}", chan.0);
            }
        }
        self.sync();
    }

    /// Millisecond tick, from [`TC_DELAY_CALLBACK`](crate::resources::TC_DELAY_CALLBACK)
    pub fn tick(&mut self) {
        self.channels.port_a.tick();
        self.channels.port_b.tick();
        self.sync();
    }

    /// External interrupt flags for a port's pins
    pub fn extint(&mut self, chan: ChannelId, flags: u32) {
        if let Some(port) = self.channels.port_mut(chan) {
            port.handle_extint(flags);
        }
        self.sync();
    }

    /// Let every channel make progress
    ///
    /// Replies go out, buffers are armed, and OUT packets move, until
    /// nothing changes.
    fn sync(&mut self) {
        let Mode::Bridge(bridge) = &mut self.mode else {
            return;
        };
        if !self.enabled {
            return;
        }
        let channels = &mut self.channels;
        loop {
            for chan in CHANNELS {
                if channels.poll_outbound(chan).is_none() {
                    continue;
                }
                if let Err(_err) = bridge.start_outbound(chan, channels.reply(chan), &mut self.pipe)
                {
                    warn!("Reply for {:?} dropped: {:?}", chan, _err);
                    channels.bridge_in_completion(chan);
                }
            }
            if let Some(chan) = bridge.queued() {
                if let Err(_err) = bridge.resume_outbound(chan, channels.reply(chan), &mut self.pipe)
                {
                    warn!("Queued reply for {:?} dropped: {:?}", chan, _err);
                    channels.bridge_in_completion(chan);
                }
            }

            for chan in CHANNELS {
                let Some(inbound) = channels.poll_inbound(chan) else {
                    continue;
                };
                // Safety: the buffer lives in the runtime, which doesn't move once
                // enabled. Disabling or restarting a channel cancels it in the
                // bridge first.
                if let Err(_err) = unsafe { bridge.start_inbound(chan, inbound) } {
                    warn!("Inbound for {:?} refused: {:?}", chan, _err);
                }
            }

            match bridge.on_usb_out_completion(&mut self.pipe, &mut self.dma) {
                Some(OutEvent::Chunk(chan, chunk)) => {
                    channels.deliver(chan, chunk, bridge, &mut self.dma)
                }
                Some(OutEvent::Rejected(id)) => channels.control.reject_channel(id),
                None => match bridge.held() {
                    // A closed port never arms a buffer; drop its frame.
                    Some(chan) if !channels.is_open(chan) => {
                        warn!("Frame for closed {:?} rejected", chan);
                        bridge.cancel(chan, &mut self.dma);
                        channels.control.reject_channel(chan.id());
                    }
                    _ => break,
                },
            }
        }
    }
}

/// A runtime that interrupt handlers and thread code can share
///
/// Every access runs in a critical section.
pub struct Shared<B: Board> {
    runtime: Mutex<RefCell<Runtime<B>>>,
}

impl<B: Board> Shared<B> {
    pub const fn new(runtime: Runtime<B>) -> Self {
        Shared {
            runtime: Mutex::new(RefCell::new(runtime)),
        }
    }

    /// Interrupt-safe, mutable access to the runtime
    pub fn with<R>(&self, func: impl FnOnce(&mut Runtime<B>) -> R) -> R {
        interrupt::free(|cs| {
            let runtime = self.runtime.borrow(cs);
            let mut runtime = runtime.borrow_mut();
            func(&mut runtime)
        })
    }
}
