//! DMA transfer descriptors and channel control
//!
//! The DMA controller reads one in-memory descriptor per channel. This
//! module owns that descriptor table, and implements a RAL-compatible
//! interface for the descriptor words. Starting and stopping channels is
//! delegated to a [`Dmac`] implementation supplied by the board.
//!
//! The controller's addressing quirk is handled here: when a side of the
//! transfer increments, its address word holds the address *one past the
//! last beat*, not the first.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{resources::DMA_CHANNEL_COUNT, vcell::VCell};
use ral_registers as ral;

/// A DMA channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaChan(pub u8);

impl DmaChan {
    fn mask(self) -> u16 {
        1 << self.0
    }
}

/// A transfer descriptor
///
/// Address words are pointer sized; on the 32-bit target this is exactly
/// the controller's 16 byte layout.
#[repr(C, align(16))]
pub struct Descriptor {
    BTCTRL: VCell<u16>,
    BTCNT: VCell<u16>,
    SRCADDR: VCell<usize>,
    DSTADDR: VCell<usize>,
    DESCADDR: VCell<usize>,
}

#[cfg(target_pointer_width = "32")]
const _: [(); 1] = [(); (core::mem::size_of::<Descriptor>() == 16) as usize];

mod BTCTRL {
    pub mod VALID {
        pub const offset: u16 = 0;
        pub const mask: u16 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BLOCKACT {
        pub const offset: u16 = 3;
        pub const mask: u16 = 0b11 << offset;
        pub mod RW {
            pub const NOACT: u16 = 0;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod BEATSIZE {
        pub const offset: u16 = 8;
        pub const mask: u16 = 0b11 << offset;
        pub mod RW {
            pub const BYTE: u16 = 0;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod SRCINC {
        pub const offset: u16 = 10;
        pub const mask: u16 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DSTINC {
        pub const offset: u16 = 11;
        pub const mask: u16 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// One block transfer, in start-address form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub src: usize,
    pub src_inc: bool,
    pub dst: usize,
    pub dst_inc: bool,
    pub count: u16,
}

impl Transfer {
    /// Memory to a peripheral data register
    pub fn to_peripheral(src: *const u8, count: u16, reg: *mut u8) -> Self {
        Transfer {
            src: src as usize,
            src_inc: true,
            dst: reg as usize,
            dst_inc: false,
            count,
        }
    }

    /// A peripheral data register into memory
    pub fn from_peripheral(reg: *const u8, dst: *mut u8, count: u16) -> Self {
        Transfer {
            src: reg as usize,
            src_inc: false,
            dst: dst as usize,
            dst_inc: true,
            count,
        }
    }

    /// Repeat one byte into a peripheral data register
    ///
    /// Used to clock SPI reads.
    pub fn fill_peripheral(byte: *const u8, count: u16, reg: *mut u8) -> Self {
        Transfer {
            src: byte as usize,
            src_inc: false,
            dst: reg as usize,
            dst_inc: false,
            count,
        }
    }

    /// Memory to memory
    pub fn copy(src: *const u8, dst: *mut u8, count: u16) -> Self {
        Transfer {
            src: src as usize,
            src_inc: true,
            dst: dst as usize,
            dst_inc: true,
            count,
        }
    }
}

impl Descriptor {
    const fn new() -> Self {
        Descriptor {
            BTCTRL: VCell::new(0),
            BTCNT: VCell::new(0),
            SRCADDR: VCell::new(0),
            DSTADDR: VCell::new(0),
            DESCADDR: VCell::new(0),
        }
    }

    /// Describe a single, byte-wide block transfer
    ///
    /// The descriptor is left valid, and not linked to any other descriptor.
    pub fn set_transfer(&self, transfer: &Transfer) {
        let count = transfer.count as usize;
        let end = |addr: usize, inc: bool| if inc { addr + count } else { addr };

        self.BTCNT.write(transfer.count);
        self.SRCADDR.write(end(transfer.src, transfer.src_inc));
        self.DSTADDR.write(end(transfer.dst, transfer.dst_inc));
        self.DESCADDR.write(0);
        ral::write_reg!(
            crate::dma,
            self,
            BTCTRL,
            VALID: 1,
            BLOCKACT: NOACT,
            BEATSIZE: BYTE,
            SRCINC: transfer.src_inc as u16,
            DSTINC: transfer.dst_inc as u16
        );
    }

    /// Read back the transfer in start-address form
    pub fn transfer(&self) -> Transfer {
        let count = self.BTCNT.read();
        let src_inc = ral::read_reg!(crate::dma, self, BTCTRL, SRCINC == 1);
        let dst_inc = ral::read_reg!(crate::dma, self, BTCTRL, DSTINC == 1);
        let start = |addr: usize, inc: bool| if inc { addr - count as usize } else { addr };
        Transfer {
            src: start(self.SRCADDR.read(), src_inc),
            src_inc,
            dst: start(self.DSTADDR.read(), dst_inc),
            dst_inc,
            count,
        }
    }

    /// Indicates if the descriptor describes a transfer
    pub fn is_valid(&self) -> bool {
        ral::read_reg!(crate::dma, self, BTCTRL, VALID == 1)
    }

    /// Mark the descriptor invalid, so the channel won't run it again
    pub fn invalidate(&self) {
        ral::modify_reg!(crate::dma, self, BTCTRL, VALID: 0);
    }
}

/// The descriptor table, one entry per channel
#[repr(C, align(16))]
struct Descriptors([Descriptor; DMA_CHANNEL_COUNT]);

impl Descriptors {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const DESC: Descriptor = Descriptor::new();
        Descriptors([DESC; DMA_CHANNEL_COUNT])
    }
}

/// Starts and stops DMA channels
///
/// # Safety
///
/// The controller must be pointed at [`Dma::descriptor_table`], and `start`
/// must run exactly the transfer described by that channel's descriptor.
/// After `abort` returns, the channel must not touch memory anymore.
pub unsafe trait Dmac {
    /// Enable `chan`; its descriptor is already written
    fn start(&mut self, chan: DmaChan);
    /// Disable `chan`, cancelling whatever it's doing
    fn abort(&mut self, chan: DmaChan);
}

/// DMA descriptor table plus the controller that runs it
///
/// Once a transfer has been started, `Dma` must stay at the same address
/// until every channel is idle or aborted.
pub struct Dma<D> {
    descriptors: Descriptors,
    active: u16,
    dmac: D,
}

impl<D: Dmac> Dma<D> {
    pub const fn new(dmac: D) -> Self {
        Dma {
            descriptors: Descriptors::new(),
            active: 0,
            dmac,
        }
    }

    /// Returns the address of the descriptor table
    ///
    /// Tell the controller about this address when you bring it up.
    pub fn descriptor_table(&self) -> *const () {
        self.descriptors.0.as_ptr().cast()
    }

    /// Returns the descriptor for `chan`
    pub fn descriptor(&self, chan: DmaChan) -> &Descriptor {
        &self.descriptors.0[chan.0 as usize]
    }

    /// Describe and start a transfer on `chan`
    ///
    /// Any transfer already running on `chan` is aborted first.
    ///
    /// # Safety
    ///
    /// The memory described by `transfer` must stay valid, and must not be
    /// accessed by anyone else, until `chan` completes or is aborted.
    /// `transfer.count` must be non-zero.
    pub unsafe fn start(&mut self, chan: DmaChan, transfer: Transfer) {
        if self.is_active(chan) {
            warn!("DMA {} restarted while active", chan.0);
            self.abort(chan);
        }
        self.descriptors.0[chan.0 as usize].set_transfer(&transfer);
        self.active |= chan.mask();
        self.dmac.start(chan);
    }

    /// Cancel any transfer on `chan`
    pub fn abort(&mut self, chan: DmaChan) {
        if self.is_active(chan) {
            self.dmac.abort(chan);
        }
        self.descriptors.0[chan.0 as usize].invalidate();
        self.active &= !chan.mask();
    }

    /// Indicates if `chan` has a transfer in flight
    pub fn is_active(&self, chan: DmaChan) -> bool {
        self.active & chan.mask() != 0
    }

    /// Account for a completion (or error) interrupt on `chan`
    ///
    /// Call this from the DMA interrupt handler, before handing the
    /// completion to the channel's owner. [`Runtime`](crate::Runtime) does
    /// this for you. A channel that's never retired stays active, and its
    /// next [`start`](Dma::start) aborts it first.
    pub fn retire(&mut self, chan: DmaChan) {
        self.active &= !chan.mask();
    }

    /// Access the controller
    pub fn dmac(&self) -> &D {
        &self.dmac
    }

    /// Mutable access to the controller
    pub fn dmac_mut(&mut self) -> &mut D {
        &mut self.dmac
    }
}
