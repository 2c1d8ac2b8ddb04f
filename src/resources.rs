//! Static allocation of hardware resources
//!
//! Every DMA channel, event channel, timer, generic clock and USB endpoint
//! used by the firmware is assigned here, once, at build time. Nothing is
//! discovered at runtime.
//!
//! # Shared channels
//!
//! The flash programming path reuses the bridge's DMA channels and the
//! bridge's USB endpoints. The two paths cannot be active at the same time.
//! [`Runtime`](crate::Runtime) keeps exactly one of them alive in its mode
//! enum, so the overlap is safe as long as you drive the bridge and the flash
//! path through the runtime. If you wire [`Bridge`](crate::Bridge) and
//! [`Flash`](crate::Flash) up yourself, it's on you to never enable both;
//! nothing checks this at runtime.
//!
//! The CDC terminal channels belong to the serial passthrough, which lives
//! outside of this crate. The bridge and the ports never touch them; the
//! assertions at the bottom of this module keep it that way.

use crate::dma::DmaChan;

// Channels 0-3 support EVSYS and are reserved for functions that need it.

/// CDC terminal receive
pub const DMA_TERMINAL_RX: DmaChan = DmaChan(0);
/// Bridge transmit. Reserved for the bridge, used by flash.
pub const DMA_BRIDGE_TX: DmaChan = DmaChan(4);
/// Bridge receive: copies OUT packets into channel command buffers
pub const DMA_BRIDGE_RX: DmaChan = DmaChan(5);
pub const DMA_PORT_A_TX: DmaChan = DmaChan(6);
pub const DMA_PORT_A_RX: DmaChan = DmaChan(7);
pub const DMA_PORT_B_TX: DmaChan = DmaChan(8);
pub const DMA_PORT_B_RX: DmaChan = DmaChan(9);
/// CDC terminal transmit
pub const DMA_TERMINAL_TX: DmaChan = DmaChan(10);

/// Overlaps with the bridge; see the module documentation
pub const DMA_FLASH_TX: DmaChan = DMA_BRIDGE_TX;
/// Overlaps with the bridge; see the module documentation
pub const DMA_FLASH_RX: DmaChan = DMA_BRIDGE_RX;

/// Number of channels implemented by the DMA controller
pub const DMA_CHANNEL_COUNT: usize = 12;

pub const EVSYS_BRIDGE_SYNC: u8 = 0;
pub const EVSYS_TERMINAL_TIMEOUT: u8 = 1;

pub const USB_EP_FLASH_OUT: u8 = 0x02;
pub const USB_EP_FLASH_IN: u8 = 0x81;

pub const USB_EP_PIPE_OUT: u8 = USB_EP_FLASH_OUT;
pub const USB_EP_PIPE_IN: u8 = USB_EP_FLASH_IN;

pub const USB_EP_CDC_NOTIFICATION: u8 = 0x83;
pub const USB_EP_CDC_IN: u8 = 0x84;
pub const USB_EP_CDC_OUT: u8 = 0x04;

/// Timer owned by the CDC terminal
pub const TC_TERMINAL_TIMEOUT: u8 = 3;
/// Millisecond tick. Drives [`Runtime::tick`](crate::Runtime::tick).
pub const TC_DELAY_CALLBACK: u8 = 4;

pub const GCLK_SYSTEM: u8 = 0;
pub const GCLK_32K: u8 = 2;
pub const GCLK_PORT_A: u8 = 3;
pub const GCLK_PORT_B: u8 = 4;

const fn all_distinct(chans: &[DmaChan]) -> bool {
    let mut i = 0;
    while i < chans.len() {
        if chans[i].0 as usize >= DMA_CHANNEL_COUNT {
            return false;
        }
        let mut j = i + 1;
        while j < chans.len() {
            if chans[i].0 == chans[j].0 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(all_distinct(&[
    DMA_TERMINAL_RX,
    DMA_BRIDGE_TX,
    DMA_BRIDGE_RX,
    DMA_PORT_A_TX,
    DMA_PORT_A_RX,
    DMA_PORT_B_TX,
    DMA_PORT_B_RX,
    DMA_TERMINAL_TX,
]));

const _: () = assert!(USB_EP_PIPE_OUT & 0x7F != USB_EP_CDC_OUT & 0x7F);
const _: () = assert!(USB_EP_PIPE_IN & 0x7F != USB_EP_CDC_IN & 0x7F);
