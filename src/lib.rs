//! A USB bridge core for Tessel-style boards
//!
//! `tessel-bridge` multiplexes one [`usb-device`] bulk pipe across a host
//! control channel and two expansion ports. Each port speaks a small
//! command protocol, and drives SPI, I2C, UART, and GPIO through a
//! hardware seam you implement. A control command hands the whole pipe to
//! a SPI flash programmer, and the programmer hands it back when the host
//! is done.
//!
//! Everything is interrupt driven. Data moves with the SAMD-style DMA
//! controller modeled in [`dma`]; the core never spins waiting on hardware.
//!
//! To use the library, implement
//!
//! - [`Dmac`] for your DMA controller,
//! - [`PortHardware`] for each expansion port's peripherals,
//! - [`FlashHardware`] for the SPI flash,
//!
//! then collect them in a [`Board`], and hand them to a [`Runtime`]. The
//! [`runtime`] module shows how to wire the interrupts.
//!
//! # Frames
//!
//! Every host transfer on the pipe is one frame. The first byte names the
//! channel; [`ChannelId`] lists them. The rest is a command:
//! `[opcode, argc, args.., payload..]`. Replies come back as
//! `[channel, reply code, 1, status, payload..]`; see [`frame`].
//!
//! [`usb-device`]: https://crates.io/crates/usb-device

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod vcell;

pub mod bridge;
pub mod control;
pub mod dma;
pub mod flash;
pub mod frame;
pub mod pipe;
pub mod port;
pub mod resources;
pub mod runtime;
pub mod uart;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use control::Control;
pub use dma::{Dma, DmaChan, Dmac};
pub use flash::{Flash, FlashHardware};
pub use frame::{ChannelId, Reply, Status};
pub use pipe::{Pipe, UsbPipe};
pub use port::{Port, PortHardware};
pub use runtime::{Board, Runtime, Shared};
