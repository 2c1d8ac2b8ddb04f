//! Logging interface, contingent on the hidden `__log` feature
//!
//! The bridge runs inside interrupt handlers that also own the USB pipe.
//! Only enable `__log` when your logger drains through something else,
//! like a spare UART or RTT.

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*)
    };
}

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*)
    };
}
