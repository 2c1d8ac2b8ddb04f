//! UART receive ring

/// Slots in the ring. One stays free, so the ring holds at most
/// `UART_RX_SIZE - 1` bytes.
pub const UART_RX_SIZE: usize = 20;

/// Default flush timeout, in milliseconds
pub const UART_MS_TIMEOUT: u16 = 10;

const MAX_LEN: u8 = UART_RX_SIZE as u8 - 1;

/// The ring was full, and a byte was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Buffers bytes from the UART until the host takes them
///
/// The ring asks to be flushed when it's full, or when its oldest unread
/// byte has waited for the flush timeout. The timeout is measured in
/// [`tick`](UartBuf::tick)s.
pub struct UartBuf {
    rx: [u8; UART_RX_SIZE],
    head: u8,
    tail: u8,
    buf_len: u8,
    /// Where the unread data starts; `None` when there's nothing to read
    data_pos: Option<u8>,
    overflow: bool,
    elapsed_ms: u16,
    timeout_ms: u16,
}

const fn next(idx: u8) -> u8 {
    if idx as usize + 1 == UART_RX_SIZE {
        0
    } else {
        idx + 1
    }
}

impl UartBuf {
    pub const fn new() -> Self {
        UartBuf {
            rx: [0; UART_RX_SIZE],
            head: 0,
            tail: 0,
            buf_len: 0,
            data_pos: None,
            overflow: false,
            elapsed_ms: 0,
            timeout_ms: UART_MS_TIMEOUT,
        }
    }

    /// Store a byte at the tail of the ring
    ///
    /// When the ring is full, the byte is dropped and the sticky overflow
    /// flag is raised. Buffered bytes are never overwritten.
    pub fn push(&mut self, byte: u8) -> Result<(), Overflow> {
        if self.buf_len == MAX_LEN {
            self.overflow = true;
            return Err(Overflow);
        }
        self.rx[self.tail as usize] = byte;
        self.commit()
    }

    /// Returns the slot the next byte lands in
    ///
    /// Point a one byte receive DMA transfer here, then [`commit`](UartBuf::commit)
    /// the byte when the transfer completes. If the ring is full, `commit`
    /// rejects the byte and the slot is reused.
    pub fn slot(&mut self) -> *mut u8 {
        &mut self.rx[self.tail as usize]
    }

    /// Account for a byte written into [`slot`](UartBuf::slot)
    pub fn commit(&mut self) -> Result<(), Overflow> {
        if self.buf_len == MAX_LEN {
            self.overflow = true;
            return Err(Overflow);
        }
        if self.data_pos.is_none() {
            self.data_pos = Some(self.head);
            self.elapsed_ms = 0;
        }
        self.tail = next(self.tail);
        self.buf_len += 1;
        Ok(())
    }

    /// Copy bytes out of the ring, oldest first
    ///
    /// Returns how many bytes were copied. The flush timeout restarts.
    pub fn drain(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.buf_len as usize);
        for byte in &mut dst[..count] {
            *byte = self.rx[self.head as usize];
            self.head = next(self.head);
        }
        self.buf_len -= count as u8;
        self.elapsed_ms = 0;
        self.data_pos = (self.buf_len > 0).then_some(self.head);
        count
    }

    /// Advance the flush timer by one millisecond
    pub fn tick(&mut self) {
        if self.data_pos.is_some() {
            self.elapsed_ms = self.elapsed_ms.saturating_add(1);
        }
    }

    /// Indicates if the ring should be drained toward the host
    pub fn should_flush(&self) -> bool {
        self.buf_len == MAX_LEN
            || (self.data_pos.is_some() && self.elapsed_ms >= self.timeout_ms)
    }

    /// Set the flush timeout, in milliseconds
    ///
    /// A timeout of zero flushes as soon as any byte is buffered.
    pub fn set_timeout(&mut self, timeout_ms: u16) {
        self.timeout_ms = timeout_ms;
    }

    /// Returns, then clears, the overflow flag
    pub fn take_overflow(&mut self) -> bool {
        core::mem::take(&mut self.overflow)
    }

    pub fn len(&self) -> usize {
        self.buf_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.buf_len == 0
    }

    /// Drop everything, and return to the empty baseline
    ///
    /// The flush timeout is kept.
    pub fn clear(&mut self) {
        *self = UartBuf {
            timeout_ms: self.timeout_ms,
            ..UartBuf::new()
        };
    }

    #[cfg(test)]
    fn indices(&self) -> (u8, u8) {
        (self.head, self.tail)
    }
}

impl Default for UartBuf {
    fn default() -> Self {
        Self::new()
    }
}
