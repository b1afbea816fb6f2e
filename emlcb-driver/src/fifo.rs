//! Receive-path frame FIFO
//!
//! Hands frames from the CAN receive interrupt to the cooperative main loop.
//! The mutex flavor `M` sets the locking discipline: use
//! `CriticalSectionRawMutex` when the producer runs at interrupt level,
//! `NoopRawMutex` when producer and consumer share one context.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Deque;

use crate::frame::CanFrame;

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Full;

pub struct FrameFifo<M: RawMutex, const N: usize> {
    queue: Mutex<M, RefCell<Deque<CanFrame, N>>>,
    overruns: Mutex<M, RefCell<u32>>,
}

impl<M: RawMutex, const N: usize> FrameFifo<M, N> {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
            overruns: Mutex::new(RefCell::new(0)),
        }
    }

    /// Enqueues a received frame. Safe to call from the RX interrupt.
    ///
    /// A full queue drops the frame and counts an overrun; the ISR must not
    /// wait on the main loop.
    pub fn push(&self, frame: CanFrame) -> Result<(), Full> {
        let pushed = self
            .queue
            .lock(|queue| queue.borrow_mut().push_back(frame).is_ok());
        if !pushed {
            self.overruns.lock(|counter| {
                let mut counter = counter.borrow_mut();
                *counter = counter.saturating_add(1);
            });
            return Err(Full);
        }
        Ok(())
    }

    /// Dequeues the oldest frame. Called from the main loop.
    pub fn pop(&self) -> Option<CanFrame> {
        self.queue.lock(|queue| queue.borrow_mut().pop_front())
    }

    pub fn len(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock(|queue| queue.borrow().is_empty())
    }

    /// Number of frames dropped because the queue was full.
    pub fn overruns(&self) -> u32 {
        self.overruns.lock(|counter| *counter.borrow())
    }
}

impl<M: RawMutex, const N: usize> Default for FrameFifo<M, N> {
    fn default() -> Self {
        Self::new()
    }
}
