//! Emlcb driver interface
//!
//! The crate provides an interface between a CAN device driver and the Emlcb
//! stack. Limited scope facilitates compatibility across versions.
//! Driver crates should depend on this crate. Emlcb stack users should depend
//! on the `emlcb` crate instead.
//!
//! The boundary consists of three pieces:
//! * [`frame`] — the CAN frame object and the 29-bit OpenLCB identifier codec
//! * [`fifo`] — the receive FIFO that hands frames from the RX interrupt to
//!   the cooperative main loop
//! * [`gridconnect`] — ASCII framing for serial/TCP CAN bridges
//!
//! On the transmit side the stack calls the driver directly through the
//! `Platform` capability trait defined in `emlcb`; a driver reports a full
//! hardware queue by returning `false` and the stack retries on a later pass.
//! No operation on this boundary blocks.

#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod fifo;
pub mod frame;
pub mod gridconnect;
