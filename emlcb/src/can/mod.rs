//! CAN frame ⇄ OpenLCB message adaptation layer
//!
//! Three cooperating pieces: the [`login`] state machine owning the alias
//! lifecycle, the [`rx`] adapter turning frames into pooled messages, and
//! the [`tx`] fragmenter turning messages back into frame sequences.

pub mod login;
pub mod rx;
pub mod tx;
