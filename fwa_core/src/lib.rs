//! Foundational types shared by every crate in the transmit-core workspace:
//! the CIP header and AM824 codec (the wire format), bus-time conversions,
//! the hardware-port trait, the shared error taxonomy, and an allocation-free
//! fixed-capacity collection (`StackVec`) used on the hot path.

pub mod am824;
pub mod cip;
pub mod error;
pub mod nub;
pub mod stack_vec;
pub mod timing;

pub use cip::CipHeader;
pub use error::{Result, TransmitError};
pub use nub::NubPort;
pub use stack_vec::StackVec;
