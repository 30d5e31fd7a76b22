//! The AMDTP transmit core: takes audio chunks pushed through a shared-memory
//! ring, formats them into IEC 61883-6 isochronous packets ahead of when
//! hardware needs them, and drives a [`fwa_core::nub::NubPort`] through
//! start/stop and per-group DMA updates.
//!
//! Module map:
//! - [`config`] — transmitter configuration and its derived geometry
//! - [`shm`] — the shared-memory audio ring (C2) and its local/POSIX backends
//! - [`buffer`] — the page-aligned DMA buffer layout (C3)
//! - [`dbc`] — data block counter continuity tracking (C4)
//! - [`syt`] — synchronization timestamp generators (C4)
//! - [`precalc`] — the pre-calculation engine and seqlock-published groups (C4/C9)
//! - [`provider`] — the packet provider pulling from the ring and AM824-encoding (C5)
//! - [`dcl`] — the software DCL program manager (C6)
//! - [`message`] — client-facing notifications (C9)
//! - [`transmitter`] — the transmitter itself, wiring every module together (C9)

pub mod buffer;
pub mod config;
pub mod dbc;
pub mod dcl;
pub mod message;
pub mod precalc;
pub mod provider;
pub mod shm;
pub mod syt;
pub mod transmitter;

pub use config::{BusSpeedConfig, SytStyle, TransmissionType, TransmitConfig, ANY_CHANNEL};
pub use dbc::{check_continuity, DbcState, DbcViolation, ObservedPacket};
pub use message::{MessageCallback, TransmitterMessage};
pub use provider::{FillResult, PacketProvider, ProviderStats};
pub use shm::{LocalAudioRing, PosixAudioRing, RingHandle};
pub use transmitter::{Transmitter, TransmitterState};
