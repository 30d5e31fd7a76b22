//! The transmit buffer manager (C3): lays out one contiguous, page-aligned
//! region holding every group's CIP headers, isoch-header words, packet
//! timestamps, and audio payload, and hands out pointers/offsets into it by
//! `(group_index, packet_index)`.
//!
//! One region split into four page-aligned sections in the fixed order
//! audio, CIP headers, isoch headers, timestamps, backed by an anonymous,
//! zero-initialized `mmap`.

use std::ptr;

use fwa_core::cip::CipHeader;
use fwa_core::nub::{make_isoch_header, IsochHeaderValueMask};
use fwa_core::{Result, TransmitError};

/// Tag field for every AMDTP transmit packet: IEC 61883 CIP-present data.
const ISOCH_TAG_CIP: u8 = 1;
/// AMDTP transmit never uses the sy field; it is always zero.
const ISOCH_SY_UNUSED: u8 = 0;

use crate::config::TransmitConfig;

const PAGE_SIZE: usize = 4096;

fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// Per-packet byte size of one AM824 audio block: `num_channels` samples of
/// 4 bytes each, times the SYT interval's block count (8 frames of
/// stereo AM824 = 64 bytes for the 2-channel default).
fn audio_payload_size_per_packet(num_channels: u32) -> usize {
    const SYT_INTERVAL: usize = 8;
    SYT_INTERVAL * num_channels as usize * 4
}

/// Layout offsets and sizes computed once at construction. All
/// sizes are page-aligned so each section starts on its own page.
#[derive(Debug, Clone, Copy)]
struct Layout {
    audio_offset: usize,
    audio_stride: usize,
    cip_offset: usize,
    isoch_offset: usize,
    timestamp_offset: usize,
    total_len: usize,
}

impl Layout {
    fn compute(config: &TransmitConfig) -> Self {
        let total_packets = config.total_packets() as usize;
        let audio_stride = audio_payload_size_per_packet(config.num_channels);

        let audio_section = page_align(total_packets * audio_stride);
        let cip_section = page_align(total_packets * size_of::<CipHeader>());
        let isoch_section = page_align(total_packets * size_of::<IsochHeaderValueMask>());
        let timestamp_section = page_align(total_packets * size_of::<u64>());

        Layout {
            audio_offset: 0,
            audio_stride,
            cip_offset: audio_section,
            isoch_offset: audio_section + cip_section,
            timestamp_offset: audio_section + cip_section + isoch_section,
            total_len: audio_section + cip_section + isoch_section + timestamp_section,
        }
    }
}

/// Owns one anonymous, page-aligned memory mapping and exposes typed
/// accessors into it by packet index. Dropping
/// it unmaps the region.
pub struct TransmitBufferManager {
    layout: Layout,
    total_packets: usize,
    ptr: *mut u8,
}

// SAFETY: the mapping is exclusively owned by this manager; all access goes
// through bounds-checked accessor methods below, and concurrent access
// patterns (one precalculator writer, DCL-driven hardware reader) match the
// seqlock/DBC protocols documented on their respective modules.
unsafe impl Send for TransmitBufferManager {}
unsafe impl Sync for TransmitBufferManager {}

impl TransmitBufferManager {
    /// Allocate and zero-initialize the buffer for `config`. Fails with
    /// [`TransmitError::NoMemory`] if the mapping cannot be established.
    pub fn new(config: &TransmitConfig) -> Result<Self> {
        let layout = Layout::compute(config);
        if layout.total_len == 0 {
            return Err(TransmitError::BadArgument("empty buffer layout".into()));
        }

        // SAFETY: requesting an anonymous, private mapping with valid
        // protection/flags; the result is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransmitError::NoMemory);
        }
        // Anonymous mappings are zero-filled by the kernel already.

        Ok(TransmitBufferManager {
            layout,
            total_packets: config.total_packets() as usize,
            ptr: ptr as *mut u8,
        })
    }

    fn packet_index(&self, group_index: u32, packet_index: u32, packets_per_group: u32) -> Result<usize> {
        let idx = group_index as usize * packets_per_group as usize + packet_index as usize;
        if packet_index >= packets_per_group || idx >= self.total_packets {
            return Err(TransmitError::BadArgument(format!(
                "packet index out of range: group={group_index} packet={packet_index}"
            )));
        }
        Ok(idx)
    }

    /// Audio payload slice for one packet (read/write: the provider fills
    /// it, DCL descriptors point hardware DMA at it).
    pub fn audio_payload_mut(
        &self,
        group_index: u32,
        packet_index: u32,
        packets_per_group: u32,
    ) -> Result<&mut [u8]> {
        let idx = self.packet_index(group_index, packet_index, packets_per_group)?;
        let offset = self.layout.audio_offset + idx * self.layout.audio_stride;
        // SAFETY: offset/len are within the audio section by construction
        // of `Layout::compute` and the bounds check above.
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                self.ptr.add(offset),
                self.layout.audio_stride,
            ))
        }
    }

    /// CIP header slot for one packet, written by the pre-calculator (C4)
    /// and read by the DCL descriptor as the packet's second-buffer source.
    pub fn cip_header_mut(
        &self,
        group_index: u32,
        packet_index: u32,
        packets_per_group: u32,
    ) -> Result<&mut CipHeader> {
        let idx = self.packet_index(group_index, packet_index, packets_per_group)?;
        let offset = self.layout.cip_offset + idx * size_of::<CipHeader>();
        // SAFETY: offset is within the CIP section, correctly aligned
        // (`CipHeader` is `repr(C, packed)`, alignment 1).
        unsafe { Ok(&mut *(self.ptr.add(offset) as *mut CipHeader)) }
    }

    /// The isoch-header value/mask pair for one packet, written once at
    /// configure time and left stable across the stream's life.
    pub fn isoch_header_mut(
        &self,
        group_index: u32,
        packet_index: u32,
        packets_per_group: u32,
    ) -> Result<&mut IsochHeaderValueMask> {
        let idx = self.packet_index(group_index, packet_index, packets_per_group)?;
        let offset = self.layout.isoch_offset + idx * size_of::<IsochHeaderValueMask>();
        // SAFETY: offset is within the isoch-header section and correctly
        // aligned (section start is page-aligned, stride is 4-byte aligned).
        unsafe { Ok(&mut *(self.ptr.add(offset) as *mut IsochHeaderValueMask)) }
    }

    /// The per-packet host timestamp slot (diagnostics / S5 jitter tests).
    pub fn timestamp_mut(
        &self,
        group_index: u32,
        packet_index: u32,
        packets_per_group: u32,
    ) -> Result<&mut u64> {
        let idx = self.packet_index(group_index, packet_index, packets_per_group)?;
        let offset = self.layout.timestamp_offset + idx * size_of::<u64>();
        // SAFETY: offset is within the timestamp section and 8-byte aligned
        // (section start is page-aligned, stride is 8 bytes).
        unsafe { Ok(&mut *(self.ptr.add(offset) as *mut u64)) }
    }

    /// Write the fixed isoch-header value/mask for every packet slot
    /// written once at configure time. The isoch channel
    /// itself is a port-level property (see [`fwa_core::nub::NubPort::open`]),
    /// not part of this per-packet header.
    pub fn initialize_isoch_headers(&self, packets_per_group: u32) -> Result<()> {
        let groups = self.total_packets as u32 / packets_per_group;
        for group in 0..groups {
            for packet in 0..packets_per_group {
                *self.isoch_header_mut(group, packet, packets_per_group)? =
                    make_isoch_header(ISOCH_TAG_CIP, ISOCH_SY_UNUSED);
            }
        }
        Ok(())
    }

    pub fn total_len(&self) -> usize {
        self.layout.total_len
    }
}

impl Drop for TransmitBufferManager {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`total_len` describe the mapping this instance
        // created in `new`; nothing else can be referencing it once the
        // manager itself is being dropped.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.layout.total_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_reports_nonzero_length() {
        let config = TransmitConfig::default();
        let mgr = TransmitBufferManager::new(&config).unwrap();
        assert!(mgr.total_len() > 0);
    }

    #[test]
    fn accessors_round_trip_within_bounds() {
        let config = TransmitConfig::default();
        let mgr = TransmitBufferManager::new(&config).unwrap();
        let ppg = config.packets_per_group;

        {
            let payload = mgr.audio_payload_mut(0, 0, ppg).unwrap();
            payload[0] = 0xAB;
        }
        assert_eq!(mgr.audio_payload_mut(0, 0, ppg).unwrap()[0], 0xAB);

        {
            let cip = mgr.cip_header_mut(1, 2, ppg).unwrap();
            *cip = CipHeader::no_data(0, 0, fwa_core::cip::FDF_48K);
            assert!(cip.is_no_data());
        }

        {
            let ts = mgr.timestamp_mut(3, 4, ppg).unwrap();
            *ts = 123456;
        }
        assert_eq!(*mgr.timestamp_mut(3, 4, ppg).unwrap(), 123456);
    }

    #[test]
    fn rejects_out_of_range_packet_index() {
        let config = TransmitConfig::default();
        let mgr = TransmitBufferManager::new(&config).unwrap();
        let ppg = config.packets_per_group;
        assert!(mgr.audio_payload_mut(0, ppg, ppg).is_err());
        assert!(mgr.audio_payload_mut(config.num_groups, 0, ppg).is_err());
    }

    #[test]
    fn initialize_isoch_headers_fills_every_slot() {
        let config = TransmitConfig::default();
        let mgr = TransmitBufferManager::new(&config).unwrap();
        let ppg = config.packets_per_group;
        mgr.initialize_isoch_headers(ppg).unwrap();
        let expected = make_isoch_header(ISOCH_TAG_CIP, ISOCH_SY_UNUSED);
        for g in 0..config.num_groups {
            for p in 0..ppg {
                let word = *mgr.isoch_header_mut(g, p, ppg).unwrap();
                assert_eq!(word, expected);
            }
        }
    }

    #[test]
    fn fresh_buffer_is_zero_initialized() {
        let config = TransmitConfig::default();
        let mgr = TransmitBufferManager::new(&config).unwrap();
        let ppg = config.packets_per_group;
        let payload = mgr.audio_payload_mut(5, 6, ppg).unwrap();
        assert!(payload.iter().all(|&b| b == 0));
    }
}
