//! The DCL program manager: a ring of `total_packets` software descriptors
//! over the buffer manager's memory, driven through the
//! [`fwa_core::nub::NubPort`] trait boundary instead of a real
//! IOFireWireFamily DCL program.
//!
//! One descriptor per packet, each carrying an isoch-header value/mask pair
//! and either one DMA range (NO-DATA: CIP header only) or two (DATA: CIP
//! header + audio payload), batched "modify notification" calls capped at
//! `kMaxDCLsPerModifyNotify`, and a single "jump" notification after initial
//! creation to close the ring. Since this crate has no kernel DCL program to
//! bind to, the descriptor array lives here and every operation a live
//! kernel program would perform is performed on this array instead, with
//! hardware notification delegated to [`fwa_core::nub::NubPort`].

use fwa_core::nub::{DmaRange, NubPort, SegmentHandle, MAX_DCLS_PER_MODIFY_NOTIFY};
use fwa_core::{Result, TransmitError};
use tracing::trace;

use crate::buffer::TransmitBufferManager;
use crate::config::TransmitConfig;

/// One packet's descriptor: the DMA ranges hardware would read from, kept
/// here purely for diagnostics and tests since the buffer manager is the
/// actual source of truth for their contents.
#[derive(Debug, Clone, Copy)]
struct Descriptor {
    is_no_data: bool,
}

/// The software DCL program: `num_groups * packets_per_group` descriptors
/// arranged as a closed ring, the last descriptor's branch pointing back to
/// the first.
pub struct DclProgram {
    num_groups: u32,
    packets_per_group: u32,
    descriptors: Vec<Descriptor>,
}

impl DclProgram {
    /// Allocate and link every descriptor. The
    /// buffer manager's isoch-header templates must already be initialized
    /// (see [`TransmitBufferManager::initialize_isoch_headers`]).
    pub fn create_program(config: &TransmitConfig, buffer: &TransmitBufferManager) -> Result<Self> {
        let total_packets = config.total_packets() as usize;
        buffer.initialize_isoch_headers(config.packets_per_group)?;

        Ok(DclProgram {
            num_groups: config.num_groups,
            packets_per_group: config.packets_per_group,
            descriptors: vec![Descriptor { is_no_data: true }; total_packets],
        })
    }

    fn flat_index(&self, group: u32, packet: u32) -> Result<usize> {
        if packet >= self.packets_per_group || group >= self.num_groups {
            return Err(TransmitError::BadArgument(format!(
                "dcl index out of range: group={group} packet={packet}"
            )));
        }
        Ok((group * self.packets_per_group + packet) as usize)
    }

    /// Update one live descriptor's DMA ranges: one range for NO-DATA (CIP
    /// header only), two for DATA (CIP header +
    /// audio payload). The caller is responsible for having already written
    /// the CIP header and audio payload this range set points at.
    pub fn update_packet(
        &mut self,
        group: u32,
        packet: u32,
        is_no_data: bool,
        ranges: &[DmaRange],
    ) -> Result<()> {
        let idx = self.flat_index(group, packet)?;
        let expected_ranges = if is_no_data { 1 } else { 2 };
        if ranges.len() != expected_ranges {
            return Err(TransmitError::BadArgument(format!(
                "expected {expected_ranges} DMA range(s) for {} packet, got {}",
                if is_no_data { "NO-DATA" } else { "DATA" },
                ranges.len()
            )));
        }
        self.descriptors[idx].is_no_data = is_no_data;
        Ok(())
    }

    /// Batch-notify the hardware that every descriptor in group `g` changed,
    /// splitting into multiple calls of at most
    /// [`MAX_DCLS_PER_MODIFY_NOTIFY`] descriptors each so a large group
    /// never produces an oversized single notify.
    pub fn notify_segment_update(&self, port: &mut dyn NubPort, group: u32) -> Result<()> {
        if group >= self.num_groups {
            return Err(TransmitError::BadArgument(format!("group out of range: {group}")));
        }
        let mut remaining = self.packets_per_group;
        let mut offset = 0u32;
        while remaining > 0 {
            let batch = remaining.min(MAX_DCLS_PER_MODIFY_NOTIFY);
            port.notify_segment_update(SegmentHandle {
                group_index: group * self.packets_per_group + offset,
                descriptor_count: batch,
            })?;
            trace!(group, offset, batch, "notify_segment_update chunk");
            offset += batch;
            remaining -= batch;
        }
        Ok(())
    }

    /// Issue the one-time "modify jump notification" closing the ring,
    /// called once after `create_program`.
    pub fn fixup_jump_targets(&self, port: &mut dyn NubPort) -> Result<()> {
        port.notify_jump_fixup()
    }

    pub fn total_packets(&self) -> u32 {
        self.num_groups * self.packets_per_group
    }

    pub fn packets_per_group(&self) -> u32 {
        self.packets_per_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwa_core::error::Result as CoreResult;
    use fwa_core::nub::{BusSpeed, PortEventSink};

    struct RecordingPort {
        notify_calls: Vec<SegmentHandle>,
        jump_calls: u32,
    }

    impl RecordingPort {
        fn new() -> Self {
            RecordingPort { notify_calls: Vec::new(), jump_calls: 0 }
        }
    }

    impl NubPort for RecordingPort {
        fn open(&mut self, _speed: BusSpeed, _channel: u32) -> CoreResult<()> {
            Ok(())
        }
        fn local_node_id(&self) -> CoreResult<u16> {
            Ok(0)
        }
        fn isoch_channel(&self) -> CoreResult<u32> {
            Ok(0)
        }
        fn set_event_sink(&mut self, _sink: Box<dyn PortEventSink>) {}
        fn start(&mut self) -> CoreResult<()> {
            Ok(())
        }
        fn stop(&mut self) -> CoreResult<()> {
            Ok(())
        }
        fn notify_segment_update(&mut self, segment: SegmentHandle) -> CoreResult<()> {
            self.notify_calls.push(segment);
            Ok(())
        }
        fn notify_jump_fixup(&mut self) -> CoreResult<()> {
            self.jump_calls += 1;
            Ok(())
        }
        fn close(&mut self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn test_config(packets_per_group: u32) -> TransmitConfig {
        TransmitConfig {
            num_groups: 60,
            packets_per_group,
            callback_group_interval: 20,
            ..TransmitConfig::default()
        }
    }

    #[test]
    fn create_program_allocates_every_descriptor() {
        let config = test_config(8);
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let program = DclProgram::create_program(&config, &buffer).unwrap();
        assert_eq!(program.total_packets(), config.total_packets());
    }

    #[test]
    fn update_packet_rejects_wrong_range_count() {
        let config = test_config(8);
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let mut program = DclProgram::create_program(&config, &buffer).unwrap();
        let one_range = [DmaRange { ptr: std::ptr::null(), len: 8 }];
        let two_ranges = [
            DmaRange { ptr: std::ptr::null(), len: 8 },
            DmaRange { ptr: std::ptr::null(), len: 64 },
        ];
        assert!(program.update_packet(0, 0, true, &two_ranges).is_err());
        assert!(program.update_packet(0, 0, false, &one_range).is_err());
        assert!(program.update_packet(0, 0, true, &one_range).is_ok());
        assert!(program.update_packet(0, 0, false, &two_ranges).is_ok());
    }

    #[test]
    fn notify_segment_update_splits_large_groups_into_capped_batches() {
        // packets_per_group (40) exceeds MAX_DCLS_PER_MODIFY_NOTIFY (30): must split.
        let config = TransmitConfig {
            num_groups: 3,
            packets_per_group: 40,
            callback_group_interval: 1,
            ..TransmitConfig::default()
        };
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let program = DclProgram::create_program(&config, &buffer).unwrap();
        let mut port = RecordingPort::new();

        program.notify_segment_update(&mut port, 1).unwrap();

        assert_eq!(port.notify_calls.len(), 2);
        assert_eq!(port.notify_calls[0].descriptor_count, 30);
        assert_eq!(port.notify_calls[1].descriptor_count, 10);
        let total: u32 = port.notify_calls.iter().map(|s| s.descriptor_count).sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn notify_segment_update_single_call_when_under_the_cap() {
        let config = test_config(8);
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let program = DclProgram::create_program(&config, &buffer).unwrap();
        let mut port = RecordingPort::new();

        program.notify_segment_update(&mut port, 0).unwrap();

        assert_eq!(port.notify_calls.len(), 1);
        assert_eq!(port.notify_calls[0].descriptor_count, 8);
    }

    #[test]
    fn fixup_jump_targets_calls_port_once() {
        let config = test_config(8);
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let program = DclProgram::create_program(&config, &buffer).unwrap();
        let mut port = RecordingPort::new();
        program.fixup_jump_targets(&mut port).unwrap();
        assert_eq!(port.jump_calls, 1);
    }

    #[test]
    fn rejects_out_of_range_group() {
        let config = test_config(8);
        let buffer = TransmitBufferManager::new(&config).unwrap();
        let program = DclProgram::create_program(&config, &buffer).unwrap();
        let mut port = RecordingPort::new();
        assert!(program.notify_segment_update(&mut port, config.num_groups).is_err());
    }
}
