//! Wire codec (C10): producer framing and receiver parsing for the migration
//! record stream. Big-endian throughout; see module docs in each function for
//! the exact byte layout.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::chunk::{CHUNK_BYTES, SECTOR_BITS};
use crate::driver::BlockDriver;
use crate::error::{MigrationError, Result};
use crate::transport::Transport;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u64 {
        const DEVICE_BLOCK = 0x01;
        const EOS          = 0x02;
        const PROGRESS     = 0x04;
        const ZERO_BLOCK   = 0x08;
    }
}

// Flags occupy every bit below SECTOR_BITS, not just the ones currently assigned;
// anything else in that range is an unrecognized flag, not part of the sector.
const HEADER_FLAG_MASK: u64 = (1 << SECTOR_BITS) - 1;

fn pack_header(sector_or_percent: u64, flags: Flags) -> u64 {
    (sector_or_percent << SECTOR_BITS) | flags.bits()
}

fn unpack_header(word: u64) -> Result<(u64, Flags)> {
    let flag_bits = word & HEADER_FLAG_MASK;
    let flags = Flags::from_bits(flag_bits).ok_or(MigrationError::UnknownFlags(flag_bits))?;
    Ok((word >> SECTOR_BITS, flags))
}

/// Emits a `DEVICE_BLOCK` frame. `payload` must be exactly `CHUNK_BYTES` unless
/// `zero` is true, in which case the payload is omitted on the wire.
pub fn put_device_block(
    t: &mut dyn Transport,
    sector: u64,
    device_name: &str,
    payload: &[u8],
    zero: bool,
) -> Result<()> {
    let mut flags = Flags::DEVICE_BLOCK;
    if zero {
        flags |= Flags::ZERO_BLOCK;
    }
    t.put_be64(pack_header(sector, flags)).map_err(MigrationError::Transport)?;
    t.put_u8(device_name.len() as u8).map_err(MigrationError::Transport)?;
    t.put_bytes(device_name.as_bytes()).map_err(MigrationError::Transport)?;
    if zero {
        // Flush immediately so many dropped/zero frames don't coalesce into a
        // delayed burst once real payload frames resume.
        t.flush().map_err(MigrationError::Transport)?;
    } else {
        debug_assert_eq!(payload.len(), CHUNK_BYTES);
        t.put_bytes(payload).map_err(MigrationError::Transport)?;
    }
    Ok(())
}

/// Emits an `EOS` frame, marking the end of a migration phase.
pub fn put_eos(t: &mut dyn Transport) -> Result<()> {
    t.put_be64(pack_header(0, Flags::EOS)).map_err(MigrationError::Transport)
}

/// Emits a `PROGRESS` frame. `percent` is packed into the sector field, per the
/// wire format's header-word overload.
pub fn put_progress(t: &mut dyn Transport, percent: u8) -> Result<()> {
    t.put_be64(pack_header(percent as u64, Flags::PROGRESS))
        .map_err(MigrationError::Transport)
}

/// Per-device bookkeeping the receiver keeps across consecutive frames: the
/// resolved driver handle and its sector length, resolved once on first sight.
struct ReceiverDeviceState {
    driver: Arc<dyn BlockDriver>,
    total_sectors: u64,
}

/// Streaming receiver. Holds a memoized all-zero scratch buffer and per-device
/// resolution cache across the whole load.
pub struct Receiver {
    devices: HashMap<String, ReceiverDeviceState>,
    zero_scratch: [u8; CHUNK_BYTES],
    progress_log: Vec<u8>,
}

/// Outcome of reading one frame.
pub enum FrameEvent {
    DeviceBlock { device: String, sector: u64, nr_sectors: u64 },
    Progress { percent: u8 },
    Eos,
}

impl Receiver {
    pub fn new(devices: Vec<Arc<dyn BlockDriver>>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| {
                let total_sectors = d.total_sectors();
                (d.name().to_string(), ReceiverDeviceState { driver: d, total_sectors })
            })
            .collect();
        Self {
            devices,
            zero_scratch: [0u8; CHUNK_BYTES],
            progress_log: Vec::new(),
        }
    }

    pub fn progress_log(&self) -> &[u8] {
        &self.progress_log
    }

    /// Reads and applies exactly one frame. Returns `Ok(Eos)` when the stream's
    /// phase terminator is hit; callers loop until then.
    pub fn read_frame(&mut self, t: &mut dyn Transport) -> Result<FrameEvent> {
        let word = t.get_be64().map_err(MigrationError::Transport)?;
        let (sector_or_percent, flags) = unpack_header(word)?;

        if flags.contains(Flags::EOS) {
            return Ok(FrameEvent::Eos);
        }
        if flags.contains(Flags::PROGRESS) {
            let percent = sector_or_percent as u8;
            self.progress_log.push(percent);
            return Ok(FrameEvent::Progress { percent });
        }
        if !flags.contains(Flags::DEVICE_BLOCK) {
            return Err(MigrationError::UnknownFlags(flags.bits()));
        }

        let sector = sector_or_percent;
        let name_len = t.get_u8().map_err(MigrationError::Transport)? as usize;
        let mut name_buf = vec![0u8; name_len];
        t.get_bytes(&mut name_buf).map_err(MigrationError::Transport)?;
        let device_name = String::from_utf8_lossy(&name_buf).into_owned();

        let state = self
            .devices
            .get(&device_name)
            .ok_or_else(|| MigrationError::UnknownDevice(device_name.clone()))?;

        let nr_sectors = crate::chunk::CHUNK_SECTORS.min(state.total_sectors.saturating_sub(sector));

        let write_len = (nr_sectors * crate::chunk::SECTOR_BYTES) as usize;
        if flags.contains(Flags::ZERO_BLOCK) {
            state
                .driver
                .write_sync(sector, nr_sectors, &self.zero_scratch[..write_len])
                .map_err(|source| MigrationError::Write { device: device_name.clone(), sector, source })?;
        } else {
            let mut buf = [0u8; CHUNK_BYTES];
            t.get_bytes(&mut buf).map_err(MigrationError::Transport)?;
            state
                .driver
                .write_sync(sector, nr_sectors, &buf[..write_len])
                .map_err(|source| MigrationError::Write { device: device_name.clone(), sector, source })?;
        }

        Ok(FrameEvent::DeviceBlock { device: device_name, sector, nr_sectors })
    }

    /// Runs `read_frame` until EOS, for loading one whole phase.
    pub fn load_phase(&mut self, t: &mut dyn Transport) -> Result<()> {
        loop {
            if let FrameEvent::Eos = self.read_frame(t)? {
                return Ok(());
            }
        }
    }
}
