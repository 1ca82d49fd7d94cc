//! Decoding of raw ring-buffer records into [`MigrationEvent`]s.
//!
//! The kernel-side tracer writes fixed-width, native-endian records
//! (`struct migration_event` in `bpf/include/threveal.h`). The length check
//! happens once per record, then fixed-offset unaligned loads extract the
//! fields.

use thiserror::Error;

use crate::event::{MigrationEvent, MAX_COMM_LEN};

/// Size of one migration record on the wire:
/// `u64 timestamp_ns; u32 pid; u32 tid; u32 src_cpu; u32 dst_cpu; char comm[16]`.
pub const MIGRATION_RECORD_SIZE: usize = 40;

/// Errors from record decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("migration record too short: {size} bytes")]
    Truncated { size: usize },
}

/// Decode one raw ring-buffer record.
///
/// Records shorter than [`MIGRATION_RECORD_SIZE`] are rejected; callers drop
/// them without aborting the stream. Extra trailing bytes are tolerated.
pub fn decode_migration(data: &[u8]) -> Result<MigrationEvent, DecodeError> {
    if data.len() < MIGRATION_RECORD_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    let mut comm = [0u8; MAX_COMM_LEN];
    comm.copy_from_slice(&data[24..40]);

    Ok(MigrationEvent {
        timestamp_ns: read_u64_le(data, 0),
        pid: read_u32_le(data, 8),
        tid: read_u32_le(data, 12),
        src_cpu: read_u32_le(data, 16),
        dst_cpu: read_u32_le(data, 20),
        comm,
    })
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: the record length is verified against MIGRATION_RECORD_SIZE
    // before any fixed-offset read.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}
