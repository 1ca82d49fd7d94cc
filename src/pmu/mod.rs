//! Hardware performance counter groups via `perf_event_open(2)`.
//!
//! Five counters (cycles, instructions, LLC loads, LLC load misses, branch
//! misses) are opened as a single perf event group with the cycles counter
//! as leader. The kernel schedules a group onto the PMU as a unit and the
//! group read format returns every member in one `read(2)`, so the five
//! values form a consistent snapshot with no multiplexing skew between them.

pub mod sampler;

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use perf_event_open_sys as sys;
use thiserror::Error;
use tracing::debug;

pub use sampler::{PmuSampler, SampleSink};

/// Errors from counter-group construction and operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuError {
    #[error("perf_event_open() failed")]
    OpenFailed,

    #[error("failed to read PMU counter group")]
    ReadFailed,

    #[error("PMU event not supported on this hardware")]
    EventNotSupported,

    #[error("permission denied for PMU access (check perf_event_paranoid or CAP_PERFMON)")]
    PermissionDenied,

    #[error("invalid thread or process ID")]
    InvalidTarget,

    #[error("too many PMU events for available counters")]
    TooManyEvents,

    #[error("PMU group in invalid state")]
    InvalidState,
}

/// Number of counters in the group, leader included.
const COUNTER_COUNT: usize = 5;

/// One consistent snapshot of all five counters.
///
/// Values are deltas since the group was last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupReading {
    pub cycles: u64,
    pub instructions: u64,
    pub llc_loads: u64,
    pub llc_load_misses: u64,
    pub branch_misses: u64,
}

/// Wire format of a `PERF_FORMAT_GROUP` read on the leader.
#[repr(C)]
#[derive(Default)]
struct GroupReadFormat {
    nr: u64,
    values: [u64; COUNTER_COUNT],
}

/// A five-counter hardware event group bound to one thread.
///
/// The group exclusively owns its five perf event descriptors; they close on
/// drop along every path, including partial construction failure. The type
/// is move-only, so ownership transfer invalidates the source at compile
/// time and a moved-from group can never double-close.
#[derive(Debug)]
pub struct CounterGroup {
    leader: OwnedFd,
    // Creation order: instructions, LLC loads, LLC load misses, branch
    // misses. Held for ownership only; all reads and ioctls go through the
    // leader.
    #[allow(dead_code)]
    members: [OwnedFd; COUNTER_COUNT - 1],
}

impl CounterGroup {
    /// Open the counter group for a thread.
    ///
    /// `tid` 0 means the calling thread; `-1` is remapped to 0 because
    /// `pid == -1` with `cpu == -1` is rejected by the kernel. `cpu` of `-1`
    /// follows the thread across CPUs.
    ///
    /// The leader (cycles) opens disabled with the group read format;
    /// members inherit the leader's enable state. Kernel and hypervisor
    /// events are excluded so no elevated counter privilege is required
    /// where policy permits unprivileged profiling.
    pub fn new(tid: libc::pid_t, cpu: i32) -> Result<Self, PmuError> {
        let effective_tid = if tid == -1 { 0 } else { tid };

        let mut attr = hardware_attr(sys::bindings::PERF_COUNT_HW_CPU_CYCLES as u64, true);
        let leader = open_counter(&mut attr, effective_tid, cpu, -1)?;
        let leader_fd = leader.as_raw_fd();

        let mut instr_attr =
            hardware_attr(sys::bindings::PERF_COUNT_HW_INSTRUCTIONS as u64, false);
        let instructions = open_counter(&mut instr_attr, effective_tid, cpu, leader_fd)?;

        let mut llc_loads_attr = cache_attr(sys::bindings::PERF_COUNT_HW_CACHE_RESULT_ACCESS);
        let llc_loads = open_counter(&mut llc_loads_attr, effective_tid, cpu, leader_fd)?;

        let mut llc_misses_attr = cache_attr(sys::bindings::PERF_COUNT_HW_CACHE_RESULT_MISS);
        let llc_misses = open_counter(&mut llc_misses_attr, effective_tid, cpu, leader_fd)?;

        let mut branch_attr =
            hardware_attr(sys::bindings::PERF_COUNT_HW_BRANCH_MISSES as u64, false);
        let branch_misses = open_counter(&mut branch_attr, effective_tid, cpu, leader_fd)?;

        Ok(Self {
            leader,
            members: [instructions, llc_loads, llc_misses, branch_misses],
        })
    }

    /// Read all five counters atomically.
    ///
    /// A single read on the leader returns `{ nr, value[nr] }`; `nr` must be
    /// exactly the group size or the snapshot is rejected as [`PmuError::ReadFailed`].
    pub fn read(&self) -> Result<GroupReading, PmuError> {
        let mut data = GroupReadFormat::default();

        let n = unsafe {
            libc::read(
                self.leader.as_raw_fd(),
                (&mut data as *mut GroupReadFormat).cast(),
                mem::size_of::<GroupReadFormat>(),
            )
        };

        if n < 0 {
            debug!(error = %io::Error::last_os_error(), "group read failed");
            return Err(PmuError::ReadFailed);
        }

        if (n as usize) < mem::size_of::<u64>() || data.nr != COUNTER_COUNT as u64 {
            return Err(PmuError::ReadFailed);
        }

        Ok(GroupReading {
            cycles: data.values[0],
            instructions: data.values[1],
            llc_loads: data.values[2],
            llc_load_misses: data.values[3],
            branch_misses: data.values[4],
        })
    }

    /// Start all five counters simultaneously.
    pub fn enable(&self) -> Result<(), PmuError> {
        self.group_ioctl(|fd, arg| unsafe { sys::ioctls::ENABLE(fd, arg) })
    }

    /// Stop all five counters; values are preserved and stay readable.
    pub fn disable(&self) -> Result<(), PmuError> {
        self.group_ioctl(|fd, arg| unsafe { sys::ioctls::DISABLE(fd, arg) })
    }

    /// Zero all five counters without changing the enable state.
    pub fn reset(&self) -> Result<(), PmuError> {
        self.group_ioctl(|fd, arg| unsafe { sys::ioctls::RESET(fd, arg) })
    }

    fn group_ioctl(&self, op: impl Fn(i32, libc::c_uint) -> i32) -> Result<(), PmuError> {
        // The group flag makes the leader ioctl act on every member.
        if op(
            self.leader.as_raw_fd(),
            sys::bindings::PERF_IOC_FLAG_GROUP as libc::c_uint,
        ) < 0
        {
            debug!(error = %io::Error::last_os_error(), "group ioctl failed");
            return Err(PmuError::InvalidState);
        }
        Ok(())
    }
}

fn hardware_attr(config: u64, is_leader: bool) -> sys::bindings::perf_event_attr {
    let mut attr: sys::bindings::perf_event_attr = unsafe { mem::zeroed() };

    attr.type_ = sys::bindings::PERF_TYPE_HARDWARE;
    attr.size = mem::size_of::<sys::bindings::perf_event_attr>() as u32;
    attr.config = config;

    // Only the leader starts disabled; members follow its enable state.
    attr.set_disabled(u64::from(is_leader));
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);

    if is_leader {
        attr.read_format = u64::from(sys::bindings::PERF_FORMAT_GROUP);
    }

    attr
}

fn cache_attr(result_id: u32) -> sys::bindings::perf_event_attr {
    let mut attr: sys::bindings::perf_event_attr = unsafe { mem::zeroed() };

    attr.type_ = sys::bindings::PERF_TYPE_HW_CACHE;
    attr.size = mem::size_of::<sys::bindings::perf_event_attr>() as u32;

    // Cache events encode (cache, op, result) in the config word.
    attr.config = u64::from(sys::bindings::PERF_COUNT_HW_CACHE_LL)
        | (u64::from(sys::bindings::PERF_COUNT_HW_CACHE_OP_READ) << 8)
        | (u64::from(result_id) << 16);

    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);

    attr
}

fn open_counter(
    attr: &mut sys::bindings::perf_event_attr,
    tid: libc::pid_t,
    cpu: i32,
    group_fd: i32,
) -> Result<OwnedFd, PmuError> {
    let fd = unsafe { sys::perf_event_open(attr, tid, cpu, group_fd, 0) };

    if fd < 0 {
        let err = io::Error::last_os_error();
        debug!(error = %err, config = attr.config, "perf_event_open failed");
        return Err(open_error(&err));
    }

    // Safety: the kernel just handed us this descriptor and nothing else
    // owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Map `perf_event_open(2)` errno values to typed errors.
fn open_error(err: &io::Error) -> PmuError {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => PmuError::PermissionDenied,
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::EOPNOTSUPP) => {
            PmuError::EventNotSupported
        }
        Some(libc::ESRCH) | Some(libc::EINVAL) => PmuError::InvalidTarget,
        Some(libc::EMFILE) | Some(libc::ENFILE) => PmuError::TooManyEvents,
        _ => PmuError::OpenFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let cases = [
            (libc::EACCES, PmuError::PermissionDenied),
            (libc::EPERM, PmuError::PermissionDenied),
            (libc::ENOENT, PmuError::EventNotSupported),
            (libc::ENODEV, PmuError::EventNotSupported),
            (libc::EOPNOTSUPP, PmuError::EventNotSupported),
            (libc::ESRCH, PmuError::InvalidTarget),
            (libc::EINVAL, PmuError::InvalidTarget),
            (libc::EMFILE, PmuError::TooManyEvents),
            (libc::ENFILE, PmuError::TooManyEvents),
            (libc::EIO, PmuError::OpenFailed),
        ];

        for (errno, expected) in cases {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(open_error(&err), expected, "errno {errno}");
        }
    }

    #[test]
    fn test_group_read_format_layout() {
        // 8-byte count followed by five 8-byte values, no padding.
        assert_eq!(mem::size_of::<GroupReadFormat>(), 48);
    }
}
