//! Core pinning and priority helpers for the scheduler thread.
//!
//! Both helpers act on the calling thread. Platforms without support report success and do
//! nothing, so callers can apply a placement unconditionally.

use crate::config::ThreadPlacement;
use std::io;
use tracing::{debug, warn};

/// Map a coarse priority level onto the platform scheduler.
///
/// ## Linux
/// - `priority >= 3`: `SCHED_FIFO` 90
/// - `priority == 2`: `SCHED_FIFO` 70
/// - `priority == 1`: `SCHED_RR` 30
/// - otherwise: `SCHED_OTHER`
///
/// Real-time policies need `CAP_SYS_NICE`; without it the call fails with `EPERM`.
///
/// ## macOS
/// QoS classes: user-initiated for `>= 2`, utility for `1`, background otherwise.
pub fn set_thread_priority(priority: i32) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };

        let (policy, sched_priority) = match priority {
            p if p >= 3 => (SCHED_FIFO, 90),
            2 => (SCHED_FIFO, 70),
            1 => (SCHED_RR, 30),
            _ => (SCHED_OTHER, 0),
        };

        // SAFETY: sched_param is plain data and pthread_self is always valid for this thread.
        let rc = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(target_os = "macos")]
    {
        // From pthread/qos.h
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x15;
        const QOS_CLASS_BACKGROUND: u32 = 0x09;

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }

        let qos_class = match priority {
            p if p >= 2 => QOS_CLASS_USER_INITIATED,
            1 => QOS_CLASS_UTILITY,
            _ => QOS_CLASS_BACKGROUND,
        };
        // SAFETY: only changes the QoS class of the calling thread.
        let rc = unsafe { pthread_set_qos_class_self_np(qos_class, 0) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = priority;
        Ok(())
    }
}

/// Pin the calling thread to `core_id`.
pub fn set_thread_core(core_id: usize) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if core_id >= CPU_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("core {core_id} is outside the cpu set"),
            ));
        }
        // SAFETY: the set is zero-initialised and core_id is within CPU_SETSIZE.
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        Ok(())
    }
}

/// Apply `placement` to the calling thread. Failures are logged and otherwise ignored.
pub fn apply_placement(placement: &ThreadPlacement) {
    if let Some(core) = placement.core {
        match set_thread_core(core) {
            Ok(()) => debug!(core, "pinned thread"),
            Err(err) => warn!(core, error = %err, "failed to pin thread"),
        }
    }
    if let Some(priority) = placement.priority {
        match set_thread_priority(priority) {
            Ok(()) => debug!(priority, "raised thread priority"),
            Err(err) => warn!(priority, error = %err, "failed to set thread priority"),
        }
    }
}
