// Post-start application of a ResourcePolicy to a live process

use spawnline_core::{ResourcePolicy, Result, SpawnlineError};
use tracing::debug;

const AFFINITY_SUPPORTED: bool = cfg!(any(target_os = "linux", windows));
const WORKING_SET_SUPPORTED: bool = cfg!(windows);
const PRIORITY_CLASS_SUPPORTED: bool = cfg!(any(unix, windows));
const PRIORITY_BOOST_SUPPORTED: bool = cfg!(windows);

/// Reject values that are invalid anywhere, then fields this platform cannot honor.
///
/// Called before the process is created so an unsupported policy never
/// leaves a half-configured child behind.
pub fn ensure_supported(policy: &ResourcePolicy) -> Result<()> {
    if policy.is_default() {
        return Ok(());
    }

    if policy.processor_affinity == Some(0) {
        return Err(SpawnlineError::InvalidConfiguration(
            "processor affinity mask must select at least one processor".to_string(),
        ));
    }
    if let (Some(min), Some(max)) = (policy.min_working_set, policy.max_working_set) {
        if min > max {
            return Err(SpawnlineError::InvalidConfiguration(format!(
                "minimum working set {} exceeds maximum {}",
                min, max
            )));
        }
    }

    let unsupported = [
        (policy.processor_affinity.is_some() && !AFFINITY_SUPPORTED, "processor affinity"),
        (
            (policy.min_working_set.is_some() || policy.max_working_set.is_some())
                && !WORKING_SET_SUPPORTED,
            "working set limits",
        ),
        (policy.priority_class.is_some() && !PRIORITY_CLASS_SUPPORTED, "priority class"),
        (policy.priority_boost.is_some() && !PRIORITY_BOOST_SUPPORTED, "priority boost"),
    ];

    match unsupported.iter().find(|(unsupported, _)| *unsupported) {
        Some((_, name)) => Err(SpawnlineError::PlatformNotSupported(format!(
            "{} cannot be set on {}",
            name,
            std::env::consts::OS
        ))),
        None => Ok(()),
    }
}

/// Apply every set field of `policy` to the running process `pid`.
pub fn apply(pid: u32, policy: &ResourcePolicy) -> Result<()> {
    if policy.is_default() {
        return Ok(());
    }
    ensure_supported(policy)?;

    debug!(pid = pid, policy = ?policy, "Applying resource policy");
    platform::apply(pid, policy)
}

#[cfg(unix)]
mod platform {
    use spawnline_core::{PriorityClass, ResourcePolicy, Result, SpawnlineError};

    pub fn apply(pid: u32, policy: &ResourcePolicy) -> Result<()> {
        if let Some(mask) = policy.processor_affinity {
            set_affinity(pid, mask)?;
        }
        if let Some(class) = policy.priority_class {
            set_priority(pid, class)?;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_affinity(pid: u32, mask: u64) -> Result<()> {
        use nix::sched::{sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        let raw_pid = i32::try_from(pid).map_err(|_| {
            SpawnlineError::ExecutionError(format!("process id {} out of range", pid))
        })?;

        let mut cpu_set = CpuSet::new();
        for cpu in (0..64usize).filter(|cpu| mask & (1u64 << cpu) != 0) {
            cpu_set
                .set(cpu)
                .map_err(|e| SpawnlineError::IoError(e.into()))?;
        }

        sched_setaffinity(Pid::from_raw(raw_pid), &cpu_set)
            .map_err(|e| SpawnlineError::IoError(e.into()))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_affinity(_pid: u32, _mask: u64) -> Result<()> {
        Err(SpawnlineError::PlatformNotSupported(
            "processor affinity".to_string(),
        ))
    }

    fn set_priority(pid: u32, class: PriorityClass) -> Result<()> {
        // SAFETY: setpriority only reads its integer arguments.
        let result =
            unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, class.nice_value()) };
        if result == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use spawnline_core::{PriorityClass, ResourcePolicy, Result};
    use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
    use windows_sys::Win32::System::Threading::{
        GetProcessWorkingSetSize, OpenProcess, SetPriorityClass, SetProcessAffinityMask,
        SetProcessPriorityBoost, SetProcessWorkingSetSize, ABOVE_NORMAL_PRIORITY_CLASS,
        BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS, IDLE_PRIORITY_CLASS,
        NORMAL_PRIORITY_CLASS, PROCESS_QUERY_INFORMATION, PROCESS_SET_INFORMATION,
        PROCESS_SET_QUOTA, REALTIME_PRIORITY_CLASS,
    };

    struct ProcessHandle(HANDLE);

    impl Drop for ProcessHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn check(result: BOOL) -> Result<()> {
        if result == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn apply(pid: u32, policy: &ResourcePolicy) -> Result<()> {
        let raw = unsafe {
            OpenProcess(
                PROCESS_SET_INFORMATION | PROCESS_SET_QUOTA | PROCESS_QUERY_INFORMATION,
                0,
                pid,
            )
        };
        if raw.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }
        let handle = ProcessHandle(raw);

        if let Some(mask) = policy.processor_affinity {
            check(unsafe { SetProcessAffinityMask(handle.0, mask as usize) })?;
        }

        if policy.min_working_set.is_some() || policy.max_working_set.is_some() {
            let (mut min, mut max) = (0usize, 0usize);
            check(unsafe { GetProcessWorkingSetSize(handle.0, &mut min, &mut max) })?;
            check(unsafe {
                SetProcessWorkingSetSize(
                    handle.0,
                    policy.min_working_set.unwrap_or(min),
                    policy.max_working_set.unwrap_or(max),
                )
            })?;
        }

        if let Some(class) = policy.priority_class {
            let flag = match class {
                PriorityClass::Idle => IDLE_PRIORITY_CLASS,
                PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
                PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
                PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
                PriorityClass::High => HIGH_PRIORITY_CLASS,
                PriorityClass::RealTime => REALTIME_PRIORITY_CLASS,
            };
            check(unsafe { SetPriorityClass(handle.0, flag) })?;
        }

        if let Some(boost) = policy.priority_boost {
            check(unsafe { SetProcessPriorityBoost(handle.0, BOOL::from(!boost)) })?;
        }

        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use spawnline_core::{ResourcePolicy, Result, SpawnlineError};

    pub fn apply(_pid: u32, _policy: &ResourcePolicy) -> Result<()> {
        Err(SpawnlineError::PlatformNotSupported(
            "resource policies".to_string(),
        ))
    }
}
