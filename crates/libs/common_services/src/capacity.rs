//! Sizing how many worker processes a machine should run, and starting them.

use app_state::CapacitySettings;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use sysinfo::System;
use tracing::info;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityInput {
    pub cpu_cores: usize,
    pub available_memory_mb: u64,
    /// Memory one in-flight job needs. Zero means memory doesn't bound the plan.
    pub per_job_memory_mb: u64,
    pub max_cap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub reserve_cores: usize,
    pub memory_headroom_mb: u64,
    pub jobs_per_instance: usize,
}

impl CapacityPolicy {
    #[must_use]
    pub const fn from_settings(settings: &CapacitySettings) -> Self {
        Self {
            reserve_cores: settings.reserve_cores,
            memory_headroom_mb: settings.memory_headroom_mb,
            jobs_per_instance: settings.jobs_per_instance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPlan {
    pub instance_count: usize,
    pub concurrency_per_instance: usize,
}

impl CapacityPlan {
    #[must_use]
    pub const fn total_concurrency(&self) -> usize {
        self.instance_count * self.concurrency_per_instance
    }
}

/// Picks the number of worker processes and the concurrency of each.
///
/// The target is the smallest of free cores, memory-bound job count and `max_cap`, but never
/// below one. The product of the two results never exceeds that target.
#[must_use]
pub fn plan(input: CapacityInput, policy: CapacityPolicy) -> CapacityPlan {
    let by_cores = input.cpu_cores.saturating_sub(policy.reserve_cores);
    let by_memory = if input.per_job_memory_mb == 0 {
        usize::MAX
    } else {
        let usable = input.available_memory_mb.saturating_sub(policy.memory_headroom_mb);
        usize::try_from(usable / input.per_job_memory_mb).unwrap_or(usize::MAX)
    };
    let target = by_cores.min(by_memory).min(input.max_cap).max(1);

    let per_instance = policy.jobs_per_instance.max(1);
    let instance_count = target.div_ceil(per_instance);
    let concurrency_per_instance = (target / instance_count).max(1);

    CapacityPlan {
        instance_count,
        concurrency_per_instance,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpu_cores: usize,
    pub available_memory_mb: u64,
}

impl Resources {
    #[must_use]
    pub const fn input(&self, settings: &CapacitySettings) -> CapacityInput {
        CapacityInput {
            cpu_cores: self.cpu_cores,
            available_memory_mb: self.available_memory_mb,
            per_job_memory_mb: settings.per_job_memory_mb,
            max_cap: settings.max_cap,
        }
    }
}

/// Cores and currently available memory of this machine.
#[must_use]
pub fn detect_resources() -> Resources {
    let cpu_cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let mut system = System::new();
    system.refresh_memory();
    Resources {
        cpu_cores,
        available_memory_mb: system.available_memory() / MB,
    }
}

/// How to start one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    #[must_use]
    pub fn from_settings(settings: &CapacitySettings) -> Self {
        Self {
            binary: settings.worker_binary.clone(),
            args: settings.worker_args.clone(),
        }
    }
}

/// Starts `plan.instance_count` detached workers and returns their pids. They aren't supervised.
pub fn launch(plan: CapacityPlan, spec: &LaunchSpec) -> std::io::Result<Vec<u32>> {
    let mut pids = Vec::with_capacity(plan.instance_count);
    for _ in 0..plan.instance_count {
        let mut command = Command::new(&spec.binary);
        command
            .args(&spec.args)
            .arg("--concurrency")
            .arg(plan.concurrency_per_instance.to_string())
            .stdin(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a Ctrl-C in the launching shell doesn't reach the workers.
            command.process_group(0);
        }
        let child = command.spawn()?;
        info!(
            "Launched {} (pid {}) with concurrency {}",
            spec.binary.display(),
            child.id(),
            plan.concurrency_per_instance
        );
        pids.push(child.id());
    }
    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: CapacityPolicy = CapacityPolicy {
        reserve_cores: 1,
        memory_headroom_mb: 2048,
        jobs_per_instance: 4,
    };

    fn input(cpu_cores: usize, available_memory_mb: u64) -> CapacityInput {
        CapacityInput {
            cpu_cores,
            available_memory_mb,
            per_job_memory_mb: 256,
            max_cap: 32,
        }
    }

    #[test]
    fn core_bound_plan() {
        let plan = plan(input(16, 64 * 1024), POLICY);
        assert_eq!(
            plan,
            CapacityPlan {
                instance_count: 4,
                concurrency_per_instance: 3
            }
        );
        assert!(plan.total_concurrency() <= 15);
    }

    #[test]
    fn memory_bound_plan() {
        // (3072 - 2048) / 256 = 4 jobs
        let plan = plan(input(64, 3072), POLICY);
        assert_eq!(plan.instance_count, 1);
        assert_eq!(plan.concurrency_per_instance, 4);
    }

    #[test]
    fn cap_bound_plan() {
        let plan = plan(input(128, 1024 * 1024), POLICY);
        assert_eq!(plan.total_concurrency(), 32);
        assert_eq!(plan.instance_count, 8);
    }

    #[test]
    fn starved_machine_still_runs_one_job() {
        let plan = plan(input(1, 512), POLICY);
        assert_eq!(
            plan,
            CapacityPlan {
                instance_count: 1,
                concurrency_per_instance: 1
            }
        );
    }

    #[test]
    fn total_never_exceeds_target() {
        for cores in 1..64 {
            for jobs_per_instance in 0..9 {
                let policy = CapacityPolicy {
                    jobs_per_instance,
                    ..POLICY
                };
                let input = CapacityInput {
                    per_job_memory_mb: 0,
                    ..input(cores, 0)
                };
                let target = cores.saturating_sub(1).clamp(1, 32);
                let plan = plan(input, policy);
                assert!(plan.total_concurrency() <= target, "{cores} cores, {jobs_per_instance} per instance");
                assert!(plan.concurrency_per_instance >= 1);
            }
        }
    }

    #[test]
    fn detects_at_least_one_core() {
        assert!(detect_resources().cpu_cores >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn launch_returns_one_pid_per_instance() -> std::io::Result<()> {
        let spec = LaunchSpec {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_owned(), "exit 0".to_owned()],
        };
        let plan = CapacityPlan {
            instance_count: 2,
            concurrency_per_instance: 3,
        };
        let pids = launch(plan, &spec)?;
        assert_eq!(pids.len(), 2);
        assert_ne!(pids[0], pids[1]);
        Ok(())
    }
}
