// SPDX-License-Identifier: GPL-2.0
//
// cpufreq policy discovery from sysfs.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cpu_list::read_cpu_set;

pub const DEFAULT_CPUFREQ_ROOT: &str = "/sys/devices/system/cpu/cpufreq";

/// One `policyN` directory: a group of CPUs sharing a clock domain.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuFreqPolicy {
    pub id: usize,
    pub path: PathBuf,
    pub related_cpus: Vec<usize>,
    /// Online CPUs of the policy. Empty when the whole cluster is offline.
    pub affected_cpus: Vec<usize>,
    pub cpuinfo_min_khz: u32,
    pub cpuinfo_max_khz: u32,
}

impl CpuFreqPolicy {
    pub fn read(path: &Path) -> Result<Self> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("policy"))
            .and_then(|n| n.parse::<usize>().ok())
            .with_context(|| format!("not a cpufreq policy directory: {}", path.display()))?;

        let affected_cpus = match read_cpu_set(&path.join("affected_cpus")) {
            Ok(cpus) => cpus,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            id,
            path: path.to_path_buf(),
            related_cpus: read_cpu_set(&path.join("related_cpus"))?,
            affected_cpus,
            cpuinfo_min_khz: read_khz(&path.join("cpuinfo_min_freq"))?,
            cpuinfo_max_khz: read_khz(&path.join("cpuinfo_max_freq"))?,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.affected_cpus.is_empty()
    }

    /// First CPU of the policy, used as the policy's representative.
    pub fn cpu(&self) -> usize {
        self.related_cpus.first().copied().unwrap_or(self.id)
    }

    pub fn scaling_min_khz(&self) -> Result<u32> {
        read_khz(&self.path.join("scaling_min_freq"))
    }

    pub fn scaling_max_khz(&self) -> Result<u32> {
        read_khz(&self.path.join("scaling_max_freq"))
    }

    pub fn set_scaling_min_khz(&self, khz: u32) -> Result<()> {
        let path = self.path.join("scaling_min_freq");
        std::fs::write(&path, khz.to_string())
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

pub fn read_khz(path: &Path) -> Result<u32> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("invalid frequency in {}: {:?}", path.display(), raw.trim()))
}

/// Enumerate every `policyN` directory below `root`, sorted by id.
pub fn read_policies(root: &Path) -> Result<Vec<CpuFreqPolicy>> {
    let pattern = format!("{}/policy[0-9]*", root.display());
    let mut policies = Vec::new();
    for entry in glob::glob(&pattern).context("invalid cpufreq glob pattern")? {
        let path = entry?;
        match CpuFreqPolicy::read(&path) {
            Ok(policy) => policies.push(policy),
            Err(e) => log::warn!("skipping {}: {:#}", path.display(), e),
        }
    }
    policies.sort_by_key(|p| p.id);
    Ok(policies)
}

/// CPUs belonging to the slowest cluster, i.e. the policies sharing the
/// lowest `cpuinfo_max_freq`. Empty on a homogeneous system.
pub fn low_power_cpus(policies: &[CpuFreqPolicy]) -> Vec<usize> {
    let Some(lowest) = policies.iter().map(|p| p.cpuinfo_max_khz).min() else {
        return Vec::new();
    };
    if policies.iter().all(|p| p.cpuinfo_max_khz == lowest) {
        return Vec::new();
    }
    policies
        .iter()
        .filter(|p| p.cpuinfo_max_khz == lowest)
        .flat_map(|p| p.related_cpus.iter().copied())
        .collect()
}

/// CPUs belonging to the policies with the highest `cpuinfo_max_freq`.
pub fn turbo_cpus(policies: &[CpuFreqPolicy]) -> Vec<usize> {
    let Some(highest) = policies.iter().map(|p| p.cpuinfo_max_khz).max() else {
        return Vec::new();
    };
    policies
        .iter()
        .filter(|p| p.cpuinfo_max_khz == highest)
        .flat_map(|p| p.related_cpus.iter().copied())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fake_policy(root: &Path, id: usize, cpus: &str, min: u32, max: u32) -> PathBuf {
        let dir = root.join(format!("policy{}", id));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("related_cpus"), format!("{}\n", cpus)).unwrap();
        std::fs::write(dir.join("affected_cpus"), format!("{}\n", cpus)).unwrap();
        std::fs::write(dir.join("cpuinfo_min_freq"), format!("{}\n", min)).unwrap();
        std::fs::write(dir.join("cpuinfo_max_freq"), format!("{}\n", max)).unwrap();
        std::fs::write(dir.join("scaling_min_freq"), format!("{}\n", min)).unwrap();
        std::fs::write(dir.join("scaling_max_freq"), format!("{}\n", max)).unwrap();
        dir
    }

    #[test]
    fn reads_and_sorts_policies() {
        let dir = tempfile::tempdir().unwrap();
        fake_policy(dir.path(), 4, "4 5 6 7", 500_000, 2_800_000);
        fake_policy(dir.path(), 0, "0 1 2 3", 300_000, 1_800_000);

        let policies = read_policies(dir.path()).unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].id, 0);
        assert_eq!(policies[0].related_cpus, vec![0, 1, 2, 3]);
        assert_eq!(policies[1].cpuinfo_min_khz, 500_000);
        assert_eq!(policies[1].cpu(), 4);
        assert!(policies[1].is_active());
    }

    #[test]
    fn offline_cluster_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_policy(dir.path(), 0, "0 1", 300_000, 1_800_000);
        std::fs::write(path.join("affected_cpus"), "\n").unwrap();

        let policies = read_policies(dir.path()).unwrap();
        assert!(!policies[0].is_active());
    }

    #[test]
    fn homogeneous_system_has_no_low_power_cpus() {
        let dir = tempfile::tempdir().unwrap();
        fake_policy(dir.path(), 0, "0 1", 300_000, 2_000_000);
        fake_policy(dir.path(), 2, "2 3", 300_000, 2_000_000);

        let policies = read_policies(dir.path()).unwrap();
        assert!(low_power_cpus(&policies).is_empty());
        assert_eq!(turbo_cpus(&policies), vec![0, 1, 2, 3]);
    }

    #[test]
    fn writes_scaling_min() {
        let dir = tempfile::tempdir().unwrap();
        fake_policy(dir.path(), 0, "0", 300_000, 1_800_000);
        let policies = read_policies(dir.path()).unwrap();

        policies[0].set_scaling_min_khz(1_200_000).unwrap();
        assert_eq!(policies[0].scaling_min_khz().unwrap(), 1_200_000);
        assert_eq!(policies[0].scaling_max_khz().unwrap(), 1_800_000);
    }
}
