// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: cpufreq sysfs governor
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use cpufreq_utils::{read_policies, CpuFreqPolicy};
use log::{debug, info, trace, warn};

use crate::notify::Governor;
use crate::policy::{FrequencyPolicyRequest, PolicyAdjuster};

/// Applies the adjuster's floor to every online cpufreq policy by writing
/// `scaling_min_freq`. `scaling_max_freq` is never touched.
pub struct SysfsGovernor {
    root: PathBuf,
    adjuster: Arc<PolicyAdjuster>,
    dry_run: bool,
}

impl SysfsGovernor {
    pub fn new(root: &Path, adjuster: Arc<PolicyAdjuster>, dry_run: bool) -> Result<Self> {
        let policies = read_policies(root)?;
        if policies.is_empty() {
            bail!("no cpufreq policies found under {}", root.display());
        }
        for p in policies.iter() {
            info!(
                "policy{}: cpus {:?} {}-{} kHz ({:?})",
                p.id,
                p.related_cpus,
                p.cpuinfo_min_khz,
                p.cpuinfo_max_khz,
                adjuster.classes().class_of(p.cpu()),
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            adjuster,
            dry_run,
        })
    }

    fn request_for(policy: &CpuFreqPolicy) -> Result<FrequencyPolicyRequest> {
        Ok(FrequencyPolicyRequest {
            cpu: policy.cpu(),
            hw_min_khz: policy.cpuinfo_min_khz,
            hw_max_khz: policy.cpuinfo_max_khz,
            proposed_min_khz: policy.scaling_min_khz()?,
            proposed_max_khz: policy.scaling_max_khz()?,
        })
    }

    /// Returns true if the floor was (or in dry-run would have been) written.
    fn apply(&self, policy: &CpuFreqPolicy) -> Result<bool> {
        let req = Self::request_for(policy)?;
        let floor = self.adjuster.adjust(&req).min(req.proposed_max_khz);
        if floor == req.proposed_min_khz {
            trace!("policy{}: floor unchanged at {} kHz", policy.id, floor);
            return Ok(false);
        }

        if self.dry_run {
            info!(
                "policy{}: would set scaling_min_freq {} -> {} kHz",
                policy.id, req.proposed_min_khz, floor
            );
        } else {
            policy.set_scaling_min_khz(floor)?;
            debug!(
                "policy{}: scaling_min_freq {} -> {} kHz",
                policy.id, req.proposed_min_khz, floor
            );
        }
        Ok(true)
    }
}

impl Governor for SysfsGovernor {
    fn recompute_all_active_cores(&self) -> Result<usize> {
        let mut changed = 0;
        for policy in read_policies(&self.root)? {
            // Offline clusters have no CPU to boost and reject writes.
            if !policy.is_active() {
                continue;
            }
            match self.apply(&policy) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!("policy{}: {:#}", policy.id, e),
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{CoreClassification, RestingFloors};
    use crate::state::{BoostFlags, BoostState};
    use cpufreq_utils::read_khz;

    fn fake_policy(root: &Path, id: usize, cpus: &str, min: u32, max: u32) -> PathBuf {
        let dir = root.join(format!("policy{}", id));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, val) in [
            ("related_cpus", cpus.to_string()),
            ("affected_cpus", cpus.to_string()),
            ("cpuinfo_min_freq", min.to_string()),
            ("cpuinfo_max_freq", max.to_string()),
            ("scaling_min_freq", min.to_string()),
            ("scaling_max_freq", max.to_string()),
        ] {
            std::fs::write(dir.join(name), format!("{}\n", val)).unwrap();
        }
        dir
    }

    fn scaling_min(dir: &Path) -> u32 {
        read_khz(&dir.join("scaling_min_freq")).unwrap()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        little: PathBuf,
        big: PathBuf,
        state: Arc<BoostState>,
        governor: SysfsGovernor,
    }

    fn fixture(dry_run: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let little = fake_policy(tmp.path(), 0, "0-3", 300_000, 1_800_000);
        let big = fake_policy(tmp.path(), 4, "4-7", 400_000, 2_800_000);

        let state = Arc::new(BoostState::new());
        state.latch_boost_freqs(1_000_000, 1_400_000);
        let policies = read_policies(tmp.path()).unwrap();
        let adjuster = Arc::new(PolicyAdjuster::new(
            Arc::clone(&state),
            CoreClassification::detect(&policies),
            RestingFloors {
                low_power_khz: 500_000,
                performance_khz: 0,
            },
        ));
        let governor = SysfsGovernor::new(tmp.path(), adjuster, dry_run).unwrap();
        Fixture {
            _tmp: tmp,
            little,
            big,
            state,
            governor,
        }
    }

    #[test]
    fn floors_follow_state() {
        let f = fixture(false);

        assert_eq!(f.governor.recompute_all_active_cores().unwrap(), 1);
        assert_eq!(scaling_min(&f.little), 500_000);
        assert_eq!(scaling_min(&f.big), 400_000);

        f.state.set(BoostFlags::INPUT_BOOST);
        assert_eq!(f.governor.recompute_all_active_cores().unwrap(), 2);
        assert_eq!(scaling_min(&f.little), 1_000_000);
        assert_eq!(scaling_min(&f.big), 1_400_000);

        f.state.set(BoostFlags::MAX_BOOST);
        f.governor.recompute_all_active_cores().unwrap();
        assert_eq!(scaling_min(&f.little), 1_800_000);
        assert_eq!(scaling_min(&f.big), 2_800_000);

        f.state.set(BoostFlags::SCREEN_OFF);
        f.governor.recompute_all_active_cores().unwrap();
        assert_eq!(scaling_min(&f.little), 300_000);
        assert_eq!(scaling_min(&f.big), 400_000);
    }

    #[test]
    fn floor_never_exceeds_scaling_max() {
        let f = fixture(false);
        std::fs::write(f.big.join("scaling_max_freq"), "1200000\n").unwrap();

        f.state.set(BoostFlags::INPUT_BOOST);
        f.governor.recompute_all_active_cores().unwrap();
        assert_eq!(scaling_min(&f.big), 1_200_000);
    }

    #[test]
    fn offline_policy_is_skipped() {
        let f = fixture(false);
        std::fs::write(f.big.join("affected_cpus"), "\n").unwrap();

        f.state.set(BoostFlags::MAX_BOOST);
        assert_eq!(f.governor.recompute_all_active_cores().unwrap(), 1);
        assert_eq!(scaling_min(&f.big), 400_000);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let f = fixture(true);
        f.state.set(BoostFlags::MAX_BOOST);
        assert_eq!(f.governor.recompute_all_active_cores().unwrap(), 2);
        assert_eq!(scaling_min(&f.little), 300_000);
        assert_eq!(scaling_min(&f.big), 400_000);
    }

    #[test]
    fn empty_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let adjuster = Arc::new(PolicyAdjuster::new(
            Arc::new(BoostState::new()),
            CoreClassification::default(),
            RestingFloors::default(),
        ));
        assert!(SysfsGovernor::new(tmp.path(), adjuster, false).is_err());
    }
}
