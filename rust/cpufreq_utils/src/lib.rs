// SPDX-License-Identifier: GPL-2.0
//
// cpufreq_utils: helpers shared by the cpu_input_boost tooling
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod cpu_list;
pub use cpu_list::parse_cpu_list;
pub use cpu_list::parse_cpu_list_in;
pub use cpu_list::read_cpu_set;
pub use cpu_list::Powermode;

mod policy;
pub use policy::low_power_cpus;
pub use policy::read_khz;
pub use policy::read_policies;
pub use policy::turbo_cpus;
pub use policy::CpuFreqPolicy;
pub use policy::DEFAULT_CPUFREQ_ROOT;

use lazy_static::lazy_static;

const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

lazy_static! {
    /// Number of possible CPU ids on this system, i.e. one past the highest
    /// id listed in `/sys/devices/system/cpu/possible`.
    pub static ref NR_CPU_IDS: usize = read_nr_cpu_ids();
}

fn read_nr_cpu_ids() -> usize {
    match read_cpu_set(std::path::Path::new(POSSIBLE_CPUS)) {
        Ok(cpus) if !cpus.is_empty() => cpus.iter().max().map(|m| m + 1).unwrap_or(1),
        _ => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}
