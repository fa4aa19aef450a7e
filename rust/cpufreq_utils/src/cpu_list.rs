// SPDX-License-Identifier: GPL-2.0
use crate::policy::{low_power_cpus, read_policies, turbo_cpus, DEFAULT_CPUFREQ_ROOT};
use crate::NR_CPU_IDS;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Powermode {
    Turbo,
    Performance,
    Powersave,
    Any,
}

fn get_primary_cpus(mode: Powermode, root: &Path) -> anyhow::Result<Vec<usize>> {
    let policies = read_policies(root)?;
    let all: Vec<usize> = policies
        .iter()
        .flat_map(|p| p.related_cpus.iter().copied())
        .collect();
    let lp = low_power_cpus(&policies);

    let mut cpus = match mode {
        Powermode::Turbo => turbo_cpus(&policies),
        Powermode::Performance => all.into_iter().filter(|c| !lp.contains(c)).collect(),
        Powermode::Powersave => lp,
        Powermode::Any => all,
    };
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Parse a CPU list such as `0-3,6` or one of the keywords `powersave`,
/// `performance`, `turbo` and `all`, which are resolved against the cpufreq
/// policies of the running system.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>, String> {
    parse_cpu_list_in(optarg, Path::new(DEFAULT_CPUFREQ_ROOT))
}

/// Same as [`parse_cpu_list`], resolving keywords against `root`.
pub fn parse_cpu_list_in(optarg: &str, root: &Path) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    if let Some(mode) = match optarg {
        "powersave" => Some(Powermode::Powersave),
        "performance" => Some(Powermode::Performance),
        "turbo" => Some(Powermode::Turbo),
        "all" => Some(Powermode::Any),
        _ => None,
    } {
        return get_primary_cpus(mode, root).map_err(|e| e.to_string());
    }

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in CPU list".to_string());
    }

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        push_token(token, &mut cpus, &mut seen, *NR_CPU_IDS)?;
    }

    Ok(cpus)
}

/// Read a sysfs CPU set file. Accepts both the range format of
/// `cpu/possible` (`0-3,6`) and the space separated format of
/// `related_cpus` (`0 1 2 3`).
pub fn read_cpu_set(path: &Path) -> anyhow::Result<Vec<usize>> {
    let raw = std::fs::read_to_string(path)?;
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();
    for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        push_token(token, &mut cpus, &mut seen, usize::MAX)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    }
    Ok(cpus)
}

fn push_token(
    token: &str,
    cpus: &mut Vec<usize>,
    seen: &mut HashSet<usize>,
    max_cpus: usize,
) -> Result<(), String> {
    if let Some((start_str, end_str)) = token.split_once('-') {
        let start = start_str.trim().parse::<usize>().map_err(|_| "Invalid range start")?;
        let end = end_str.trim().parse::<usize>().map_err(|_| "Invalid range end")?;
        if start > end {
            return Err(format!("Invalid CPU range: {}-{}", start, end));
        }
        for i in start..=end {
            if cpus.len() >= max_cpus {
                return Err(format!("Too many CPUs specified (max {})", max_cpus));
            }
            if seen.insert(i) {
                cpus.push(i);
            }
        }
    } else {
        let cpu = token.parse::<usize>().map_err(|_| format!("Invalid CPU: {}", token))?;
        if cpus.len() >= max_cpus {
            return Err(format!("Too many CPUs specified (max {})", max_cpus));
        }
        if seen.insert(cpu) {
            cpus.push(cpu);
        }
    }
    Ok(())
}
