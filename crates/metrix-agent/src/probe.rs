//! Best-effort process and OS probes.
//!
//! Values come from procfs on Linux and from libc elsewhere on unix.
//! Anything that cannot be observed is left out rather than guessed.

#[cfg(target_os = "linux")]
use std::path::Path;

use metrix_core::Metric;

/// Version of the runtime gauge set below. Bump when names change.
pub const RUNTIME_SET_VERSION: u32 = 1;

/// Process gauges sampled on the runtime tick.
pub const RUNTIME_GAUGES: [&str; 8] = [
    "ResidentMemory",
    "VirtualMemory",
    "PeakResidentMemory",
    "Threads",
    "MinorFaults",
    "MajorFaults",
    "UserCPUSeconds",
    "SystemCPUSeconds",
];

fn push_gauge(out: &mut Vec<Metric>, name: impl Into<String>, value: f64) {
    if !value.is_finite() {
        return;
    }
    out.push(Metric::gauge(name, value));
}

#[cfg(target_os = "linux")]
fn linux_clk_tck() -> f64 {
    // SAFETY: `sysconf` is thread-safe for this query and has no side effects.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 { hz as f64 } else { 100.0 }
}

/// Value of a `Key:   1234 kB` line, scaled to bytes when a kB unit is present.
#[cfg(target_os = "linux")]
fn parse_kv_line(line: &str) -> Option<(&str, f64)> {
    let (key, rest) = line.split_once(':')?;
    let mut parts = rest.split_whitespace();
    let value = parts.next()?.parse::<f64>().ok()?;
    let scale = if parts.next() == Some("kB") { 1024.0 } else { 1.0 };
    Some((key.trim(), value * scale))
}

/// Gauges describing this process.
pub fn runtime_gauges() -> Vec<Metric> {
    let mut out = Vec::with_capacity(RUNTIME_GAUGES.len());
    #[cfg(target_os = "linux")]
    {
        collect_linux_status(&mut out, Path::new("/proc/self/status"));
        collect_linux_stat(&mut out, Path::new("/proc/self/stat"));
    }
    out
}

#[cfg(target_os = "linux")]
fn collect_linux_status(out: &mut Vec<Metric>, path: &Path) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    for line in raw.lines() {
        let Some((key, value)) = parse_kv_line(line) else {
            continue;
        };
        let name = match key {
            "VmRSS" => "ResidentMemory",
            "VmSize" => "VirtualMemory",
            "VmHWM" => "PeakResidentMemory",
            "Threads" => "Threads",
            _ => continue,
        };
        push_gauge(out, name, value);
    }
}

#[cfg(target_os = "linux")]
fn collect_linux_stat(out: &mut Vec<Metric>, path: &Path) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    // The command name may contain spaces; fields restart after the last ')'.
    let Some((_, rest)) = raw.rsplit_once(')') else {
        return;
    };
    let fields: Vec<f64> = rest
        .split_whitespace()
        .map(|s| s.parse::<f64>().unwrap_or(f64::NAN))
        .collect();
    let clk_tck = linux_clk_tck();
    // Offsets are relative to field 3 (state) of proc(5).
    let field = |n: usize| fields.get(n - 3).copied().unwrap_or(f64::NAN);

    push_gauge(out, "MinorFaults", field(10));
    push_gauge(out, "MajorFaults", field(12));
    push_gauge(out, "UserCPUSeconds", field(14) / clk_tck);
    push_gauge(out, "SystemCPUSeconds", field(15) / clk_tck);
}

/// Cumulative jiffies for one CPU line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Share of the interval since `earlier` spent busy, in percent.
    pub fn utilization_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let busy = self.busy.checked_sub(earlier.busy)?;
        if total == 0 {
            return None;
        }
        Some(busy as f64 / total as f64 * 100.0)
    }
}

/// Parse per-CPU lines (`cpu0`, `cpu1`, ...) of `/proc/stat`.
pub fn parse_proc_stat(raw: &str) -> Vec<CpuTimes> {
    raw.lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .filter_map(|line| {
            let values: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|v| v.parse().ok())
                .collect();
            if values.len() < 4 {
                return None;
            }
            // guest and guest_nice are already counted in user and nice.
            let total: u64 = values.iter().take(8).sum();
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            Some(CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            })
        })
        .collect()
}

pub fn read_cpu_times() -> Vec<CpuTimes> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/stat")
            .map(|raw| parse_proc_stat(&raw))
            .unwrap_or_default()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

/// `TotalMemory` and `FreeMemory` in bytes.
pub fn memory_gauges() -> Vec<Metric> {
    let mut out = Vec::with_capacity(2);
    #[cfg(target_os = "linux")]
    {
        let Ok(mem) = std::fs::read_to_string("/proc/meminfo") else {
            return out;
        };
        for line in mem.lines() {
            let Some((key, value)) = parse_kv_line(line) else {
                continue;
            };
            match key {
                "MemTotal" => push_gauge(&mut out, "TotalMemory", value),
                "MemFree" => push_gauge(&mut out, "FreeMemory", value),
                _ => {}
            }
        }
    }
    out
}

/// 1, 5 and 15 minute load averages.
pub fn load_gauges() -> Vec<Metric> {
    let mut out = Vec::with_capacity(3);
    #[cfg(unix)]
    {
        let mut values = [0.0_f64; 3];
        // SAFETY: `getloadavg` writes up to `n` doubles to a valid buffer.
        let n = unsafe { libc::getloadavg(values.as_mut_ptr(), 3) };
        let names = ["LoadAverage1", "LoadAverage5", "LoadAverage15"];
        for (name, value) in names.iter().zip(values).take(n.max(0) as usize) {
            push_gauge(&mut out, *name, value);
        }
    }
    out
}
