//! Process resource sampling.

use std::fs;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};

/// Scheduler ticks per second assumed for `/proc/<pid>/stat` times.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// CPU use since the previous sample, as a percent of one core.
    pub cpu_percent: f64,
}

impl ResourceSample {
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Samples memory and CPU of the running process.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample>;
}

/// Linux `/proc/self` probe.
#[derive(Debug, Default)]
pub struct ProcProbe {
    last: Option<(Instant, u64)>,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceProbe for ProcProbe {
    fn sample(&mut self) -> Result<ResourceSample> {
        let status = fs::read_to_string("/proc/self/status").context("read /proc/self/status")?;
        let memory_bytes = parse_vm_rss(&status)?;

        let stat = fs::read_to_string("/proc/self/stat").context("read /proc/self/stat")?;
        let ticks = parse_cpu_ticks(&stat)?;
        let now = Instant::now();
        let cpu_percent = match self.last.replace((now, ticks)) {
            Some((at, prev)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    (ticks.saturating_sub(prev) as f64 / CLOCK_TICKS_PER_SEC) / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        Ok(ResourceSample {
            memory_bytes,
            cpu_percent,
        })
    }
}

/// `VmRSS:   12345 kB` from `/proc/<pid>/status`, in bytes.
fn parse_vm_rss(status: &str) -> Result<u64> {
    let line = status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .ok_or_else(|| anyhow!("VmRSS missing from status"))?;
    let kb: u64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("VmRSS has no value"))?
        .parse()
        .context("parse VmRSS")?;
    Ok(kb * 1024)
}

/// `utime + stime` from `/proc/<pid>/stat`.
///
/// The command name (field 2) may contain spaces, so fields are counted from
/// the closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Result<u64> {
    let rest = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("malformed stat line"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After the name: state is field 3, utime is 14, stime is 15.
    let field = |n: usize| -> Result<u64> {
        fields
            .get(n - 3)
            .ok_or_else(|| anyhow!("stat field {n} missing"))?
            .parse::<u64>()
            .with_context(|| format!("parse stat field {n}"))
    };
    Ok(field(14)? + field(15)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_in_bytes() {
        let status = "Name:\ttaskpilot\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status).expect("rss"), 2 * 1024 * 1024);
    }

    #[test]
    fn parses_cpu_ticks_with_spaces_in_name() {
        let stat = "42 (task pilot) S 1 42 42 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1000 0 0";
        assert_eq!(parse_cpu_ticks(stat).expect("ticks"), 300);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_probe_samples_this_process() {
        let mut probe = ProcProbe::new();
        let first = probe.sample().expect("sample");
        assert!(first.memory_bytes > 0);
        assert_eq!(first.cpu_percent, 0.0);
        assert!(probe.sample().expect("second sample").cpu_percent >= 0.0);
    }
}
