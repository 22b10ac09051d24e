//! Point-in-time CPU and memory readings for a running process.

use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};

/// One resource reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    /// CPU usage since the previous sample, in percent of one core.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// Source of process statistics. Implementations keep whatever state they
/// need to turn cumulative counters into rates.
pub trait ProcessSampler: Send + 'static {
    /// Read the process. `Ok(None)` means the process no longer exists.
    fn sample(&mut self, pid: u32) -> Result<Option<ProcessSample>>;
}

/// Platform default: procfs on Linux, `ps` elsewhere.
pub fn default_sampler() -> Box<dyn ProcessSampler> {
    if cfg!(target_os = "linux") {
        Box::new(ProcfsSampler::new())
    } else {
        Box::new(PsSampler)
    }
}

/// Clock ticks per second for `/proc/<pid>/stat` times. Fixed at 100 on
/// every mainstream Linux build.
const USER_HZ: f64 = 100.0;

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/status`.
#[derive(Debug)]
pub struct ProcfsSampler {
    proc_root: PathBuf,
    last_ticks: u64,
    last_at: Instant,
}

impl ProcfsSampler {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Sampler reading from an alternate procfs mount.
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            last_ticks: 0,
            last_at: Instant::now(),
        }
    }
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for ProcfsSampler {
    fn sample(&mut self, pid: u32) -> Result<Option<ProcessSample>> {
        let dir = self.proc_root.join(pid.to_string());
        let Ok(stat) = std::fs::read_to_string(dir.join("stat")) else {
            return Ok(None);
        };
        let Some(stat) = parse_stat(&stat)? else {
            return Ok(None);
        };
        let status = match std::fs::read_to_string(dir.join("status")) {
            Ok(status) => status,
            Err(_) => return Ok(None),
        };
        let rss_bytes = parse_vm_rss_bytes(&status).unwrap_or(0);

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let delta_ticks = stat.total_ticks.saturating_sub(self.last_ticks);
        self.last_ticks = stat.total_ticks;
        self.last_at = now;
        let cpu_percent = if elapsed > 0.0 {
            (delta_ticks as f64 / USER_HZ) / elapsed * 100.0
        } else {
            0.0
        };
        Ok(Some(ProcessSample {
            cpu_percent,
            rss_bytes,
        }))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    total_ticks: u64,
}

/// Parse utime+stime from `/proc/<pid>/stat`. Zombies count as gone.
fn parse_stat(raw: &str) -> Result<Option<StatFields>> {
    // The command name may contain spaces and parens; fields resume after the last ')'.
    let close = raw
        .rfind(')')
        .ok_or_else(|| anyhow!("malformed stat line"))?;
    let fields: Vec<&str> = raw[close + 1..].split_whitespace().collect();
    if fields.first().is_some_and(|state| *state == "Z" || *state == "X") {
        return Ok(None);
    }
    let field = |idx: usize| -> Result<u64> {
        fields
            .get(idx)
            .ok_or_else(|| anyhow!("stat line missing field {idx}"))?
            .parse::<u64>()
            .with_context(|| format!("parse stat field {idx}"))
    };
    // utime and stime are fields 14 and 15 of the full line.
    let utime = field(11)?;
    let stime = field(12)?;
    Ok(Some(StatFields {
        total_ticks: utime + stime,
    }))
}

fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Portable fallback shelling out to `ps`. Reports lifetime-average CPU.
#[derive(Debug, Default)]
pub struct PsSampler;

impl ProcessSampler for PsSampler {
    fn sample(&mut self, pid: u32) -> Result<Option<ProcessSample>> {
        let output = Command::new("ps")
            .args(["-o", "%cpu=,rss=", "-p", &pid.to_string()])
            .output()
            .context("spawn ps")?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let (Some(cpu), Some(rss)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        Ok(Some(ProcessSample {
            cpu_percent: cpu.parse().context("parse ps %cpu")?,
            rss_bytes: rss.parse::<u64>().context("parse ps rss")? * 1024,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const STAT: &str = "4242 (my (weird) cmd) R 1 4242 4242 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1000 1000000 300 18446744073709551615";

    #[test]
    fn parses_stat_with_parens_in_command() {
        let parsed = parse_stat(STAT).expect("parse").expect("alive");
        assert_eq!(parsed.total_ticks, 300);
    }

    #[test]
    fn zombie_counts_as_gone() {
        let zombie = STAT.replace(") R ", ") Z ");
        assert!(parse_stat(&zombie).expect("parse").is_none());
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tsleep\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss_bytes(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss_bytes("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn procfs_sampler_reads_fake_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("77");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("stat"), STAT).expect("write stat");
        fs::write(dir.join("status"), "VmRSS:\t1024 kB\n").expect("write status");

        let mut sampler = ProcfsSampler::with_root(temp.path());
        let sample = sampler.sample(77).expect("sample").expect("alive");
        assert_eq!(sample.rss_bytes, 1024 * 1024);
        assert!(sample.cpu_percent > 0.0);

        assert!(sampler.sample(78).expect("sample").is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_current_process() {
        let mut sampler = ProcfsSampler::new();
        let sample = sampler
            .sample(std::process::id())
            .expect("sample")
            .expect("alive");
        assert!(sample.rss_bytes > 0);
    }
}
