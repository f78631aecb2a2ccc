// HOLDFAST SENSORS
// INSTANTANEOUS CPU / MEMORY / NETWORK / LOAD READINGS FROM /proc AND /sys.
// PARSERS ARE PURE FUNCTIONS OVER FILE CONTENTS; THE STATEFUL LAYER ONLY
// HOLDS THE PREVIOUS COUNTERS FOR DELTA-OVER-DELTA MATH.
//
// A MISSING READING IS None, NEVER A GUESS. THE FIRST TICK AFTER STARTUP
// HAS NO PREVIOUS COUNTERS AND YIELDS None FOR CPU AND NETWORK.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::clock;

#[derive(Clone, Copy, Debug, Default)]
pub struct Readings {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub mem_avail_mb: Option<f64>,
    pub net_pct: Option<f64>,
    pub net_mbps: Option<f64>,
    pub load_per_core: Option<f64>,
}

// --- PURE PARSERS ---

// FIRST LINE OF /proc/stat: "cpu user nice system idle iowait irq softirq ..."
// RETURNS (TOTAL_JIFFIES, IDLE_JIFFIES). IDLE INCLUDES IOWAIT -- A CORE
// WAITING ON DISK IS RECLAIMABLE-IDLE AS FAR AS THE PROVIDER IS CONCERNED.
pub fn parse_proc_stat(contents: &str) -> Option<(u64, u64)> {
    let line = contents.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let vals: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if vals.len() < 5 {
        return None;
    }
    let total: u64 = vals.iter().sum();
    let idle = vals[3] + vals[4]; // idle + iowait
    Some((total, idle))
}

// /proc/meminfo: MemTotal AND MemAvailable IN kB. MemAvailable ALREADY
// EXCLUDES RECLAIMABLE PAGE CACHE, WHICH IS THE DEFINITION THE 20% POLICY
// USES. A KERNEL WITHOUT IT IS REFUSED AT STARTUP, NOT APPROXIMATED.
pub fn parse_meminfo(contents: &str) -> Option<(u64, u64)> {
    let mut total_kb = None;
    let mut avail_kb = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            avail_kb = rest.split_whitespace().next()?.parse().ok();
        }
        if total_kb.is_some() && avail_kb.is_some() {
            break;
        }
    }
    Some((total_kb?, avail_kb?))
}

// /proc/loadavg: "0.52 0.58 0.59 1/467 12345" -- FIRST FIELD ONLY
pub fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

pub fn cpu_pct_from_deltas(prev: (u64, u64), cur: (u64, u64)) -> Option<f64> {
    let total = cur.0.checked_sub(prev.0)?;
    let idle = cur.1.checked_sub(prev.1)?;
    if total == 0 {
        return None;
    }
    let busy = total.saturating_sub(idle);
    Some(busy as f64 / total as f64 * 100.0)
}

// --- STATEFUL LAYER ---

pub struct Sensors {
    proc_stat: PathBuf,
    proc_meminfo: PathBuf,
    proc_loadavg: PathBuf,
    tx_bytes: PathBuf,
    link_mbit: f64,
    nr_cpus: usize,
    prev_jiffies: Option<(u64, u64)>,
    prev_tx: Option<(u64, u64)>, // (BYTES, MONOTONIC_NS)
}

impl Sensors {
    pub fn new(nic: &str, link_mbit: f64, nr_cpus: usize) -> Result<Self> {
        Self::with_roots(Path::new("/proc"), Path::new("/sys"), nic, link_mbit, nr_cpus)
    }

    // TESTS POINT THIS AT FIXTURE TREES
    pub fn with_roots(
        proc_root: &Path,
        sys_root: &Path,
        nic: &str,
        link_mbit: f64,
        nr_cpus: usize,
    ) -> Result<Self> {
        if link_mbit <= 0.0 {
            bail!("link bandwidth must be positive (got {} Mbit)", link_mbit);
        }
        if nr_cpus == 0 {
            bail!("core count must be nonzero");
        }
        let proc_meminfo = proc_root.join("meminfo");
        let contents = fs::read_to_string(&proc_meminfo)
            .with_context(|| format!("read {}", proc_meminfo.display()))?;
        if parse_meminfo(&contents).is_none() {
            bail!(
                "{} has no MemAvailable field; this kernel cannot express \
                 reclaimable-cache-excluded memory and the 20% policy would be wrong",
                proc_meminfo.display()
            );
        }
        Ok(Self {
            proc_stat: proc_root.join("stat"),
            proc_meminfo,
            proc_loadavg: proc_root.join("loadavg"),
            tx_bytes: sys_root
                .join("class/net")
                .join(nic)
                .join("statistics/tx_bytes"),
            link_mbit,
            nr_cpus,
            prev_jiffies: None,
            prev_tx: None,
        })
    }

    pub fn tx_bytes_path(&self) -> &Path {
        &self.tx_bytes
    }

    pub fn sample(&mut self) -> Readings {
        let mut r = Readings::default();

        if let Ok(contents) = fs::read_to_string(&self.proc_stat) {
            if let Some(cur) = parse_proc_stat(&contents) {
                if let Some(prev) = self.prev_jiffies {
                    r.cpu_pct = cpu_pct_from_deltas(prev, cur);
                }
                self.prev_jiffies = Some(cur);
            }
        }

        if let Ok(contents) = fs::read_to_string(&self.proc_meminfo) {
            if let Some((total_kb, avail_kb)) = parse_meminfo(&contents) {
                if total_kb > 0 {
                    r.mem_pct =
                        Some((total_kb - avail_kb.min(total_kb)) as f64 / total_kb as f64 * 100.0);
                    r.mem_avail_mb = Some(avail_kb as f64 / 1024.0);
                }
            }
        }

        if let Ok(cur_tx) = read_tx_bytes(&self.tx_bytes) {
            let now = clock::now_ns();
            if let Some((prev_tx, prev_ns)) = self.prev_tx {
                let elapsed = now.saturating_sub(prev_ns) as f64 / 1e9;
                if elapsed > 0.0 && cur_tx >= prev_tx {
                    let mbps = (cur_tx - prev_tx) as f64 * 8.0 / elapsed / 1e6;
                    r.net_mbps = Some(mbps);
                    r.net_pct = Some(mbps / self.link_mbit * 100.0);
                }
            }
            self.prev_tx = Some((cur_tx, now));
        }

        if let Ok(contents) = fs::read_to_string(&self.proc_loadavg) {
            if let Some(load) = parse_loadavg(&contents) {
                r.load_per_core = Some(load / self.nr_cpus as f64);
            }
        }

        r
    }
}

pub fn read_tx_bytes(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("parse {}", path.display()))
}

// /sys/class/net/<nic>/speed, IF THE DRIVER REPORTS ONE. VIRTIO REPORTS -1.
pub fn read_link_speed(sys_root: &Path, nic: &str) -> Option<f64> {
    let path = sys_root.join("class/net").join(nic).join("speed");
    let raw = fs::read_to_string(path).ok()?;
    let speed: f64 = raw.trim().parse().ok()?;
    if speed > 0.0 {
        Some(speed)
    } else {
        None
    }
}

// FIRST NON-LOOPBACK INTERFACE THAT IS UP
pub fn detect_nic(sys_root: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(sys_root.join("class/net"))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in &names {
        let state = fs::read_to_string(sys_root.join("class/net").join(name).join("operstate"))
            .unwrap_or_default();
        if state.trim() == "up" {
            return Some(name.clone());
        }
    }
    names.into_iter().next()
}
