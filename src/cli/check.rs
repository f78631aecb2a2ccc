// HOLDFAST HOST CHECK
// PROBES EVERY PREREQUISITE THE SHAPER NEEDS AND PRINTS AN OK/MISSING
// TABLE. RUN BEFORE FIRST DEPLOYMENT OR WHEN STARTUP EXITS NON-ZERO.

use std::path::Path;

use anyhow::{bail, Result};

use crate::metrics::{is_mount_point, StorageLock};
use crate::sensors::{detect_nic, parse_meminfo, read_link_speed};

fn probe_file(path: &str) -> bool {
    std::fs::read_to_string(path).is_ok()
}

pub fn run_check(storage_dir: &Path, nic: Option<&str>, allow_non_mount: bool) -> Result<()> {
    println!("HOLDFAST HOST CHECK");
    println!();

    let mut ok = true;

    println!("SENSORS:");
    for path in ["/proc/stat", "/proc/loadavg"] {
        if probe_file(path) {
            println!("  {:<24}OK", path);
        } else {
            println!("  {:<24}MISSING", path);
            ok = false;
        }
    }
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) if parse_meminfo(&contents).is_some() => {
            println!("  {:<24}OK (MemAvailable PRESENT)", "/proc/meminfo");
        }
        Ok(_) => {
            println!(
                "  {:<24}NO MemAvailable -- KERNEL TOO OLD, THE 20% POLICY CANNOT BE COMPUTED",
                "/proc/meminfo"
            );
            ok = false;
        }
        Err(_) => {
            println!("  {:<24}MISSING", "/proc/meminfo");
            ok = false;
        }
    }
    println!();

    println!("NETWORK:");
    let sys = Path::new("/sys");
    let nic_name = nic.map(str::to_string).or_else(|| detect_nic(sys));
    match &nic_name {
        Some(name) => {
            println!("  {:<24}{}", "INTERFACE", name);
            match read_link_speed(sys, name) {
                Some(speed) => println!("  {:<24}{} MBIT", "LINK SPEED", speed),
                // VIRTIO REPORTS -1; THE OVERRIDE EXISTS FOR EXACTLY THIS
                None => println!("  {:<24}UNREPORTED (PASS --link-mbit AT RUN TIME)", "LINK SPEED"),
            }
            let tx = sys
                .join("class/net")
                .join(name)
                .join("statistics/tx_bytes");
            if tx.is_file() {
                println!("  {:<24}OK", "TX COUNTER");
            } else {
                println!("  {:<24}MISSING", "TX COUNTER");
                ok = false;
            }
        }
        None => {
            println!("  {:<24}NONE FOUND (PASS --nic)", "INTERFACE");
            ok = false;
        }
    }
    println!();

    println!("STORAGE:");
    if storage_dir.is_dir() {
        println!("  {:<24}OK", storage_dir.display().to_string());
        match is_mount_point(storage_dir) {
            Ok(true) => println!("  {:<24}OK", "MOUNT POINT"),
            Ok(false) if allow_non_mount => {
                println!("  {:<24}NOT A MOUNT (ALLOWED)", "MOUNT POINT")
            }
            Ok(false) => {
                println!("  {:<24}NOT A MOUNT -- PERSISTENT VOLUME MISSING", "MOUNT POINT");
                ok = false;
            }
            Err(e) => {
                println!("  {:<24}UNCHECKABLE ({})", "MOUNT POINT", e);
                ok = false;
            }
        }
        match StorageLock::acquire(storage_dir) {
            Ok(lock) => {
                println!("  {:<24}OK (NOT HELD)", "INSTANCE LOCK");
                drop(lock);
            }
            Err(_) => {
                println!("  {:<24}HELD BY A RUNNING INSTANCE", "INSTANCE LOCK");
                ok = false;
            }
        }
    } else {
        println!(
            "  {:<24}MISSING -- MOUNT A VOLUME OR PASS --storage-dir",
            storage_dir.display().to_string()
        );
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
        Ok(())
    } else {
        bail!("ONE OR MORE CHECKS FAILED")
    }
}
