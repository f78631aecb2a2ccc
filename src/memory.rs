// HOLDFAST MEMORY OCCUPIER
// HOLDS A TARGET FRACTION OF RAM RESIDENT WITHOUT STRESSING THE MEMORY
// SUBSYSTEM. PAGE-ALIGNED BUFFERS GROW AND SHRINK ONE STEP PER TICK
// INSIDE A HYSTERESIS BAND; A TOUCH THREAD WRITES ONE BYTE PER PAGE PER
// INTERVAL SO THE KERNEL KEEPS THE PAGES RESIDENT. OCCUPATION, NOT
// STRESS: NOTHING HERE EVER THRASHES.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::log_warn;

// --- STEP PLANNING (PURE) ---

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepAction {
    Grow,
    Shrink,
    Hold,
}

#[derive(Clone, Copy, Debug)]
pub struct StepInputs {
    pub mem_pct: f64,
    pub avail_mb: f64,
    pub target_pct: f64,
    pub hysteresis_pct: f64,
    pub stop_pct: f64,
    pub min_free_mb: f64,
    pub step_mb: f64,
    pub load_gate_hot: bool,
}

pub fn plan_step(inp: StepInputs) -> StepAction {
    if inp.target_pct <= 0.0 {
        return StepAction::Hold; // SHAPE WITHOUT MEMORY RECLAMATION
    }
    // SHRINK CONDITIONS FIRST -- FREEING MEMORY IS NEVER GATED
    if inp.avail_mb < inp.min_free_mb || inp.mem_pct > inp.target_pct + inp.hysteresis_pct {
        return StepAction::Shrink;
    }
    if inp.load_gate_hot {
        return StepAction::Hold; // NEVER GROW UNDER A HOT GATE
    }
    if inp.mem_pct < inp.target_pct - inp.hysteresis_pct
        && inp.mem_pct < inp.stop_pct
        && inp.avail_mb > inp.min_free_mb + inp.step_mb
    {
        return StepAction::Grow;
    }
    StepAction::Hold
}

// --- REGIONS ---

struct Region {
    ptr: *mut u8,
    layout: Layout,
}

// RAW POINTER TO MEMORY ONLY THIS STRUCT TOUCHES
unsafe impl Send for Region {}

impl Region {
    fn touch_every_page(&self, page: usize) {
        let mut off = 0;
        while off < self.layout.size() {
            unsafe {
                std::ptr::write_volatile(self.ptr.add(off), 1);
            }
            off += page;
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

pub struct MemoryOccupier {
    regions: Arc<Mutex<Vec<Region>>>,
    layout: Layout,
    page: usize,
    step_mb: usize,
    toucher: Option<JoinHandle<()>>,
}

impl MemoryOccupier {
    pub fn new(step_mb: usize) -> Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let bytes = step_mb * 1024 * 1024;
        let layout = Layout::from_size_align(bytes.max(page), page).context("region layout")?;
        Ok(Self {
            regions: Arc::new(Mutex::new(Vec::new())),
            layout,
            page,
            step_mb,
            toucher: None,
        })
    }

    fn lock_regions(regions: &Mutex<Vec<Region>>) -> MutexGuard<'_, Vec<Region>> {
        match regions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn occupied_mb(&self) -> usize {
        Self::lock_regions(&self.regions).len() * self.step_mb
    }

    // ONE CONTROL STEP. AT MOST ONE REGION ADDED OR RELEASED PER TICK.
    pub fn step(&self, action: StepAction) {
        match action {
            StepAction::Hold => {}
            StepAction::Grow => {
                let ptr = unsafe { alloc(self.layout) };
                if ptr.is_null() {
                    log_warn!("OCCUPIER ALLOCATION FAILED ({} MB) -- HOLDING", self.step_mb);
                    return;
                }
                let region = Region {
                    ptr,
                    layout: self.layout,
                };
                // FIRST TOUCH MAKES THE PAGES REAL
                region.touch_every_page(self.page);
                Self::lock_regions(&self.regions).push(region);
            }
            StepAction::Shrink => {
                // MOST RECENT FIRST
                Self::lock_regions(&self.regions).pop();
            }
        }
    }

    pub fn spawn_toucher(&mut self, interval_ms: u64, shutdown: Arc<AtomicBool>) {
        let regions = Arc::clone(&self.regions);
        let page = self.page;
        let handle = std::thread::Builder::new()
            .name("holdfast-touch".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(interval_ms.clamp(100, 10_000)));
                    let guard = Self::lock_regions(&regions);
                    for region in guard.iter() {
                        region.touch_every_page(page);
                    }
                }
            })
            .expect("spawn page toucher");
        self.toucher = Some(handle);
    }

    pub fn release_all(&self) {
        Self::lock_regions(&self.regions).clear();
    }

    pub fn join_toucher(&mut self) {
        if let Some(h) = self.toucher.take() {
            let _ = h.join();
        }
    }
}
