// HOLDFAST NETWORK GENERATOR
// TOKEN-BUCKET PACKET EMITTER WITH PEER REPUTATION AND A UDP -> TCP ->
// ERROR FALLBACK CHAIN. PEERS NEVER RESPOND; SUCCESS IS MEASURED AT THE
// HOST NIC (tx_bytes MOVED) AND BY OBSERVABLE SEND RESULTS, NEVER BY
// ACKNOWLEDGEMENTS.
//
// THE DECISION LOGIC (ADDRESS FILTER, BUCKET, REPUTATION, CHAIN
// TRANSITIONS) IS PURE AND TESTED OFFLINE; THE EMITTER THREAD IS A THIN
// DRIVER AROUND IT.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::clock;
use crate::log_warn;
use crate::sensors::read_tx_bytes;

// --- EXTERNAL ADDRESS CHECK ---

// SHAPES WHOSE BANDWIDTH ACCOUNTING ONLY COUNTS PUBLIC EGRESS REFUSE
// EVERY SPECIAL-USE RANGE. FULL RANGES, NOT LOWEST OCTETS -- 10.255.0.1
// IS AS PRIVATE AS 10.0.0.1.
pub fn is_external_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    !(o[0] == 0                                      // 0.0.0.0/8 THIS-NETWORK
        || o[0] == 10                                // 10.0.0.0/8 PRIVATE
        || (o[0] == 100 && (o[1] & 0xc0) == 64)      // 100.64.0.0/10 CGNAT
        || o[0] == 127                               // 127.0.0.0/8 LOOPBACK
        || (o[0] == 169 && o[1] == 254)              // 169.254.0.0/16 LINK-LOCAL
        || (o[0] == 172 && (o[1] & 0xf0) == 16)      // 172.16.0.0/12 PRIVATE
        || (o[0] == 192 && o[1] == 0 && o[2] == 0)   // 192.0.0.0/24 IETF
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)   // 192.0.2.0/24 TEST-NET-1
        || (o[0] == 192 && o[1] == 88 && o[2] == 99) // 192.88.99.0/24 6TO4 RELAY
        || (o[0] == 192 && o[1] == 168)              // 192.168.0.0/16 PRIVATE
        || (o[0] == 198 && (o[1] & 0xfe) == 18)      // 198.18.0.0/15 BENCHMARK
        || (o[0] == 198 && o[1] == 51 && o[2] == 100) // 198.51.100.0/24 TEST-NET-2
        || (o[0] == 203 && o[1] == 0 && o[2] == 113) // 203.0.113.0/24 TEST-NET-3
        || (o[0] & 0xf0) == 224                      // 224.0.0.0/4 MULTICAST
        || (o[0] & 0xf0) == 240                      // 240.0.0.0/4 RESERVED
        || o == [255, 255, 255, 255])                // BROADCAST
}

pub fn is_external_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_external_v4(v4);
    }
    let seg = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || (seg[0] & 0xffc0) == 0xfe80              // fe80::/10 LINK-LOCAL
        || (seg[0] & 0xfe00) == 0xfc00              // fc00::/7 UNIQUE-LOCAL
        || (seg[0] & 0xff00) == 0xff00              // ff00::/8 MULTICAST
        || (seg[0] == 0x2001 && seg[1] == 0x0db8))  // 2001:db8::/32 DOCUMENTATION
}

pub fn is_external(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_external_v4(v4),
        IpAddr::V6(v6) => is_external_v6(v6),
    }
}

// --- TOKEN BUCKET ---

// ELAPSED-TIME ACCUMULATION AGAINST A MONOTONIC CLOCK; THE 5MS TICK
// NEVER DRIFTS THE RATE. CAPACITY IS AT LEAST ONE PACKET NO MATTER HOW
// SMALL THE CONFIGURED RATE.
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_ns: u64,
    packet_bytes: f64,
}

impl TokenBucket {
    pub fn new(rate_mbps: f64, packet_bytes: usize, now_ns: u64) -> Self {
        let mut bucket = Self {
            rate_bytes_per_sec: 0.0,
            capacity: 0.0,
            tokens: 0.0,
            last_ns: now_ns,
            packet_bytes: packet_bytes as f64,
        };
        bucket.set_rate(rate_mbps);
        bucket
    }

    pub fn set_rate(&mut self, rate_mbps: f64) {
        self.rate_bytes_per_sec = (rate_mbps.max(0.0) * 1e6 / 8.0).max(0.0);
        // A QUARTER SECOND OF BURST, FLOORED AT ONE PACKET
        self.capacity = (self.rate_bytes_per_sec * 0.25).max(self.packet_bytes);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn refill(&mut self, now_ns: u64) {
        let dt = now_ns.saturating_sub(self.last_ns) as f64 / 1e9;
        self.last_ns = now_ns;
        self.tokens = (self.tokens + self.rate_bytes_per_sec * dt).min(self.capacity);
    }

    pub fn try_take(&mut self, bytes: usize) -> bool {
        if self.rate_bytes_per_sec <= 0.0 {
            return false;
        }
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    // ACCOUNT FOR A PARTIAL WRITE: THE UNSENT PORTION GOES BACK
    pub fn refund(&mut self, bytes: usize) {
        self.tokens = (self.tokens + bytes as f64).min(self.capacity);
    }

    pub fn drain(&mut self) {
        self.tokens = 0.0;
    }
}

// --- PEERS ---

pub const NEUTRAL_REPUTATION: f64 = 50.0;
// 1/8 EWMA; VALIDATION FAILURES COUNT DOUBLE
pub const REP_ALPHA: f64 = 0.125;
pub const REP_ALPHA_HARD: f64 = 0.25;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Proto {
    Udp,
    Tcp,
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub proto_pref: Proto,
    pub reputation: f64,
    pub last_ok_ts: u64,
    pub last_err_ts: u64,
    pub consecutive_errors: u32,
    pub validated_external: bool,
}

pub struct PeerBook {
    peers: Vec<PeerRecord>,
    rep_floor: f64,
}

impl PeerBook {
    pub fn load(specs: &[String], default_port: u16, require_external: bool, rep_floor: f64) -> Result<Self> {
        let mut peers = Vec::new();
        for spec in specs {
            let addr = match resolve_peer(spec, default_port) {
                Ok(a) => a,
                Err(e) => {
                    log_warn!("PEER {} UNRESOLVABLE: {}", spec, e);
                    continue;
                }
            };
            let external = is_external(addr.ip());
            if require_external && !external {
                log_warn!(
                    "PEER {} REFUSED: {} IS NOT AN EXTERNAL ADDRESS",
                    spec,
                    addr.ip()
                );
                continue;
            }
            peers.push(PeerRecord {
                addr,
                proto_pref: Proto::Udp,
                reputation: NEUTRAL_REPUTATION,
                last_ok_ts: 0,
                last_err_ts: 0,
                consecutive_errors: 0,
                validated_external: external,
            });
        }
        if peers.is_empty() {
            bail!("no usable peers after address screening");
        }
        Ok(Self { peers, rep_floor })
    }

    // DIRECT CONSTRUCTION FROM PRE-SCREENED RECORDS (TESTS, WARM RESTARTS)
    pub fn from_records(peers: Vec<PeerRecord>, rep_floor: f64) -> Self {
        Self { peers, rep_floor }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, idx: usize) -> &PeerRecord {
        &self.peers[idx]
    }

    // HIGHEST-REPUTATION VIABLE PEER, PREFERRING THE CURRENT PROTOCOL
    pub fn best(&self, proto: Proto) -> Option<usize> {
        let viable = |p: &&(usize, &PeerRecord)| p.1.reputation >= self.rep_floor;
        let indexed: Vec<(usize, &PeerRecord)> = self.peers.iter().enumerate().collect();
        indexed
            .iter()
            .filter(|p| p.1.proto_pref == proto)
            .filter(viable)
            .max_by(|a, b| a.1.reputation.total_cmp(&b.1.reputation))
            .or_else(|| {
                indexed
                    .iter()
                    .filter(viable)
                    .max_by(|a, b| a.1.reputation.total_cmp(&b.1.reputation))
            })
            .map(|p| p.0)
    }

    pub fn reward(&mut self, idx: usize, now: u64) {
        let p = &mut self.peers[idx];
        p.reputation += REP_ALPHA * (100.0 - p.reputation);
        p.last_ok_ts = now;
        p.consecutive_errors = 0;
    }

    pub fn punish(&mut self, idx: usize, now: u64, hard: bool) {
        let alpha = if hard { REP_ALPHA_HARD } else { REP_ALPHA };
        let p = &mut self.peers[idx];
        p.reputation -= alpha * p.reputation;
        p.last_err_ts = now;
        p.consecutive_errors += 1;
    }

    pub fn punish_all(&mut self, now: u64, hard: bool) {
        for idx in 0..self.peers.len() {
            self.punish(idx, now, hard);
        }
    }

    pub fn all_below_floor(&self) -> bool {
        self.peers.iter().all(|p| p.reputation < self.rep_floor)
    }

    pub fn max_consecutive_errors(&self) -> u32 {
        self.peers.iter().map(|p| p.consecutive_errors).max().unwrap_or(0)
    }
}

fn resolve_peer(spec: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    (spec, default_port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}", spec))?
        .next()
        .with_context(|| format!("{} resolved to nothing", spec))
}

// --- STATE MACHINE ---

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GenState {
    Off,
    Initializing,
    Validating,
    ActiveUdp,
    ActiveTcp,
    Error,
}

impl GenState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Initializing => "INITIALIZING",
            Self::Validating => "VALIDATING",
            Self::ActiveUdp => "ACTIVE_UDP",
            Self::ActiveTcp => "ACTIVE_TCP",
            Self::Error => "ERROR",
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Initializing => 1,
            Self::Validating => 2,
            Self::ActiveUdp => 3,
            Self::ActiveTcp => 4,
            Self::Error => 5,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Initializing,
            2 => Self::Validating,
            3 => Self::ActiveUdp,
            4 => Self::ActiveTcp,
            5 => Self::Error,
            _ => Self::Off,
        }
    }
}

// NEXT STOP ON THE FALLBACK CHAIN AFTER REPEATED FAILURES
pub fn advance_fallback(state: GenState) -> GenState {
    match state {
        GenState::ActiveUdp => GenState::ActiveTcp,
        GenState::ActiveTcp => GenState::Error,
        other => other,
    }
}

// --- SHARED CONTROL SURFACE ---

// COORDINATOR WRITES active/rate, EMITTER WRITES STATE AND COUNTERS.
pub struct GenControl {
    active: AtomicBool,
    rate_mbps_x1000: AtomicU64,
    state_code: AtomicU8,
    pub bytes_sent: AtomicU64,
    pub last_change_ts: AtomicU64,
}

impl GenControl {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            rate_mbps_x1000: AtomicU64::new(0),
            state_code: AtomicU8::new(GenState::Off.code()),
            bytes_sent: AtomicU64::new(0),
            last_change_ts: AtomicU64::new(0),
        }
    }

    pub fn steer(&self, active: bool, rate_mbps: f64) {
        self.active.store(active, Ordering::Relaxed);
        self.rate_mbps_x1000
            .store((rate_mbps.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn rate_mbps(&self) -> f64 {
        self.rate_mbps_x1000.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn state(&self) -> GenState {
        GenState::from_code(self.state_code.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: GenState) {
        self.state_code.store(state.code(), Ordering::Relaxed);
    }
}

impl Default for GenControl {
    fn default() -> Self {
        Self::new()
    }
}

// --- EMITTER ---

#[derive(Clone, Debug)]
pub struct GenConfig {
    pub peers: Vec<String>,
    pub port: u16,
    pub require_external: bool,
    pub packet_bytes: usize,
    pub ttl: u32,
    pub validation_interval_sec: u64,
    pub validation_timeout_ms: u64,
    pub min_tx_delta: u64,
    pub validation_misses: u32,
    pub err_threshold: u32,
    pub rep_floor: f64,
    pub error_cooldown_sec: u64,
    pub tx_bytes_path: PathBuf,
}

const BUCKET_TICK_MS: u64 = 5;
const TX_PROBE_EVERY_TICKS: u32 = 20; // ~100MS BETWEEN COUNTER READS

struct Emitter {
    cfg: GenConfig,
    control: Arc<GenControl>,
    state: GenState,
    book: Option<PeerBook>,
    bucket: TokenBucket,
    payload: Vec<u8>,
    udp4: Option<UdpSocket>,
    udp6: Option<UdpSocket>,
    tcp_pool: HashMap<SocketAddr, TcpStream>,
    // VALIDATION WINDOW
    tx_at_check: u64,
    sent_at_check: u64,
    last_check_ns: u64,
    misses: u32,
    // VALIDATING-STATE PROBE
    probe_start_ns: u64,
    probe_tx_base: u64,
    probe_sent: u64,
    error_since_ns: u64,
    tick_count: u32,
}

impl Emitter {
    fn new(cfg: GenConfig, control: Arc<GenControl>) -> Self {
        let now = clock::now_ns();
        let payload = vec![0xA5; cfg.packet_bytes];
        let packet = cfg.packet_bytes;
        Self {
            cfg,
            control,
            state: GenState::Off,
            book: None,
            bucket: TokenBucket::new(0.0, packet, now),
            payload,
            udp4: None,
            udp6: None,
            tcp_pool: HashMap::new(),
            tx_at_check: 0,
            sent_at_check: 0,
            last_check_ns: now,
            misses: 0,
            probe_start_ns: 0,
            probe_tx_base: 0,
            probe_sent: 0,
            error_since_ns: 0,
            tick_count: 0,
        }
    }

    fn enter(&mut self, state: GenState) {
        self.state = state;
        self.control.set_state(state);
    }

    fn read_tx(&self) -> Option<u64> {
        read_tx_bytes(&self.cfg.tx_bytes_path).ok()
    }

    // HIGHEST-REPUTATION VIABLE PEER AS AN OWNED PAIR -- KEEPS BORROWS SHORT
    fn best_peer(&self, proto: Proto) -> Option<(usize, SocketAddr)> {
        let book = self.book.as_ref()?;
        let idx = book.best(proto)?;
        Some((idx, book.get(idx).addr))
    }

    fn ensure_udp_socket(&mut self, addr: &SocketAddr) {
        let ttl = self.cfg.ttl;
        let (slot, bind) = match addr {
            SocketAddr::V4(_) => (&mut self.udp4, "0.0.0.0:0"),
            SocketAddr::V6(_) => (&mut self.udp6, "[::]:0"),
        };
        if slot.is_some() {
            return;
        }
        match UdpSocket::bind(bind) {
            Ok(sock) => {
                let _ = sock.set_ttl(ttl);
                let _ = sock.set_write_timeout(Some(Duration::from_millis(500)));
                *slot = Some(sock);
            }
            Err(e) => {
                log_warn!("UDP SOCKET BIND FAILED: {}", e);
            }
        }
    }

    fn udp_socket(&self, addr: &SocketAddr) -> Option<&UdpSocket> {
        match addr {
            SocketAddr::V4(_) => self.udp4.as_ref(),
            SocketAddr::V6(_) => self.udp6.as_ref(),
        }
    }

    fn ensure_tcp_stream(&mut self, addr: SocketAddr) {
        if self.tcp_pool.contains_key(&addr) {
            return;
        }
        if let Ok(stream) = TcpStream::connect_timeout(&addr, Duration::from_millis(1000)) {
            let _ = stream.set_nodelay(true);
            let _ = stream.set_write_timeout(Some(Duration::from_millis(500)));
            let _ = stream.set_ttl(self.cfg.ttl);
            self.tcp_pool.insert(addr, stream);
        }
    }

    fn close_sockets(&mut self) {
        self.udp4 = None;
        self.udp6 = None;
        self.tcp_pool.clear();
    }

    // DEACTIVATION: STOP ADMITTING TOKENS AT ONCE, DROP SOCKETS, STAMP
    fn deactivate(&mut self) {
        self.bucket.drain();
        self.close_sockets();
        self.control
            .last_change_ts
            .store(clock::now_ts(), Ordering::Relaxed);
        self.enter(GenState::Off);
    }

    fn begin_initializing(&mut self) {
        if self.book.is_none() {
            match PeerBook::load(
                &self.cfg.peers,
                self.cfg.port,
                self.cfg.require_external,
                self.cfg.rep_floor,
            ) {
                Ok(book) => self.book = Some(book),
                Err(e) => {
                    log_warn!("PEER LOAD FAILED: {}", e);
                    self.error_since_ns = clock::now_ns();
                    self.enter(GenState::Error);
                    return;
                }
            }
        }
        self.bucket.drain();
        self.probe_sent = 0;
        self.probe_tx_base = self.read_tx().unwrap_or(0);
        self.probe_start_ns = clock::now_ns();
        self.enter(GenState::Validating);
    }

    // SHORT UDP PROBE: EXPECTED BYTE DELTA MUST APPEAR ON THE HOST NIC
    // WITHIN THE VALIDATION WINDOW.
    fn step_validating(&mut self, now_ns: u64) {
        if self.book.is_none() {
            self.error_since_ns = now_ns;
            self.enter(GenState::Error);
            return;
        }
        if self.probe_sent < 4 * self.cfg.packet_bytes as u64 {
            if let Some((idx, addr)) = self.best_peer(Proto::Udp) {
                self.ensure_udp_socket(&addr);
                let sent = self
                    .udp_socket(&addr)
                    .map(|sock| sock.send_to(&self.payload, addr));
                match sent {
                    Some(Ok(n)) => self.probe_sent += n as u64,
                    Some(Err(_)) => {
                        let now = clock::now_ts();
                        if let Some(book) = self.book.as_mut() {
                            book.punish(idx, now, false);
                        }
                    }
                    None => {}
                }
            }
        }
        if self.tick_count % TX_PROBE_EVERY_TICKS == 0 {
            if let Some(tx) = self.read_tx() {
                let delta = tx.saturating_sub(self.probe_tx_base);
                if self.probe_sent > 0
                    && delta >= self.probe_sent.min(self.cfg.packet_bytes as u64)
                {
                    // CONFIRMED: EGRESS IS REAL
                    let best = self.best_peer(Proto::Udp);
                    if let (Some((idx, _)), Some(book)) = (best, self.book.as_mut()) {
                        book.reward(idx, clock::now_ts());
                    }
                    self.reset_validation_window(tx, now_ns);
                    self.enter(GenState::ActiveUdp);
                    return;
                }
            }
        }
        if now_ns.saturating_sub(self.probe_start_ns) > self.cfg.validation_timeout_ms * 1_000_000 {
            log_warn!("EGRESS VALIDATION TIMED OUT -- GENERATOR IN ERROR COOLDOWN");
            let now = clock::now_ts();
            if let Some(book) = self.book.as_mut() {
                book.punish_all(now, true);
            }
            self.error_since_ns = now_ns;
            self.close_sockets();
            self.enter(GenState::Error);
        }
    }

    fn reset_validation_window(&mut self, tx_now: u64, now_ns: u64) {
        self.tx_at_check = tx_now;
        self.sent_at_check = self.control.bytes_sent.load(Ordering::Relaxed);
        self.last_check_ns = now_ns;
        self.misses = 0;
    }

    // PERIODIC RUNTIME VALIDATION AGAINST THE NIC COUNTER
    fn check_validation(&mut self, now_ns: u64) {
        if now_ns.saturating_sub(self.last_check_ns)
            < self.cfg.validation_interval_sec * 1_000_000_000
        {
            return;
        }
        let Some(tx) = self.read_tx() else { return };
        let sent_now = self.control.bytes_sent.load(Ordering::Relaxed);
        let believed = sent_now.saturating_sub(self.sent_at_check);
        let observed = tx.saturating_sub(self.tx_at_check);
        let now = clock::now_ts();

        if believed == 0 {
            // NOTHING ADMITTED THIS WINDOW; NOTHING TO JUDGE
            self.tx_at_check = tx;
            self.sent_at_check = sent_now;
            self.last_check_ns = now_ns;
            return;
        }

        if observed < self.cfg.min_tx_delta.min(believed) {
            self.misses += 1;
            if let Some(book) = self.book.as_mut() {
                book.punish_all(now, true);
            }
            if self.misses >= self.cfg.validation_misses {
                let next = advance_fallback(self.state);
                log_warn!(
                    "TX VALIDATION FAILED {}x -- {} -> {}",
                    self.misses,
                    self.state.label(),
                    next.label()
                );
                if next == GenState::Error {
                    self.error_since_ns = now_ns;
                    self.close_sockets();
                }
                self.misses = 0;
                self.enter(next);
            }
        } else {
            self.misses = 0;
            let proto = if self.state == GenState::ActiveTcp {
                Proto::Tcp
            } else {
                Proto::Udp
            };
            if let Some(book) = self.book.as_mut() {
                if let Some(idx) = book.best(proto) {
                    book.reward(idx, now);
                }
            }
            // VALIDATED TCP PERIOD EARNS A RETRY OF THE PREFERRED PROTOCOL
            if self.state == GenState::ActiveTcp {
                self.enter(GenState::ActiveUdp);
            }
        }
        self.tx_at_check = tx;
        self.sent_at_check = sent_now;
        self.last_check_ns = now_ns;
    }

    fn step_active_udp(&mut self, now_ns: u64) {
        self.bucket.refill(now_ns);
        loop {
            if self.book.is_none() {
                break;
            }
            let Some((idx, addr)) = self.best_peer(Proto::Udp) else {
                // EVERY UDP PEER IS UNDER THE FLOOR
                self.enter(GenState::ActiveTcp);
                break;
            };
            if !self.bucket.try_take(self.payload.len()) {
                break;
            }
            self.ensure_udp_socket(&addr);
            let sent = self
                .udp_socket(&addr)
                .map(|sock| sock.send_to(&self.payload, addr));
            let now = clock::now_ts();
            match sent {
                Some(Ok(n)) => {
                    self.control.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    self.bucket.refund(self.payload.len());
                    let mut fall_back = false;
                    if let Some(book) = self.book.as_mut() {
                        book.punish(idx, now, false);
                        fall_back = book.max_consecutive_errors() > self.cfg.err_threshold
                            || book.all_below_floor();
                    }
                    if fall_back {
                        log_warn!("UDP SEND FAILING ({}) -- FALLING BACK TO TCP", e);
                        self.enter(GenState::ActiveTcp);
                    }
                    break;
                }
                None => {
                    self.bucket.refund(self.payload.len());
                    break;
                }
            }
        }
        self.check_validation(now_ns);
    }

    fn step_active_tcp(&mut self, now_ns: u64) {
        use std::io::Write;
        self.bucket.refill(now_ns);
        loop {
            if self.book.is_none() {
                break;
            }
            let Some((idx, addr)) = self.best_peer(Proto::Tcp) else {
                // NO VIABLE PEER ON ANY PROTOCOL: UNRECOVERABLE FOR NOW
                self.error_since_ns = now_ns;
                self.close_sockets();
                self.enter(GenState::Error);
                break;
            };
            if !self.bucket.try_take(self.payload.len()) {
                break;
            }
            self.ensure_tcp_stream(addr);
            let now = clock::now_ts();
            let Some(mut stream) = self.tcp_pool.remove(&addr) else {
                self.bucket.refund(self.payload.len());
                if let Some(book) = self.book.as_mut() {
                    book.punish(idx, now, false);
                }
                break;
            };
            match stream.write(&self.payload) {
                Ok(n) => {
                    // PARTIAL WRITES DRAIN THE BUCKET BY ACTUAL BYTES
                    if n < self.payload.len() {
                        self.bucket.refund(self.payload.len() - n);
                    }
                    self.control.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.tcp_pool.insert(addr, stream);
                }
                Err(_) => {
                    self.bucket.refund(self.payload.len());
                    drop(stream);
                    if let Some(book) = self.book.as_mut() {
                        book.punish(idx, now, false);
                    }
                    break;
                }
            }
        }
        self.check_validation(now_ns);
    }

    fn tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
        let now_ns = clock::now_ns();
        let active = self.control.active();
        self.bucket.set_rate(self.control.rate_mbps());

        if !active && self.state != GenState::Off {
            self.deactivate();
            return;
        }

        match self.state {
            GenState::Off => {
                if active {
                    self.enter(GenState::Initializing);
                }
            }
            GenState::Initializing => self.begin_initializing(),
            GenState::Validating => self.step_validating(now_ns),
            GenState::ActiveUdp => self.step_active_udp(now_ns),
            GenState::ActiveTcp => self.step_active_tcp(now_ns),
            GenState::Error => {
                if now_ns.saturating_sub(self.error_since_ns)
                    >= self.cfg.error_cooldown_sec * 1_000_000_000
                {
                    self.enter(GenState::Initializing);
                }
            }
        }
    }
}

pub fn spawn_emitter(
    cfg: GenConfig,
    control: Arc<GenControl>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("holdfast-net".into())
        .spawn(move || {
            let mut emitter = Emitter::new(cfg, control);
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(BUCKET_TICK_MS));
                emitter.tick();
            }
            // FLUSH-AND-CLOSE ON THE WAY OUT
            if emitter.state != GenState::Off {
                emitter.deactivate();
            }
        })
        .expect("spawn net emitter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_minimum_capacity_is_one_packet() {
        // 1 KBIT/S IS 125 BYTES/S; CAPACITY MUST STILL FIT ONE 8900B PACKET
        let bucket = TokenBucket::new(0.001, 8900, 0);
        assert!(bucket.capacity >= 8900.0);
    }

    #[test]
    fn bucket_accumulates_without_drift() {
        let mut bucket = TokenBucket::new(8.0, 1000, 0); // 1 MB/S
        // 1000 x 1MS TICKS = 1S => ~1MB OF TOKENS ADMITTED (CAPACITY CAPS AT 250K)
        let mut taken = 0usize;
        for i in 1..=1000u64 {
            bucket.refill(i * 1_000_000);
            while bucket.try_take(1000) {
                taken += 1000;
            }
        }
        // EXACT BUDGET, NO DRIFT: 1MB +- ONE PACKET
        assert!((taken as i64 - 1_000_000).unsigned_abs() <= 1000, "taken={}", taken);
    }

    #[test]
    fn bucket_zero_rate_never_admits() {
        let mut bucket = TokenBucket::new(0.0, 1000, 0);
        bucket.refill(10_000_000_000);
        assert!(!bucket.try_take(1));
    }

    #[test]
    fn bucket_refund_restores_partial_write() {
        let mut bucket = TokenBucket::new(8.0, 1000, 0);
        bucket.refill(1_000_000_000);
        assert!(bucket.try_take(1000));
        let before = bucket.tokens;
        bucket.refund(400);
        assert!((bucket.tokens - (before + 400.0)).abs() < 1e-9);
    }

    #[test]
    fn external_check_rejects_full_private_ranges() {
        // NOT JUST THE LOWEST OCTETS
        for bad in [
            "0.1.2.3",
            "10.0.0.1",
            "10.255.255.254",
            "100.64.0.1",
            "100.127.255.254",
            "127.0.0.1",
            "127.255.0.1",
            "169.254.1.1",
            "172.16.0.1",
            "172.31.255.254",
            "192.0.0.5",
            "192.0.2.44",
            "192.88.99.7",
            "192.168.0.1",
            "192.168.255.254",
            "198.18.0.1",
            "198.19.255.254",
            "198.51.100.9",
            "203.0.113.200",
            "224.0.0.1",
            "239.255.255.255",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            let ip: Ipv4Addr = bad.parse().unwrap();
            assert!(!is_external_v4(ip), "{} accepted", bad);
        }
    }

    #[test]
    fn external_check_accepts_public() {
        for good in ["1.1.1.1", "8.8.8.8", "100.63.0.1", "100.128.0.1", "172.15.0.1", "172.32.0.1", "198.17.0.1", "198.20.0.1", "203.0.112.1", "223.255.255.254"] {
            let ip: Ipv4Addr = good.parse().unwrap();
            assert!(is_external_v4(ip), "{} rejected", good);
        }
    }

    #[test]
    fn external_check_v6() {
        for bad in ["::1", "fe80::1", "fc00::1", "fd12:3456::1", "ff02::1", "2001:db8::1"] {
            let ip: Ipv6Addr = bad.parse().unwrap();
            assert!(!is_external_v6(ip), "{} accepted", bad);
        }
        let good: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        assert!(is_external_v6(good));
        // MAPPED V4 FOLLOWS THE V4 RULES
        let mapped: Ipv6Addr = "::ffff:10.0.0.1".parse().unwrap();
        assert!(!is_external_v6(mapped));
        let mapped_ok: Ipv6Addr = "::ffff:8.8.8.8".parse().unwrap();
        assert!(is_external_v6(mapped_ok));
    }

    #[test]
    fn peer_book_screens_internal_addresses() {
        let specs = vec![
            "10.0.0.5:15201".to_string(),
            "192.168.1.9".to_string(),
            "8.8.8.8:15201".to_string(),
        ];
        let book = PeerBook::load(&specs, 15201, true, 20.0).unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book.get(0).addr.ip().to_string(), "8.8.8.8");
        assert!(book.get(0).validated_external);
    }

    #[test]
    fn peer_book_all_internal_is_fatal() {
        let specs = vec!["10.0.0.5".to_string(), "127.0.0.1".to_string()];
        assert!(PeerBook::load(&specs, 15201, true, 20.0).is_err());
    }

    #[test]
    fn peer_book_internal_allowed_when_shape_does_not_require_external() {
        let specs = vec!["10.0.0.5".to_string()];
        let book = PeerBook::load(&specs, 15201, false, 20.0).unwrap();
        assert_eq!(book.len(), 1);
        assert!(!book.get(0).validated_external);
    }

    #[test]
    fn reputation_ema_and_floor() {
        let mk = |ip: &str| PeerRecord {
            addr: SocketAddr::new(ip.parse().unwrap(), 15201),
            proto_pref: Proto::Udp,
            reputation: NEUTRAL_REPUTATION,
            last_ok_ts: 0,
            last_err_ts: 0,
            consecutive_errors: 0,
            validated_external: true,
        };
        let mut book = PeerBook::from_records(vec![mk("8.8.8.8"), mk("9.9.9.9")], 20.0);

        // SECOND PEER KEEPS FAILING VALIDATION: HARD PUNISHMENT
        for i in 0..4 {
            book.punish(1, 100 + i, true);
        }
        // 50 * 0.75^4 = 15.8 < FLOOR
        assert!(book.get(1).reputation < 20.0);
        assert_eq!(book.get(1).consecutive_errors, 4);
        // SELECTION NOW PINS TO THE FIRST PEER
        assert_eq!(book.best(Proto::Udp), Some(0));

        // FIRST PEER VALIDATES: REPUTATION CLIMBS
        let before = book.get(0).reputation;
        book.reward(0, 500);
        assert!(book.get(0).reputation > before);
        assert_eq!(book.get(0).consecutive_errors, 0);
        assert_eq!(book.get(0).last_ok_ts, 500);
    }

    #[test]
    fn all_peers_dead_reports_nonviable() {
        let mk = |ip: &str| PeerRecord {
            addr: SocketAddr::new(ip.parse().unwrap(), 15201),
            proto_pref: Proto::Udp,
            reputation: 5.0,
            last_ok_ts: 0,
            last_err_ts: 0,
            consecutive_errors: 9,
            validated_external: true,
        };
        let book = PeerBook::from_records(vec![mk("8.8.8.8"), mk("9.9.9.9")], 20.0);
        assert!(book.all_below_floor());
        assert_eq!(book.best(Proto::Udp), None);
    }

    #[test]
    fn fallback_chain_order() {
        assert_eq!(advance_fallback(GenState::ActiveUdp), GenState::ActiveTcp);
        assert_eq!(advance_fallback(GenState::ActiveTcp), GenState::Error);
        assert_eq!(advance_fallback(GenState::Off), GenState::Off);
    }

    #[test]
    fn state_codes_round_trip() {
        for s in [
            GenState::Off,
            GenState::Initializing,
            GenState::Validating,
            GenState::ActiveUdp,
            GenState::ActiveTcp,
            GenState::Error,
        ] {
            assert_eq!(GenState::from_code(s.code()), s);
        }
    }

    #[test]
    fn control_steering_round_trip() {
        let ctl = GenControl::new();
        ctl.steer(true, 42.5);
        assert!(ctl.active());
        assert!((ctl.rate_mbps() - 42.5).abs() < 0.001);
        ctl.steer(false, 0.0);
        assert!(!ctl.active());
    }

    #[test]
    fn resolve_bare_ip_uses_default_port() {
        let addr = resolve_peer("8.8.8.8", 15201).unwrap();
        assert_eq!(addr.port(), 15201);
        let addr = resolve_peer("8.8.8.8:9000", 15201).unwrap();
        assert_eq!(addr.port(), 9000);
    }
}
