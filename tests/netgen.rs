// HOLDFAST GENERATOR TESTS
// EXTERNAL-ADDRESS SCREENING, PEER ROTATION UNDER VALIDATION FAILURE,
// FALLBACK CHAIN ORDER, TOKEN BUCKET BUDGETING. NO SOCKETS TOUCHED.

use std::net::SocketAddr;

use holdfast::netgen::{
    advance_fallback, is_external, GenState, PeerBook, PeerRecord, Proto, TokenBucket,
    NEUTRAL_REPUTATION,
};

fn peer(ip: &str) -> PeerRecord {
    PeerRecord {
        addr: SocketAddr::new(ip.parse().unwrap(), 15201),
        proto_pref: Proto::Udp,
        reputation: NEUTRAL_REPUTATION,
        last_ok_ts: 0,
        last_err_ts: 0,
        consecutive_errors: 0,
        validated_external: true,
    }
}

// === EXTERNAL-ADDRESS ENFORCEMENT OVER FULL RANGES ===

#[test]
fn initialization_rejects_every_special_range() {
    // ONE REPRESENTATIVE FROM DEEP INSIDE EACH RANGE -- A FILTER THAT
    // ONLY MATCHES THE LOWEST OCTET FAILS THESE
    let internal = [
        "0.255.0.1",
        "10.200.30.40",
        "100.100.0.1",     // CGNAT MIDDLE
        "127.200.0.1",
        "169.254.200.200",
        "172.20.1.1",
        "192.0.0.200",
        "192.0.2.255",
        "192.88.99.255",
        "192.168.254.254",
        "198.19.0.1",      // BENCHMARK SECOND /16
        "198.51.100.1",
        "203.0.113.1",
        "230.1.2.3",       // MULTICAST MIDDLE
        "250.0.0.1",       // RESERVED MIDDLE
        "fe80::dead:beef",
        "fd00::1",
        "ff05::2",
        "2001:db8:ffff::1",
    ];
    for addr in internal {
        assert!(
            !is_external(addr.parse().unwrap()),
            "{} passed the external screen",
            addr
        );
    }

    let specs: Vec<String> = internal.iter().map(|s| {
        if s.contains(':') {
            format!("[{}]:15201", s)
        } else {
            s.to_string()
        }
    }).collect();
    assert!(
        PeerBook::load(&specs, 15201, true, 20.0).is_err(),
        "a peer book built only from special-range endpoints must fail"
    );
}

#[test]
fn neighbours_of_special_ranges_are_accepted() {
    for addr in ["9.255.255.255", "11.0.0.1", "100.63.255.254", "100.128.0.1", "126.0.0.1", "128.0.0.1", "172.15.255.254", "172.32.0.1", "192.167.0.1", "192.169.0.1", "198.17.255.254", "198.20.0.1", "223.255.255.254"] {
        assert!(
            is_external(addr.parse().unwrap()),
            "{} wrongly rejected",
            addr
        );
    }
}

// === PEER ROTATION (END-TO-END SCENARIO) ===
// TWO PEERS; THE SECOND NEVER MOVES tx_bytes. ITS REPUTATION DECAYS
// UNDER THE FLOOR WITHIN k VALIDATION WINDOWS AND SELECTION PINS TO THE
// FIRST; WHEN BOTH DIE THE CHAIN ADVANCES TO TCP.

#[test]
fn second_peer_decays_first_takes_over() {
    let mut book = PeerBook::from_records(vec![peer("198.20.0.1"), peer("198.20.0.2")], 20.0);

    // PEER 1 FAILS VALIDATION (HARD PUNISHMENT) ONCE PER WINDOW
    let mut windows_to_floor = 0;
    for window in 1..=10 {
        book.punish(1, window * 60, true);
        if book.get(1).reputation < 20.0 {
            windows_to_floor = window;
            break;
        }
    }
    // 50 -> 37.5 -> 28.1 -> 21.1 -> 15.8: UNDER THE FLOOR IN 4 WINDOWS
    assert_eq!(windows_to_floor, 4);

    // EVERY SUBSEQUENT PICK IS THE HEALTHY PEER
    for _ in 0..10 {
        assert_eq!(book.best(Proto::Udp), Some(0));
    }

    // THE HEALTHY PEER KEEPS VALIDATING AND CLIMBS
    book.reward(0, 600);
    book.reward(0, 660);
    assert!(book.get(0).reputation > NEUTRAL_REPUTATION);

    // NOW THE FIRST DIES TOO: NO VIABLE UDP PEER, CHAIN ADVANCES
    for window in 0..12 {
        book.punish(0, 700 + window * 60, true);
    }
    assert!(book.all_below_floor());
    assert_eq!(book.best(Proto::Udp), None);
    assert_eq!(advance_fallback(GenState::ActiveUdp), GenState::ActiveTcp);
    assert_eq!(advance_fallback(GenState::ActiveTcp), GenState::Error);
}

#[test]
fn validation_success_resets_error_streak() {
    let mut book = PeerBook::from_records(vec![peer("198.20.0.1")], 20.0);
    book.punish(0, 10, false);
    book.punish(0, 20, false);
    assert_eq!(book.get(0).consecutive_errors, 2);
    book.reward(0, 30);
    assert_eq!(book.get(0).consecutive_errors, 0);
    assert_eq!(book.get(0).last_ok_ts, 30);
    assert_eq!(book.get(0).last_err_ts, 20);
}

// === TOKEN BUCKET ===

#[test]
fn bucket_admits_exact_budget_over_time() {
    // 80 MBIT/S = 10 MB/S, 8900-BYTE PACKETS, 5MS TICKS FOR 2 SECONDS
    let mut bucket = TokenBucket::new(80.0, 8900, 0);
    let mut sent = 0u64;
    for tick in 1..=400u64 {
        bucket.refill(tick * 5_000_000);
        while bucket.try_take(8900) {
            sent += 8900;
        }
    }
    let expected = 20_000_000u64; // 2 SECONDS AT 10 MB/S
    let error = (sent as i64 - expected as i64).unsigned_abs();
    assert!(
        error <= 2 * 8900 + (expected / 400),
        "sent {} vs expected {} (error {})",
        sent,
        expected,
        error
    );
}

#[test]
fn tiny_rate_still_fits_one_packet() {
    // 0.1 MBIT/S: CAPACITY MUST STILL HOLD A FULL JUMBO PAYLOAD
    let mut bucket = TokenBucket::new(0.1, 8900, 0);
    // AFTER ENOUGH TIME ONE FULL PACKET IS ADMISSIBLE
    bucket.refill(2_000_000_000);
    assert!(bucket.try_take(8900));
}

#[test]
fn drain_stops_admission_immediately() {
    let mut bucket = TokenBucket::new(100.0, 1000, 0);
    bucket.refill(1_000_000_000);
    assert!(bucket.try_take(1000));
    bucket.drain();
    assert!(!bucket.try_take(1000));
}

#[test]
fn rate_change_keeps_tokens_bounded() {
    let mut bucket = TokenBucket::new(100.0, 1000, 0);
    bucket.refill(10_000_000_000);
    // DROPPING THE RATE SHRINKS CAPACITY; STORED TOKENS MUST FOLLOW
    bucket.set_rate(0.008); // 1 KB/S -> CAPACITY FLOORS AT ONE PACKET
    let mut burst = 0;
    while bucket.try_take(1000) {
        burst += 1;
    }
    assert!(burst <= 1, "rate cut left a {} packet burst", burst);
}
