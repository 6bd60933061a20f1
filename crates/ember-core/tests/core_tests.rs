//! Tests for ember-core: metabolism invariants, receipt tamper detection, seeds

use ember_core::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

// ===========================================================================
// ResourceLedger - range invariant under arbitrary operation sequences
// ===========================================================================

#[derive(Debug, Clone)]
enum Op {
    Decay(u32),
    Cost(f64),
    Cool(f64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..20).prop_map(Op::Decay),
        (-5.0f64..50.0).prop_map(Op::Cost),
        (0.0f64..40.0).prop_map(Op::Cool),
    ]
}

fn in_range(state: &ResourceState, cfg: &MetabolismConfig) -> bool {
    (0.0..=cfg.energy_max).contains(&state.energy)
        && (0.0..=cfg.temperature_max).contains(&state.temperature)
        && (0.0..=100.0).contains(&state.memory_integrity)
        && (0.0..=100.0).contains(&state.stability)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn resources_stay_in_range(
        ops in proptest::collection::vec(op(), 1..120),
        seed in any::<u64>(),
        jitter in 0.0f64..30.0,
    ) {
        let cfg = MetabolismConfig { heat_jitter: jitter, ..Default::default() };
        let mut ledger = ResourceLedger::with_seed(cfg.fresh_state(), cfg.clone(), seed);
        for op in ops {
            let _ = match op {
                Op::Decay(n) => ledger.passive_decay(n),
                Op::Cost(x) => ledger.apply_cost(x),
                Op::Cool(x) => { ledger.cool(x); Ok(()) }
            };
            prop_assert!(in_range(ledger.state(), &cfg), "out of range: {:?}", ledger.state());
        }
    }

    #[test]
    fn pulse_count_is_monotonic(ticks in proptest::collection::vec(1u32..5, 1..40)) {
        let cfg = MetabolismConfig::default();
        let mut ledger = ResourceLedger::with_seed(cfg.fresh_state(), cfg, 1);
        let mut last = 0;
        for n in ticks {
            if ledger.passive_decay(n).is_err() {
                break;
            }
            prop_assert!(ledger.state().pulse_count > last);
            last = ledger.state().pulse_count;
        }
    }
}

#[test]
fn energy_one_with_cost_two_dies_of_energy_at_zero() {
    let cfg = MetabolismConfig::default();
    let state = ResourceState { energy: 1.0, ..cfg.fresh_state() };
    let mut ledger = ResourceLedger::new(state, cfg);
    assert_eq!(ledger.apply_cost(2.0), Err(DeathKind::Energy));
    assert_eq!(ledger.state().energy, 0.0);
    assert_eq!(ledger.evaluate_death(), Some(DeathKind::Energy));
}

#[test]
fn sustained_heat_kills_thermally_before_memory() {
    let cfg = MetabolismConfig { heat_per_energy: 10.0, ..Default::default() };
    let mut ledger = ResourceLedger::with_seed(cfg.fresh_state(), cfg, 3);
    let mut death = None;
    for _ in 0..50 {
        if let Err(kind) = ledger.apply_cost(1.0).and_then(|_| ledger.passive_decay(1)) {
            death = Some(kind);
            break;
        }
    }
    assert_eq!(death, Some(DeathKind::Thermal));
}

// ===========================================================================
// ReceiptChain - tamper detection on every non-final receipt
// ===========================================================================

fn sample_chain(n: usize) -> (ReceiptChain, TrustedKey) {
    let identity = Arc::new(Identity::generate().unwrap());
    let key = identity.trusted_key();
    let mut chain = ReceiptChain::new(identity);
    chain.record(ReceiptKind::Spawn, json!({ "origin": "fresh" }));
    for i in 1..n {
        chain.record(ReceiptKind::Tick, json!({ "pulse": i, "mask": "healer", "cost": 0.2 }));
    }
    (chain, key)
}

#[test]
fn chain_verifies_after_appends() {
    let (chain, key) = sample_chain(25);
    assert!(ReceiptChain::verify(chain.receipts(), &key));
}

#[test]
fn flipping_any_hash_or_signature_byte_is_detected() {
    let (chain, key) = sample_chain(6);
    let original = chain.receipts().to_vec();
    for index in 0..original.len() - 1 {
        for byte in [0usize, 13, 31] {
            let mut receipts = original.clone();
            receipts[index].prev_hash[byte] ^= 0x01;
            assert!(!ReceiptChain::verify(&receipts, &key), "prev_hash #{index}[{byte}]");

            let mut receipts = original.clone();
            receipts[index].payload_hash[byte] ^= 0x01;
            assert!(!ReceiptChain::verify(&receipts, &key), "payload_hash #{index}[{byte}]");

            let mut receipts = original.clone();
            receipts[index].signature[byte] ^= 0x01;
            assert!(!ReceiptChain::verify(&receipts, &key), "signature #{index}[{byte}]");
        }
    }
}

#[test]
fn mutating_serialized_payload_bytes_is_detected() {
    let (chain, key) = sample_chain(5);
    for index in 0..4 {
        let mut receipts = chain.receipts().to_vec();
        let encoded = serde_json::to_string(&receipts[index].payload).unwrap();
        let tampered = encoded.replacen("0.2", "0.3", 1).replacen("fresh", "fresk", 1);
        assert_ne!(encoded, tampered);
        receipts[index].payload = serde_json::from_str(&tampered).unwrap();
        let fault = ReceiptChain::verify_detailed(&receipts, &key).unwrap_err();
        assert_eq!(fault.index, index);
    }
}

#[test]
fn verification_with_wrong_key_fails_at_genesis() {
    let (chain, _) = sample_chain(3);
    let other = Identity::generate().unwrap().trusted_key();
    let fault = ReceiptChain::verify_detailed(chain.receipts(), &other).unwrap_err();
    assert_eq!(fault.index, 0);
}

// ===========================================================================
// SnapshotCodec
// ===========================================================================

#[test]
fn seed_roundtrip_through_file_keeps_pulse() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = MetabolismConfig::default();
    let codec = SnapshotCodec::from_config(&cfg);
    let identity = Identity::generate().unwrap();

    let mut ledger = ResourceLedger::with_seed(cfg.fresh_state(), cfg.clone(), 11);
    ledger.passive_decay(37).unwrap();
    let behavior =
        BehavioralState { mask: Mask::Judge, mood: "vigilant".into(), ..Default::default() };

    let path = dir.path().join("ember.seed");
    codec.export(ledger.state(), &behavior, &identity).unwrap().write_to(&path).unwrap();
    let seed = codec.import_file(&path, &identity.trusted_key()).unwrap();

    assert_eq!(seed.resource(), ledger.state());
    assert_eq!(seed.resource().pulse_count, 37);
    assert_eq!(seed.behavior().mask, Mask::Judge);
    assert_eq!(seed.behavior().mood, "vigilant");

    let resumed = ResourceLedger::new(seed.resource().clone(), cfg);
    assert_eq!(resumed.state().pulse_count, 37);
}

#[test]
fn seed_missing_routine_streak_defaults_to_zero() {
    let behavior: BehavioralState =
        serde_json::from_str(r#"{"mask":"healer","mood":"calm","veto_pending":false}"#).unwrap();
    assert_eq!(behavior.routine_streak, 0);
}
