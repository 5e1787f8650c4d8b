#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use quota_gate::quota::{InflightLedger, LocalLedger};
use std::time::Duration;

#[derive(Arbitrary, Debug)]
enum Op {
    Reserve { bucket: u8, delta: i32 },
    ReserveWithin { bucket: u8, delta: u16, headroom: u16 },
    Commit(u8),
    Rollback(u8),
    Flush,
}

// The pending total always equals the sum of live entries
fuzz_target!(|ops: Vec<Op>| {
    let ledger = LocalLedger::new(Duration::ZERO);
    let mut handles = Vec::new();

    for op in ops {
        match op {
            Op::Reserve { bucket, delta } => {
                handles.push(ledger.reserve(&format!("b{}", bucket % 4), delta as i64));
            }
            Op::ReserveWithin { bucket, delta, headroom } => {
                let name = format!("b{}", bucket % 4);
                let before = ledger.pending_total(&name);
                match ledger.reserve_within(&name, delta as i64, headroom as i64) {
                    Ok(handle) => {
                        assert!(before + delta as i64 <= headroom as i64);
                        handles.push(handle);
                    }
                    Err(overdraft) => assert_eq!(overdraft.pending_total, before),
                }
            }
            Op::Commit(i) if !handles.is_empty() => {
                let handle = &handles[i as usize % handles.len()];
                let _ = ledger.commit(handle);
            }
            Op::Rollback(i) if !handles.is_empty() => {
                let handle = handles.swap_remove(i as usize % handles.len());
                let _ = ledger.rollback(&handle);
            }
            Op::Commit(_) | Op::Rollback(_) => {}
            Op::Flush => {
                ledger.flush();
            }
        }

        for b in 0..4 {
            let name = format!("b{}", b);
            let live: i64 = ledger.entries(&name).iter().map(|e| e.delta_bytes).sum();
            assert_eq!(ledger.pending_total(&name), live);
        }
    }
});
