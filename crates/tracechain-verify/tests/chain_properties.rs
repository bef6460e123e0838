//! Property tests for chain verification over generated span batches.

use proptest::prelude::*;
use tracechain_verify::{ChainRequirement, Span, SpanBatch, SpanStore, TraceVerifier, VerifyError};

const KINDS: [&str; 4] = ["ws.message", "pg.write", "redis.update", "ws.push"];

fn chain(cid: &str, business_on: usize) -> Vec<Span> {
    KINDS
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let span = Span::new(*kind).with_attr("correlation_id", cid);
            if i == business_on { span.with_attr("session_id", "s-1") } else { span }
        })
        .collect()
}

fn noise() -> impl Strategy<Value = Vec<Span>> {
    prop::collection::vec(
        ("[a-z]{1,8}\\.[a-z]{1,8}", prop::option::of("n-[0-9]{1,3}")).prop_map(|(name, cid)| {
            match cid {
                Some(cid) => Span::new(name).with_attr("correlation_id", cid),
                None => Span::new(name),
            }
        }),
        0..20,
    )
}

proptest! {
    #[test]
    fn complete_chain_found_among_noise(
        business_on in 0..KINDS.len(),
        mut spans in noise(),
        position in 0usize..20,
    ) {
        let tail = spans.split_off(position.min(spans.len()));
        spans.extend(chain("X", business_on));
        spans.extend(tail);
        let store = SpanStore::from_batch(SpanBatch::new(spans));

        let proof = TraceVerifier::default().verify(&["n-1", "X"], &store).unwrap();
        prop_assert_eq!(proof.correlation_id, "X");
        prop_assert_eq!(proof.business_id, "s-1");
    }

    #[test]
    fn removing_any_kind_names_it(removed in 0..KINDS.len(), business_on in 0..KINDS.len()) {
        let mut spans = chain("X", business_on);
        spans.remove(removed);
        // Keep the business id present so only the kind is missing.
        spans[0] = spans[0].clone().with_attr("session_id", "s-1");
        let store = SpanStore::from_batch(SpanBatch::new(spans));

        let err = TraceVerifier::default().verify(&["X"], &store).unwrap_err();
        let VerifyError::ChainIncomplete { best: Some(gap) } = err else {
            return Err(TestCaseError::fail(format!("unexpected {err:?}")));
        };
        prop_assert_eq!(gap.missing_kinds, vec![KINDS[removed].to_string()]);
        prop_assert!(!gap.missing_business_id);
    }

    #[test]
    fn verdict_does_not_depend_on_span_order(seed in any::<u64>()) {
        let mut spans = chain("X", (seed % 4) as usize);
        spans.rotate_left((seed % 3) as usize);
        let store = SpanStore::from_batch(SpanBatch::new(spans));

        prop_assert!(TraceVerifier::new(ChainRequirement::standard()).verify(&["X"], &store).is_ok());
    }
}

#[test]
fn export_text_round_trip_through_verifier() {
    let text = SpanBatch::new(chain("X", 1)).to_json().unwrap();
    let proof = TraceVerifier::default().verify_export(&["X"], &text).unwrap();
    assert_eq!(proof.evidence.len(), 4);
}
