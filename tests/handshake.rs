use std::sync::Arc;

use http::request::Parts;
use http::Request;
use powgate::solver::solve;
use powgate::{
    ChallengeGate, Decision, DifficultyTracker, GateConfigBuilder, GateError, ManualClock,
    TrackerConfigBuilder, VerifyError,
};

const SECRET: &[u8] = b"handshake-secret";
const NOW: u64 = 1_750_000_000;
const CLIENT: &str = "203.0.113.50";

fn parts(headers: &[(&str, &str)]) -> Parts {
    let mut builder = Request::post("/session");
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    builder.body(()).unwrap().into_parts().0
}

#[test]
fn fresh_client_solves_once_and_replay_after_expiry_fails() {
    let clock = Arc::new(ManualClock::new(NOW));
    let tracker = Arc::new(
        DifficultyTracker::new(
            TrackerConfigBuilder::default()
                .epsilon(0.001)
                .delta(0.01)
                .build_validated()
                .unwrap(),
        )
        .unwrap(),
    );
    let gate = ChallengeGate::new(
        GateConfigBuilder::default()
            .secret(SECRET)
            .base_difficulty(20_000)
            .build_validated()
            .unwrap(),
        tracker.clone(),
    )
    .unwrap()
    .clock(clock.clone());

    // Build up some history for this client so the score is non-zero.
    let client_id: Vec<u8> = CLIENT.parse::<std::net::Ipv4Addr>().unwrap().octets().to_vec();
    for _ in 0..150 {
        tracker.observe(&client_id);
    }
    tracker.decay();
    let score = tracker.score(&client_id);
    assert!(score > 0);

    let challenge = match gate.evaluate(&parts(&[("x-forwarded-for", CLIENT)])).unwrap() {
        Decision::Challenge(c) => c,
        Decision::Pass => panic!("client without a solution must be challenged"),
    };
    assert_eq!(challenge.max_number, 20_000 + u64::from(score));

    let payload = solve(&challenge).expect("committed number lies in range");
    assert!(payload.number <= challenge.max_number);
    let header = payload.to_header().unwrap();

    assert_eq!(
        gate.evaluate(&parts(&[("x-pow-challenge", header.as_str())]))
            .unwrap(),
        Decision::Pass
    );

    clock.advance(gate.config().expiry.as_secs() + 5);
    let err = gate
        .evaluate(&parts(&[("x-pow-challenge", header.as_str())]))
        .unwrap_err();
    assert_eq!(
        err,
        GateError::Verify(VerifyError::Expired { overshoot_secs: 5 })
    );
}
