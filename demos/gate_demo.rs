//! End-to-end walk through the challenge gate in front of a session endpoint.
//!
//! - The decay loop runs on the Tokio runtime for the lifetime of the demo.
//! - A client without a session is challenged, solves on a blocking thread,
//!   resubmits and receives a session cookie.
//! - With the cookie it is exempt from further challenges.

use std::error::Error;
use std::sync::Arc;

use http::header::{COOKIE, SET_COOKIE};
use http::{Request, Response, StatusCode};
use powgate::solver::solve_parallel;
use powgate::{
    Challenge, ChallengeGate, DifficultyTracker, GateConfigBuilder, SessionConfigBuilder,
    SessionExempt, SessionManager, TrackerConfig,
};
use tokio::sync::oneshot;

const SERVER_SECRET: [u8; 32] = [0x42; 32];

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let tracker = Arc::new(DifficultyTracker::new(TrackerConfig::default())?);
    let sessions = Arc::new(SessionManager::new(
        SessionConfigBuilder::default()
            .secret(SERVER_SECRET.as_slice())
            .build_validated()?,
    )?);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let decay = tokio::spawn({
        let tracker = tracker.clone();
        async move {
            tracker
                .run_decay_loop(async move {
                    let _ = stop_rx.await;
                })
                .await;
        }
    });

    let gate = ChallengeGate::new(
        GateConfigBuilder::default()
            .secret(SERVER_SECRET.as_slice())
            .base_difficulty(50_000)
            .build_validated()?,
        tracker.clone(),
    )?
    .exempt(SessionExempt(sessions.clone()));

    let session_handler = {
        let sessions = sessions.clone();
        move |req: Request<()>| {
            let existing = sessions.retrieve(req.headers()).ok().flatten();
            let payload = sessions.issue(existing.as_ref());
            match sessions.cookie(&payload) {
                Ok(cookie) => {
                    let mut res = Response::new(r#"{"challenge":null}"#.to_owned());
                    if let Ok(value) = cookie.parse() {
                        res.headers_mut().insert(SET_COOKIE, value);
                    }
                    res
                }
                Err(err) => {
                    let mut res = Response::new(err.to_string());
                    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    res
                }
            }
        }
    };
    let endpoint = Arc::new(gate).with_challenge(session_handler);

    let request = |headers: &[(http::HeaderName, String)]| -> Result<Request<()>, http::Error> {
        let mut builder = Request::post("/session").header("x-forwarded-for", "198.51.100.23");
        for (name, value) in headers {
            builder = builder.header(name, value.as_str());
        }
        builder.body(())
    };

    // 1. No header: the gate answers with a challenge.
    let res = endpoint(request(&[])?);
    println!("challenge response: {} {}", res.status(), res.body());
    let challenge: Challenge = serde_json::from_str(res.body())?;

    // 2. Solve off the async runtime and resubmit.
    let solved = tokio::task::spawn_blocking(move || solve_parallel(&challenge, 4)).await??;
    let payload = solved.ok_or("challenge had no solution in range")?;
    println!("solved number {} in {} ms", payload.number, payload.took);

    let res = endpoint(request(&[(
        "x-pow-challenge".parse()?,
        payload.to_header()?,
    )])?);
    println!("verified response: {} {}", res.status(), res.body());
    let cookie = res
        .headers()
        .get(SET_COOKIE)
        .ok_or("no session cookie issued")?
        .to_str()?
        .split(';')
        .next()
        .unwrap_or_default()
        .to_owned();

    // 3. The session cookie makes the client exempt.
    let res = endpoint(request(&[(COOKIE, cookie)])?);
    println!("with session: {} {}", res.status(), res.body());

    // 4. Replaying the old solution without the cookie still works until it expires.
    let res = endpoint(request(&[(
        "x-pow-challenge".parse()?,
        payload.to_header()?,
    )])?);
    println!("replayed solution: {}", res.status());

    let _ = stop_tx.send(());
    decay.await?;
    Ok(())
}
