//! The engine on its own thread behind a [`ChannelGateway`].

mod common;

use std::sync::Arc;

use turbine::{FinishReason, Gateway, GenerationEvent, SessionParam};
use turbine_runtime::ChannelGateway;

use common::{build_engine_with, finished, max_tokens, test_config};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn serves_more_requests_than_slots_then_shuts_down() {
    init_tracing();
    let gateway = Arc::new(ChannelGateway::new().unwrap());
    let (engine, _) = build_engine_with(test_config(), Arc::clone(&gateway) as Arc<dyn Gateway>);
    let handle = engine.start().unwrap();

    let submissions: Vec<_> = (0..10u32)
        .map(|i| {
            gateway.submit(
                SessionParam::oneshot(u64::from(i)),
                vec![i * 4],
                max_tokens(3),
                i % 2 == 0,
            )
        })
        .collect();

    for (i, submission) in (0..10u32).zip(submissions) {
        let start = i * 4;
        let expected: Vec<u32> = (start + 1..=start + 3).collect();
        let events = submission.wait();
        let terminal = events.last().cloned();
        assert_eq!(terminal, Some(finished(FinishReason::Length, expected.clone())));
        if i % 2 == 0 {
            let streamed: Vec<GenerationEvent> =
                expected.into_iter().map(GenerationEvent::Token).collect();
            assert_eq!(&events[..3], &streamed[..]);
        } else {
            assert_eq!(events.len(), 1);
        }
    }

    gateway.shutdown();
    handle.join().unwrap();
}

#[test]
fn kill_erases_a_kept_session() {
    init_tracing();
    let gateway = Arc::new(ChannelGateway::new().unwrap());
    let (engine, _) = build_engine_with(test_config(), Arc::clone(&gateway) as Arc<dyn Gateway>);
    let handle = engine.start().unwrap();

    let kept = SessionParam {
        end_flag: false,
        ..SessionParam::oneshot(3)
    };
    let events = gateway.submit(kept, vec![1], max_tokens(2), false).wait();
    assert_eq!(events, vec![finished(FinishReason::Length, vec![2, 3])]);

    let killed = gateway.kill(3).wait();
    assert_eq!(killed, vec![finished(FinishReason::Stop, Vec::new())]);
    let again = gateway.kill(3).wait();
    assert_eq!(
        again,
        vec![GenerationEvent::Error(turbine::RequestStatus::Invalid)]
    );

    gateway.shutdown();
    handle.join().unwrap();
}
