//! Request lifecycle through the engine, driven one iteration at a time.

mod common;

use turbine::{
    EngineConfig, FinishReason, GenerationConfig, GenerationEvent, OutputLogits, RepetitionMode,
    RequestStatus, SequenceStatus, SessionParam,
};

use common::{
    build_engine, finished, max_tokens, run_until_idle, test_config, ManualGateway, HIDDEN, PEAK,
    VOCAB,
};

fn session(id: u64, start: bool, end: bool) -> SessionParam {
    SessionParam {
        id,
        start_flag: start,
        end_flag: end,
        ..SessionParam::default()
    }
}

#[test]
fn generation_runs_to_length_and_completes_once() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let caller = gateway.submit(SessionParam::oneshot(1), vec![1, 2, 3], max_tokens(4));

    run_until_idle(&mut engine, &gateway);

    assert_eq!(
        caller.drain(),
        vec![finished(FinishReason::Length, vec![4, 5, 6, 7])]
    );
    assert!(engine.sequences().lookup(1).is_none());
    // Further iterations must not complete the request again.
    engine.iterate().unwrap();
    assert!(caller.drain().is_empty());
}

#[test]
fn end_id_stops_generation_and_is_not_returned() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let caller = gateway.submit(SessionParam::oneshot(1), vec![3], GenerationConfig::greedy(10, 6));

    run_until_idle(&mut engine, &gateway);

    assert_eq!(caller.terminal(), finished(FinishReason::Stop, vec![4, 5]));
}

#[test]
fn streamed_tokens_precede_the_terminal_event() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let caller = gateway.submit_streaming(SessionParam::oneshot(1), vec![1], max_tokens(3), true);

    run_until_idle(&mut engine, &gateway);

    assert_eq!(
        caller.drain(),
        vec![
            GenerationEvent::Token(2),
            GenerationEvent::Token(3),
            GenerationEvent::Token(4),
            finished(FinishReason::Length, vec![2, 3, 4]),
        ]
    );
}

#[test]
fn stop_sequence_ends_generation() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let cfg = GenerationConfig {
        stop_ids: vec![vec![9, 9], vec![5, 6]],
        ..max_tokens(10)
    };
    let caller = gateway.submit(SessionParam::oneshot(1), vec![1], cfg);

    run_until_idle(&mut engine, &gateway);

    assert_eq!(
        caller.terminal(),
        finished(FinishReason::Stop, vec![2, 3, 4, 5, 6])
    );
}

#[test]
fn concurrent_requests_finish_independently() {
    let gateway = ManualGateway::new();
    let (mut engine, log) = build_engine(test_config(), &gateway);
    let a = gateway.submit(SessionParam::oneshot(1), vec![10], max_tokens(1));
    let b = gateway.submit(SessionParam::oneshot(2), vec![20], max_tokens(3));
    let c = gateway.submit(SessionParam::oneshot(3), vec![30], max_tokens(2));

    run_until_idle(&mut engine, &gateway);

    assert_eq!(a.terminal(), finished(FinishReason::Length, vec![11]));
    assert_eq!(b.terminal(), finished(FinishReason::Length, vec![21, 22, 23]));
    assert_eq!(c.terminal(), finished(FinishReason::Length, vec![31, 32]));

    let log = log.lock().unwrap();
    let batch_sizes: Vec<usize> = log.iter().map(|call| call.input_lengths.len()).collect();
    assert_eq!(batch_sizes, vec![3, 2, 1]);
}

#[test]
fn slot_is_not_reused_before_its_signal_runs() {
    let config = EngineConfig {
        max_batch_size: 1,
        ..test_config()
    };
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(config, &gateway);
    gateway.hold();
    let first = gateway.submit(SessionParam::oneshot(1), vec![1], max_tokens(1));
    let second = gateway.submit(SessionParam::oneshot(2), vec![5], max_tokens(1));

    assert!(engine.iterate().unwrap());
    assert_eq!(engine.occupied_slots(), 0);
    assert_eq!(engine.outstanding_slots(), 1);
    assert!(first.drain().is_empty());

    assert!(engine.iterate().unwrap());
    assert_eq!(gateway.queued(), 1, "second request pulled into an undelivered slot");

    gateway.flush();
    assert_eq!(first.terminal(), finished(FinishReason::Length, vec![2]));
    assert_eq!(engine.outstanding_slots(), 0);

    run_until_idle(&mut engine, &gateway);
    assert_eq!(second.terminal(), finished(FinishReason::Length, vec![6]));
}

#[test]
fn invalid_requests_are_rejected_with_their_status() {
    let config = EngineConfig {
        max_batch_size: 8,
        ..test_config()
    };
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(config, &gateway);

    let inconsistent = gateway.submit(
        SessionParam {
            step: 3,
            ..SessionParam::oneshot(1)
        },
        vec![1],
        max_tokens(2),
    );
    let unknown = gateway.submit(session(2, false, true), vec![1], max_tokens(2));
    let dup_a = gateway.submit(SessionParam::oneshot(3), vec![1], max_tokens(2));
    let dup_b = gateway.submit(SessionParam::oneshot(3), vec![2], max_tokens(2));
    let too_long = gateway.submit(SessionParam::oneshot(4), vec![1; 64], max_tokens(2));
    let empty = gateway.submit(SessionParam::oneshot(5), Vec::new(), max_tokens(2));
    let too_many_ends = gateway.submit(
        SessionParam::oneshot(6),
        vec![1],
        GenerationConfig {
            end_ids: vec![7; 33],
            ..max_tokens(2)
        },
    );
    let valid = gateway.submit(SessionParam::oneshot(7), vec![1], max_tokens(1));

    run_until_idle(&mut engine, &gateway);

    let error = GenerationEvent::Error;
    assert_eq!(inconsistent.terminal(), error(RequestStatus::Inconsistency));
    assert_eq!(unknown.terminal(), error(RequestStatus::Invalid));
    assert_eq!(dup_a.terminal(), error(RequestStatus::Conflict));
    assert_eq!(dup_b.terminal(), error(RequestStatus::Conflict));
    assert_eq!(too_long.terminal(), error(RequestStatus::TooLong));
    assert_eq!(empty.terminal(), error(RequestStatus::Invalid));
    assert_eq!(too_many_ends.terminal(), error(RequestStatus::Invalid));
    assert_eq!(valid.terminal(), finished(FinishReason::Length, vec![2]));
}

#[test]
fn second_request_for_a_generating_session_is_busy() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let running = gateway.submit(SessionParam::oneshot(1), vec![1], max_tokens(5));
    engine.iterate().unwrap();

    let busy = gateway.submit(SessionParam::oneshot(1), vec![9], max_tokens(5));
    run_until_idle(&mut engine, &gateway);

    assert_eq!(busy.terminal(), GenerationEvent::Error(RequestStatus::Busy));
    assert_eq!(
        running.terminal(),
        finished(FinishReason::Length, vec![2, 3, 4, 5, 6])
    );
}

#[test]
fn kill_interrupts_a_generating_session() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let running = gateway.submit(session(7, true, false), vec![1], max_tokens(50));
    engine.iterate().unwrap();
    engine.iterate().unwrap();

    let kill = gateway.kill(7);
    engine.iterate().unwrap();

    assert_eq!(
        running.terminal(),
        finished(FinishReason::Cancelled, vec![2, 3])
    );
    assert_eq!(kill.terminal(), finished(FinishReason::Stop, Vec::new()));
    assert!(engine.sequences().lookup(7).is_none());
    assert_eq!(engine.occupied_slots(), 0);
}

#[test]
fn kill_of_unknown_session_is_invalid() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let kill = gateway.kill(42);
    engine.iterate().unwrap();
    assert_eq!(kill.terminal(), GenerationEvent::Error(RequestStatus::Invalid));
}

#[test]
fn cancel_returns_tokens_generated_so_far() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let caller = gateway.submit(SessionParam::oneshot(1), vec![1], max_tokens(50));
    engine.iterate().unwrap();
    engine.iterate().unwrap();

    caller.cancel.cancel();
    run_until_idle(&mut engine, &gateway);

    assert_eq!(
        caller.terminal(),
        finished(FinishReason::Cancelled, vec![2, 3])
    );
}

#[test]
fn long_prompt_is_spread_over_prefill_iterations() {
    let config = EngineConfig {
        max_forward_token_num: 8,
        max_context_token_num: 8,
        max_prefill_iters: 4,
        ..test_config()
    };
    let gateway = ManualGateway::new();
    let (mut engine, log) = build_engine(config, &gateway);
    let prompt: Vec<u32> = (0..20).collect();
    let caller = gateway.submit(SessionParam::oneshot(1), prompt, max_tokens(2));

    run_until_idle(&mut engine, &gateway);

    assert_eq!(caller.terminal(), finished(FinishReason::Length, vec![20, 21]));
    let log = log.lock().unwrap();
    let inputs: Vec<Vec<u32>> = log.iter().map(|call| call.input_lengths.clone()).collect();
    let contexts: Vec<Vec<u32>> = log.iter().map(|call| call.context_lengths.clone()).collect();
    assert_eq!(inputs, vec![vec![6], vec![6], vec![6], vec![2], vec![1]]);
    assert_eq!(contexts, vec![vec![6], vec![12], vec![18], vec![20], vec![21]]);
}

#[test]
fn continued_session_reuses_its_history() {
    let gateway = ManualGateway::new();
    let (mut engine, log) = build_engine(test_config(), &gateway);

    let first = gateway.submit(session(5, true, false), vec![1, 2], max_tokens(2));
    run_until_idle(&mut engine, &gateway);
    assert_eq!(first.terminal(), finished(FinishReason::Length, vec![3, 4]));
    {
        let seq = engine.sequences().lookup(5).unwrap();
        assert_eq!(seq.tokens, vec![1, 2, 3, 4]);
        assert_eq!(seq.status, SequenceStatus::Cached);
    }

    log.lock().unwrap().clear();
    let second = gateway.submit(session(5, false, true), vec![10], max_tokens(2));
    run_until_idle(&mut engine, &gateway);

    assert_eq!(second.terminal(), finished(FinishReason::Length, vec![11, 12]));
    // Only the last generated token and the new input miss the cache.
    assert_eq!(log.lock().unwrap()[0].input_lengths, vec![2]);
    assert!(engine.sequences().lookup(5).is_none());
}

#[test]
fn abort_cancels_running_and_queued_requests() {
    let config = EngineConfig {
        max_batch_size: 1,
        ..test_config()
    };
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(config, &gateway);
    let running = gateway.submit(SessionParam::oneshot(1), vec![1], max_tokens(50));
    let queued = gateway.submit(SessionParam::oneshot(2), vec![1], max_tokens(50));
    engine.iterate().unwrap();

    gateway.abort();
    assert!(!engine.iterate().unwrap());

    let cancelled = finished(FinishReason::Cancelled, Vec::new());
    assert_eq!(running.terminal(), cancelled);
    assert_eq!(queued.terminal(), cancelled);
    assert_eq!(engine.occupied_slots(), 0);
}

#[test]
fn requested_logits_and_hidden_state_are_streamed() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let cfg = GenerationConfig {
        output_logits: OutputLogits::Generation,
        output_last_hidden_state: true,
        ..max_tokens(1)
    };
    let caller = gateway.submit(SessionParam::oneshot(1), vec![7], cfg);

    run_until_idle(&mut engine, &gateway);

    let events = caller.drain();
    assert_eq!(events.len(), 3, "{events:?}");
    let GenerationEvent::Logits(logits) = &events[0] else {
        panic!("expected logits, got {:?}", events[0]);
    };
    assert_eq!(logits.len(), VOCAB);
    assert!((logits[8] - PEAK).abs() < 1e-3);
    assert!(logits.iter().enumerate().all(|(i, &l)| i == 8 || l == 0.0));
    assert_eq!(events[1], GenerationEvent::HiddenState(vec![7.0; HIDDEN]));
    assert_eq!(events[2], finished(FinishReason::Length, vec![8]));
}

#[test]
fn additive_repetition_penalty_steers_away_from_history() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let plain = gateway.submit(SessionParam::oneshot(1), vec![8, 7], max_tokens(1));
    let penalized = gateway.submit(
        SessionParam::oneshot(2),
        vec![8, 7],
        GenerationConfig {
            repetition_penalty: 20.0,
            repetition_mode: RepetitionMode::Additive,
            ..max_tokens(1)
        },
    );

    run_until_idle(&mut engine, &gateway);

    assert_eq!(plain.terminal(), finished(FinishReason::Length, vec![8]));
    let GenerationEvent::Finished { output_ids, .. } = penalized.terminal() else {
        panic!("penalized request did not finish");
    };
    assert_eq!(output_ids.len(), 1);
    assert_ne!(output_ids[0], 8);
}

#[test]
fn end_id_is_masked_until_min_new_tokens() {
    let gateway = ManualGateway::new();
    let (mut engine, _) = build_engine(test_config(), &gateway);
    let cfg = GenerationConfig {
        min_new_tokens: 2,
        ..GenerationConfig::greedy(5, 2)
    };
    let caller = gateway.submit(SessionParam::oneshot(1), vec![1], cfg);

    run_until_idle(&mut engine, &gateway);

    let GenerationEvent::Finished { output_ids, .. } = caller.terminal() else {
        panic!("request did not finish");
    };
    assert!(!output_ids.is_empty());
    assert_ne!(output_ids[0], 2);
}
