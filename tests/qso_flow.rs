//! End-to-end exchange scenarios against the state machine.

use rand::SeedableRng;
use rand::rngs::StdRng;

use cwtrainer::event::EventKind;
use cwtrainer::patterns::ExchangePatterns;
use cwtrainer::qso::{CqMode, Effect, QsoConfig, QsoMachine, QsoState};

fn machine(config: QsoConfig) -> QsoMachine {
    QsoMachine::with_parts(
        config,
        ExchangePatterns::default(),
        Box::new(StdRng::seed_from_u64(42)),
    )
}

fn base_config() -> QsoConfig {
    QsoConfig {
        my_call: "EA1ABC".to_string(),
        prosign_literal: "CAVE".to_string(),
        use_prosigns: true,
        allow_tu: false,
        direct_flow: true,
        max_stations: 1,
        ..Default::default()
    }
}

fn tx_texts(effects: &[Effect]) -> Vec<String> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Tx(job) => Some(job.text.clone()),
            _ => None,
        })
        .collect()
}

fn event_count(effects: &[Effect], kind: EventKind) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, Effect::Event(ev) if ev.kind == kind))
        .count()
}

/// Keep calling CQ until the whole pool answers at once. Station count per
/// CQ is random in 1..=max_stations, so retry on a fresh machine state.
fn cq_until_full(sm: &mut QsoMachine, cq: &str, want: usize) {
    for _ in 0..500 {
        sm.feed(cq);
        if sm.pending_stations().len() == want {
            return;
        }
        sm.reset();
    }
    panic!("never drew {want} stations");
}

#[test]
fn simple_cq_to_close() {
    let mut sm = machine(QsoConfig {
        cq_mode: CqMode::Simple,
        ..base_config()
    });
    sm.set_call_pool(["K1ABC".to_string()]);

    let r0 = sm.feed("CQ CQ EA1ABC EA1ABC K");
    assert_eq!(tx_texts(&r0), vec!["K1ABC K1ABC"]);
    assert_eq!(sm.state(), QsoState::S2WaitReport);

    let r2 = sm.feed("K1ABC 5NN 5NN");
    assert_eq!(tx_texts(&r2), vec!["CAVE UR 5NN 5NN TU 73 CAVE"]);
    assert_eq!(sm.state(), QsoState::S5WaitFinal);

    let r5 = sm.feed("CAVE 73 EE");
    assert_eq!(tx_texts(&r5), vec!["EE"]);
    assert_eq!(sm.state(), QsoState::S0Idle);

    assert_eq!(sm.completions().len(), 1);
    assert_eq!(sm.completions()[0].call, "K1ABC");
    assert!(!sm.completions()[0].p2p);
}

#[test]
fn partial_query_disambiguation() {
    let mut sm = machine(QsoConfig {
        max_stations: 3,
        ..base_config()
    });
    sm.set_call_pool(
        ["EA3IMR", "EA3XYZ", "K2AB"]
            .into_iter()
            .map(String::from),
    );
    cq_until_full(&mut sm, "CQ POTA DE EA1ABC K", 3);

    let r = sm.feed("EA3?");
    let mut texts = tx_texts(&r);
    texts.sort();
    assert_eq!(texts, vec!["EA3IMR EA3IMR", "EA3XYZ EA3XYZ"]);
    assert_eq!(sm.state(), QsoState::S2WaitReport);
}

#[test]
fn full_call_query_selection() {
    let mut sm = machine(QsoConfig {
        max_stations: 2,
        ..base_config()
    });
    sm.set_call_pool(["EA3IMR", "EA3XYZ"].into_iter().map(String::from));
    cq_until_full(&mut sm, "CQ POTA DE EA1ABC K", 2);

    let r = sm.feed("EA3IMR?");
    assert_eq!(tx_texts(&r), vec!["RR"]);
    assert_eq!(sm.state(), QsoState::S2WaitReport);
}

#[test]
fn p2p_exchange() {
    let mut sm = machine(QsoConfig {
        cq_mode: CqMode::Pota,
        p2p_percent: 100.0,
        my_park_ref: "ES-0001".to_string(),
        ..base_config()
    });
    sm.set_call_pool(["K1ABC".to_string()]);
    sm.set_park_pool(["US-1234".to_string()]);

    let r0 = sm.feed("CQ POTA DE EA1ABC K");
    assert_eq!(tx_texts(&r0), vec!["K1ABC K1ABC US1234 US1234"]);

    let r2 = sm.feed("P2P");
    assert_eq!(
        tx_texts(&r2),
        vec!["R R K1ABC K1ABC MY REF US1234 US1234 73 CAVE"]
    );
    assert_eq!(sm.state(), QsoState::S5WaitFinal);

    let r5 = sm.feed("CAVE K1ABC EA1ABC MY REF ES0001 ES0001");
    assert_eq!(tx_texts(&r5), vec!["EE"]);

    let record = &sm.completions()[0];
    assert_eq!(record.call, "K1ABC");
    assert!(record.p2p);
    assert_eq!(record.park_ref.as_deref(), Some("US-1234"));
}

#[test]
fn unexpected_input_is_ignored_with_one_event() {
    let mut sm = machine(base_config());
    let r = sm.feed("FOO BAR");
    assert_eq!(sm.state(), QsoState::S0Idle);
    assert!(tx_texts(&r).is_empty());
    assert_eq!(event_count(&r, EventKind::QsoUnexpectedInput), 1);
}

#[test]
fn queue_respects_max_stations_and_single_p2p() {
    for mode in [CqMode::Simple, CqMode::Pota, CqMode::Sota] {
        let mut sm = machine(QsoConfig {
            cq_mode: mode,
            max_stations: 4,
            p2p_percent: 50.0,
            ..base_config()
        });
        sm.set_call_pool(
            ["EA1AFV", "EA2BBB", "EA3IMR", "K2AB", "N1MM"]
                .into_iter()
                .map(String::from),
        );
        sm.set_park_pool(["US-0001".to_string()]);
        let cq = match mode {
            CqMode::Simple => "CQ CQ EA1ABC K",
            CqMode::Pota => "CQ POTA DE EA1ABC K",
            CqMode::Sota => "CQ SOTA DE EA1ABC K",
        };
        for _ in 0..30 {
            sm.feed(cq);
            let stations = sm.pending_stations();
            assert!((1..=4).contains(&stations.len()));
            let p2p = stations.iter().filter(|s| s.is_p2p).count();
            assert!(p2p <= 1);
            if mode != CqMode::Pota {
                assert_eq!(p2p, 0);
            }
            sm.reset();
        }
    }
}

#[test]
fn message_matching_no_rule_never_moves_state() {
    let mut sm = machine(base_config());
    sm.feed("CQ POTA DE EA1ABC K");
    let state = sm.state();
    for junk in ["QRZ", "HELLO WORLD", "EA9ZZZ 5NN 5NN", "="] {
        sm.feed(junk);
        assert_eq!(sm.state(), state, "state moved on {junk:?}");
    }
}

#[test]
fn export_contains_completions_and_transcripts() {
    let mut sm = machine(QsoConfig {
        cq_mode: CqMode::Simple,
        ..base_config()
    });
    sm.set_call_pool(["K1ABC".to_string()]);
    sm.feed("CQ CQ EA1ABC EA1ABC K");
    sm.feed("K1ABC 5NN 5NN");
    sm.feed("CAVE 73 EE");

    let export = sm.export_session();
    assert_eq!(export.completions.len(), 1);
    assert!(!export.rx_transcript.is_empty());
    assert!(export.tx_transcript.contains(&"EE".to_string()));

    let json = serde_json::to_string(&export).unwrap();
    assert!(json.contains("\"K1ABC\""));
}
