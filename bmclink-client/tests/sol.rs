mod common;

use std::sync::{Arc, Mutex};

use bmclink_client::{Console, ConsoleConfig, ConsoleEvent, IpmiError, Reactor};
use common::{bump, counter, BmcOptions};

fn config(bmc: &common::MockBmc) -> ConsoleConfig {
    let mut cfg = ConsoleConfig::new("127.0.0.1", "admin", "admin");
    cfg.session.port = bmc.addr.port();
    cfg
}

fn event_sink() -> (Arc<Mutex<Vec<ConsoleEvent>>>, impl FnMut(ConsoleEvent) + Send) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |ev| sink.lock().unwrap().push(ev))
}

#[tokio::test(start_paused = true)]
async fn chunked_send_with_retransmit_then_ack() {
    // Scenario: 80 bytes against a 64-byte limit. The first frame gets no
    // ack until its retransmit; the ack releases the 16-byte tail.
    let acks = counter();
    let acks_in_handler = acks.clone();
    let mut bmc = common::spawn(BmcOptions {
        sol: Some(Box::new(move |frame| {
            let seq = frame[0] & 0x0f;
            if seq == 1 {
                // Stay silent on the first transmit, ack the retry.
                if bump(&acks_in_handler) == 0 {
                    return vec![];
                }
                return vec![vec![0, 1, 64, 0]];
            }
            if seq == 2 {
                return vec![vec![0, 2, 16, 0]];
            }
            vec![]
        })),
        ..Default::default()
    })
    .await;

    let (_events, sink) = event_sink();
    let mut console = Console::connect_with(config(&bmc), Reactor::new(), sink).await.unwrap();

    let data: Vec<u8> = (0..80u8).collect();
    console.send_data(&data).await.unwrap();
    let mut frames: Vec<Vec<u8>> = Vec::new();
    for _ in 0..20 {
        console.step().await.unwrap();
        while let Ok(frame) = bmc.seen_sol.try_recv() {
            frames.push(frame);
        }
        if frames.len() >= 3 {
            break;
        }
    }

    assert!(frames.len() >= 3, "expected initial send, retry and tail");
    assert_eq!(frames[0][0], 1);
    assert_eq!(&frames[0][4..], &data[..64]);
    assert_eq!(frames[1], frames[0], "retransmit is verbatim");
    assert_eq!(frames[2][0], 2);
    assert_eq!(&frames[2][4..], &data[64..]);
}

#[tokio::test(start_paused = true)]
async fn remote_retry_delivers_only_the_new_tail() {
    // Scenario: the BMC retries remote sequence 3 with 10 then 15 bytes;
    // the console must deliver 10 bytes, then only the 5 new ones.
    let bmc = common::spawn(BmcOptions {
        sol: Some(Box::new(|frame| {
            if frame[0] & 0x0f == 0 {
                // Pure ack from the console; nothing to do.
                return vec![];
            }
            let mut first = vec![3, frame[0] & 0x0f, frame.len() as u8 - 4, 0];
            first.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
            let mut second = vec![3, 0, 0, 0];
            second.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
            vec![first, second]
        })),
        ..Default::default()
    })
    .await;

    let (events, sink) = event_sink();
    let mut console = Console::connect_with(config(&bmc), Reactor::new(), sink).await.unwrap();

    console.send_data(b"x").await.unwrap();
    for _ in 0..10 {
        console.step().await.unwrap();
        let delivered: usize = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ConsoleEvent::Data(_)))
            .count();
        if delivered >= 2 {
            break;
        }
    }

    let got: Vec<Vec<u8>> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ConsoleEvent::Data(d) => Some(d.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], (1..=10).collect::<Vec<u8>>());
    assert_eq!(got[1], vec![11, 12, 13, 14, 15]);
}

#[tokio::test(start_paused = true)]
async fn deactivation_flag_breaks_the_console() {
    let bmc = common::spawn(BmcOptions {
        sol: Some(Box::new(|frame| {
            let seq = frame[0] & 0x0f;
            if seq != 0 {
                // NACK with the deactivated bit set.
                return vec![vec![0, seq, 0, 0b101_0000]];
            }
            vec![]
        })),
        ..Default::default()
    })
    .await;

    let (events, sink) = event_sink();
    let mut console = Console::connect_with(config(&bmc), Reactor::new(), sink).await.unwrap();
    console.send_data(b"hello").await.unwrap();
    for _ in 0..10 {
        if console.step().await.is_err() || console.is_broken() {
            break;
        }
    }
    assert!(console.is_broken());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| *e == ConsoleEvent::Error("Remote IPMI console disconnected".into())));
}

#[tokio::test]
async fn activation_conflict_without_force_fails() {
    let bmc = common::spawn(BmcOptions {
        handler: Some(Box::new(|netfn, cmd, _| {
            if netfn == 0x06 && cmd == 0x48 {
                return Some((0x80, vec![]));
            }
            None
        })),
        ..Default::default()
    })
    .await;
    let (_events, sink) = event_sink();
    let err = Console::connect_with(config(&bmc), Reactor::new(), sink).await.unwrap_err();
    assert_eq!(err.to_string(), "SOL Session active for another client");
}

#[tokio::test]
async fn force_deactivates_and_retries_activation() {
    let attempts = counter();
    let attempts_in_handler = attempts.clone();
    let deactivated = counter();
    let deactivated_in_handler = deactivated.clone();
    let bmc = common::spawn(BmcOptions {
        handler: Some(Box::new(move |netfn, cmd, _| {
            if netfn == 0x06 && cmd == 0x48 && bump(&attempts_in_handler) == 0 {
                return Some((0x80, vec![]));
            }
            if netfn == 0x06 && cmd == 0x49 {
                bump(&deactivated_in_handler);
            }
            None
        })),
        ..Default::default()
    })
    .await;
    let mut cfg = config(&bmc);
    cfg.force = true;
    let (_events, sink) = event_sink();
    let console = Console::connect_with(cfg, Reactor::new(), sink).await.unwrap();
    assert!(!console.is_broken());
    assert_eq!(deactivated.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn named_activation_errors_surface() {
    for (code, text) in [
        (0x81u8, "SOL is disabled"),
        (0x82, "Maximum SOL session count reached"),
        (0x83, "Cannot activate payload with encryption"),
        (0x84, "Cannot activate payload without encryption"),
    ] {
        let bmc = common::spawn(BmcOptions {
            handler: Some(Box::new(move |netfn, cmd, _| {
                if netfn == 0x06 && cmd == 0x48 {
                    return Some((code, vec![]));
                }
                None
            })),
            ..Default::default()
        })
        .await;
        let (_events, sink) = event_sink();
        match Console::connect_with(config(&bmc), Reactor::new(), sink).await {
            Err(IpmiError::Sol(msg)) => assert_eq!(msg, text),
            other => panic!("expected Sol error, got {:?}", other.map(|_| ())),
        }
    }
}

#[tokio::test]
async fn nonstandard_port_is_refused() {
    let bmc = common::spawn(BmcOptions {
        activation_data: Some(vec![0, 0, 0, 0, 64, 0, 4, 0, 0x99, 0x99]),
        ..Default::default()
    })
    .await;
    let (_events, sink) = event_sink();
    let err = Console::connect_with(config(&bmc), Reactor::new(), sink).await.unwrap_err();
    assert_eq!(err.to_string(), "Non-standard SOL Port Number");
}
