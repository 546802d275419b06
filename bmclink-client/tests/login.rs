mod common;

use std::time::Duration;

use bmclink_client::{
    BridgeTarget, CommandOpts, IpmiError, Reactor, Session, SessionConfig,
};
use common::{bump, counter, BmcOptions};

fn config(bmc: &common::MockBmc) -> SessionConfig {
    let mut cfg = SessionConfig::new("127.0.0.1", "admin", "admin");
    cfg.port = bmc.addr.port();
    cfg
}

#[tokio::test]
async fn happy_login_and_raw_command() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bmc = common::spawn(BmcOptions::default()).await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();
    assert!(session.is_logged());
    assert_eq!(session.privlevel(), 4);

    let rsp = session.raw_command(0x06, 0x01, &[]).await.unwrap();
    assert_eq!(rsp.code, 0);
    assert_eq!(rsp.netfn, 0x07);
    assert_eq!(rsp.command, 0x01);
    assert_eq!(rsp.data[0], 0x20);

    session.logout().await.unwrap();
    assert!(!session.is_logged());
    assert!(matches!(
        session.raw_command(0x06, 0x01, &[]).await,
        Err(IpmiError::NotConnected)
    ));
}

#[tokio::test]
async fn sha1_fallback_when_sha256_refused() {
    let bmc = common::spawn(BmcOptions {
        reject_sha256: true,
        ..Default::default()
    })
    .await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();
    assert!(session.is_logged());
    // The session is usable end to end under the downgraded suite.
    let rsp = session.raw_command(0x06, 0x01, &[]).await.unwrap();
    assert_eq!(rsp.code, 0);
}

#[tokio::test]
async fn privilege_downgrade_on_rakp2_role_refusal() {
    let bmc = common::spawn(BmcOptions {
        rakp2_status_first: Some(9),
        ..Default::default()
    })
    .await;
    let session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();
    assert!(session.is_logged());
    assert_eq!(session.privlevel(), 3);
}

#[tokio::test]
async fn explicit_privilege_does_not_downgrade() {
    let bmc = common::spawn(BmcOptions {
        rakp2_status_first: Some(9),
        ..Default::default()
    })
    .await;
    let mut cfg = config(&bmc);
    cfg.privlevel = Some(4);
    let err = Session::connect_with(cfg, Reactor::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid role in RAKP2");
}

#[tokio::test]
async fn privilege_downgrade_on_set_privilege_refusal() {
    let bmc = common::spawn(BmcOptions {
        priv4_code: 0x80,
        ..Default::default()
    })
    .await;
    let session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();
    assert_eq!(session.privlevel(), 3);
}

#[tokio::test]
async fn wrong_password_is_terminal() {
    let bmc = common::spawn(BmcOptions {
        wrong_password: true,
        ..Default::default()
    })
    .await;
    let err = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "Incorrect password provided");
}

#[tokio::test]
async fn wrong_kg_fails_rakp4_integrity() {
    let bmc = common::spawn(BmcOptions::default()).await;
    let mut cfg = config(&bmc);
    cfg.kg = Some(b"somethingelse".to_vec());
    let err = Session::connect_with(cfg, Reactor::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid RAKP4 integrity code (wrong Kg?)");
}

#[tokio::test]
async fn oversized_credentials_are_rejected_up_front() {
    let cfg = SessionConfig::new("127.0.0.1", "a".repeat(17), "pw");
    assert!(matches!(
        Session::connect_with(cfg, Reactor::new()).await,
        Err(IpmiError::InvalidArgument(_))
    ));
    let cfg = SessionConfig::new("127.0.0.1", "admin", "p".repeat(21));
    assert!(matches!(
        Session::connect_with(cfg, Reactor::new()).await,
        Err(IpmiError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn bridged_request_returns_inner_reply() {
    let calls = counter();
    let seen = calls.clone();
    let bmc = common::spawn(BmcOptions {
        handler: Some(Box::new(move |netfn, cmd, _| {
            if netfn == 0x04 && cmd == 0x2d {
                bump(&seen);
                return Some((0, vec![0x42, 0b0100_0000, 0]));
            }
            None
        })),
        ..Default::default()
    })
    .await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();
    let rsp = session
        .raw_command_with(
            0x04,
            0x2d,
            &[0x04],
            CommandOpts {
                bridge: Some(BridgeTarget { addr: 0x72, channel: 0 }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rsp.code, 0);
    assert_eq!(rsp.data[0], 0x42);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn command_timeout_breaks_the_session() {
    let bmc = common::spawn(BmcOptions {
        ignore: vec![(0x06, 0x02)],
        ..Default::default()
    })
    .await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();

    let err = session.raw_command(0x06, 0x02, &[]).await.unwrap_err();
    assert_eq!(err.to_string(), "timeout");
    assert!(session.is_broken());
    assert!(matches!(
        session.raw_command(0x06, 0x01, &[]).await,
        Err(IpmiError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn no_retry_command_times_out_softly() {
    let bmc = common::spawn(BmcOptions {
        ignore: vec![(0x06, 0x02)],
        ..Default::default()
    })
    .await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();

    let err = session
        .raw_command_with(
            0x06,
            0x02,
            &[],
            CommandOpts { retry: false, ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IpmiError::Timeout));
    // The session survives a one-shot surrender.
    assert!(!session.is_broken());
    let rsp = session.raw_command(0x06, 0x01, &[]).await.unwrap();
    assert_eq!(rsp.code, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_session_keeps_itself_alive() {
    let bmc = common::spawn(BmcOptions::default()).await;
    let mut session = Session::connect_with(config(&bmc), Reactor::new()).await.unwrap();

    // Well past the idle ceiling; the default keepalive must have kept
    // the session usable.
    session
        .wait_for_rsp(Duration::from_secs(40))
        .await
        .unwrap();
    assert!(session.is_logged());
    let rsp = session.raw_command(0x06, 0x01, &[]).await.unwrap();
    assert_eq!(rsp.code, 0);
}
