use bmclink_crypto::{md5_authcode, HashAlg, SessionKeys};
use bmclink_proto::packet::{self, Inbound, InboundCtx, PayloadType, Protection};

fn keys(alg: HashAlg) -> SessionKeys {
    SessionKeys::derive(alg, b"admin", &[3u8; 16], &[4u8; 16], 0x14, b"admin")
}

fn ctx<'a>(keys: Option<&'a SessionKeys>, localsid: u32) -> InboundCtx<'a> {
    InboundCtx {
        localsid,
        keys: keys.map(|k| Protection {
            alg: k.alg(),
            k1: k.k1(),
            aes_key: k.aes_key(),
        }),
        v15_authtype: 0,
        v15_session_id: 0,
        password: b"admin",
        last_remote_sequence: None,
    }
}

#[test]
fn v20_encrypted_round_trip() {
    for alg in [HashAlg::Sha1, HashAlg::Sha256] {
        let k = keys(alg);
        let prot = Protection {
            alg,
            k1: k.k1(),
            aes_key: k.aes_key(),
        };
        let payload: Vec<u8> = (0u8..37).collect();
        let wire = packet::encode_v20(PayloadType::Ipmi, 0x778899aa, 5, &payload, Some(&prot));

        match packet::decode(&wire, &ctx(Some(&k), 0x778899aa)) {
            Some(Inbound::Ipmi { sequence, payload: got }) => {
                assert_eq!(sequence, 5);
                assert_eq!(got, payload);
            }
            other => panic!("decode failed: {other:?}"),
        }
    }
}

#[test]
fn v20_sol_payload_routes_separately() {
    let k = keys(HashAlg::Sha1);
    let prot = Protection {
        alg: HashAlg::Sha1,
        k1: k.k1(),
        aes_key: k.aes_key(),
    };
    let wire = packet::encode_v20(PayloadType::Sol, 1, 9, &[1, 0, 0, 0, b'h'], Some(&prot));
    assert!(matches!(
        packet::decode(&wire, &ctx(Some(&k), 1)),
        Some(Inbound::Sol { sequence: 9, .. })
    ));
}

#[test]
fn tampered_hmac_is_silently_dropped() {
    let k = keys(HashAlg::Sha1);
    let prot = Protection {
        alg: HashAlg::Sha1,
        k1: k.k1(),
        aes_key: k.aes_key(),
    };
    let mut wire = packet::encode_v20(PayloadType::Ipmi, 1, 5, &[0xaa; 8], Some(&prot));
    let last = wire.len() - 1;
    wire[last] ^= 1;
    assert_eq!(packet::decode(&wire, &ctx(Some(&k), 1)), None);
}

#[test]
fn foreign_session_id_is_silently_dropped() {
    let k = keys(HashAlg::Sha1);
    let prot = Protection {
        alg: HashAlg::Sha1,
        k1: k.k1(),
        aes_key: k.aes_key(),
    };
    let wire = packet::encode_v20(PayloadType::Ipmi, 42, 5, &[0xaa; 8], Some(&prot));
    assert_eq!(packet::decode(&wire, &ctx(Some(&k), 43)), None);
}

#[test]
fn stale_sequence_is_silently_dropped() {
    let k = keys(HashAlg::Sha1);
    let prot = Protection {
        alg: HashAlg::Sha1,
        k1: k.k1(),
        aes_key: k.aes_key(),
    };
    let wire = packet::encode_v20(PayloadType::Ipmi, 1, 5, &[0xaa; 8], Some(&prot));
    let mut c = ctx(Some(&k), 1);
    c.last_remote_sequence = Some(6);
    assert_eq!(packet::decode(&wire, &c), None);
    // Rollover allowance: a saturated remote counter may restart.
    c.last_remote_sequence = Some(0xffff_ffff);
    assert!(packet::decode(&wire, &c).is_some());
}

#[test]
fn login_phase_payloads_decode_without_keys() {
    let body = vec![0x01, 0x00, 0x00, 0x00];
    let wire = packet::encode_v20(PayloadType::OpenSessionResponse, 0, 0, &body, None);
    match packet::decode(&wire, &ctx(None, 0)) {
        Some(Inbound::Rakp { ptype, body: got }) => {
            assert_eq!(ptype, PayloadType::OpenSessionResponse);
            assert_eq!(got, body);
        }
        other => panic!("decode failed: {other:?}"),
    }
}

#[test]
fn v15_md5_round_trip() {
    let payload = [0x81u8, 0x1c, 0x63, 0x20, 0x00, 0x38, 0x00, 0x01];
    let code = md5_authcode(b"admin", 0x1020_3040, 7, &payload).unwrap();
    let wire = packet::encode_v15(2, 7, 0x1020_3040, Some(&code), &payload);

    let c = InboundCtx {
        localsid: 0,
        keys: None,
        v15_authtype: 2,
        v15_session_id: 0x1020_3040,
        password: b"admin",
        last_remote_sequence: None,
    };
    match packet::decode(&wire, &c) {
        Some(Inbound::Ipmi { sequence, payload: got }) => {
            assert_eq!(sequence, 7);
            assert_eq!(got, payload);
        }
        other => panic!("decode failed: {other:?}"),
    }

    // A wrong password must drop the packet, not surface an error.
    let mut bad = c;
    bad.password = b"hunter2";
    assert_eq!(packet::decode(&wire, &bad), None);
}

#[test]
fn session_traffic_without_integrity_bit_is_dropped() {
    // Hand-build a 2.0 IPMI packet with the integrity bit clear.
    let mut wire = vec![0x06, 0x00, 0xff, 0x07, 0x06, 0x00];
    wire.extend_from_slice(&1u32.to_le_bytes());
    wire.extend_from_slice(&1u32.to_le_bytes());
    wire.extend_from_slice(&2u16.to_le_bytes());
    wire.extend_from_slice(&[0xaa, 0xbb]);
    let k = keys(HashAlg::Sha1);
    assert_eq!(packet::decode(&wire, &ctx(Some(&k), 1)), None);
}
