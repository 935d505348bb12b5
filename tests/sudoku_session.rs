//! End-to-end handshake and session tests over in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use sudoku::common::{Address, SudokuError};
use sudoku::proxy::mux::MuxConfig;
use sudoku::proxy::transport::sudoku::kip::{FEATURE_MULTIPLEX, FEATURE_UDP_OVER_TCP};
use sudoku::proxy::transport::sudoku::uot::{read_datagram, start_uot_client, write_datagram};
use sudoku::proxy::transport::sudoku::{
    accept_multiplex_server, client_handshake, server_handshake, server_handshake_with_fallback,
    start_multiplex_client, write_tcp_preface, AeadMethod, SessionType, SudokuConfig, Table,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn table(key: &str, pattern: &str) -> Arc<Table> {
    Arc::new(Table::new(key, "prefer_entropy", pattern).unwrap())
}

fn basic_config() -> SudokuConfig {
    let mut cfg = SudokuConfig::new("k", vec![table("k", "")]);
    cfg.method = AeadMethod::ChaCha20Poly1305;
    cfg.padding_min = 0;
    cfg.padding_max = 0;
    cfg.enable_pure_downlink = true;
    cfg
}

#[tokio::test]
async fn tcp_session_echo() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server_cfg = basic_config();
    let server = tokio::spawn(async move {
        let mut session = server_handshake(Box::new(b), &server_cfg).await.unwrap();
        assert_eq!(session.session_type, SessionType::Tcp);
        let target = session.target.clone().unwrap();
        let mut buf = [0u8; 3];
        session.stream.read_exact(&mut buf).await.unwrap();
        session.stream.write_all(&buf).await.unwrap();
        session.stream.flush().await.unwrap();
        target
    });

    let mut stream = client_handshake(Box::new(a), &basic_config()).await.unwrap();
    let target: Address = "93.184.216.34:80".parse().unwrap();
    write_tcp_preface(&mut stream, &target).await.unwrap();
    stream.write_all(&[1, 2, 3]).await.unwrap();
    stream.flush().await.unwrap();

    let mut echo = [0u8; 3];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [1, 2, 3]);
    assert_eq!(server.await.unwrap(), target);
}

#[tokio::test]
async fn packed_downlink_with_padding_and_key_rotation() {
    let mut cfg = SudokuConfig::new("bulk", vec![table("bulk", "xpxvvpvv")]);
    cfg.method = AeadMethod::Aes128Gcm;
    cfg.padding_min = 10;
    cfg.padding_max = 40;
    cfg.enable_pure_downlink = false;
    cfg.key_update_after_bytes = 8 * 1024;
    cfg.disable_http_mask = true;

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let server_cfg = cfg.clone();
    let server = tokio::spawn(async move {
        let mut session = server_handshake(Box::new(b), &server_cfg).await.unwrap();
        let mut got = vec![0u8; expected.len()];
        session.stream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        // 下行（packed）回送同样的数据
        session.stream.write_all(&got).await.unwrap();
        session.stream.flush().await.unwrap();
        session
    });

    let mut stream = client_handshake(Box::new(a), &cfg).await.unwrap();
    write_tcp_preface(&mut stream, &"example.org:443".parse().unwrap()).await.unwrap();
    stream.write_all(&payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut back = vec![0u8; payload.len()];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(back, payload);
    let _session = server.await.unwrap();
}

#[tokio::test]
async fn downlink_mode_mismatch_is_rejected() {
    let client_cfg = basic_config();
    let mut server_cfg = basic_config();
    server_cfg.enable_pure_downlink = false;

    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { server_handshake(Box::new(b), &server_cfg).await });
    let _client = client_handshake(Box::new(a), &client_cfg).await.unwrap();
    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, SudokuError::DownlinkMismatch { .. }));
}

#[tokio::test]
async fn forward_secrecy_negotiates_features() {
    let mut cfg = SudokuConfig::new("fs-key", vec![table("fs-key", "")]);
    cfg.enable_forward_secrecy = true;
    cfg.features = FEATURE_MULTIPLEX | FEATURE_UDP_OVER_TCP;

    let mut server_cfg = cfg.clone();
    server_cfg.features = FEATURE_MULTIPLEX;

    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let mut session = server_handshake(Box::new(b), &server_cfg).await.unwrap();
        let mut buf = [0u8; 5];
        session.stream.read_exact(&mut buf).await.unwrap();
        session.stream.write_all(b"world").await.unwrap();
        session.stream.flush().await.unwrap();
        (session.features, buf)
    });

    let mut stream = client_handshake(Box::new(a), &cfg).await.unwrap();
    write_tcp_preface(&mut stream, &"10.1.2.3:22".parse().unwrap()).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    let (features, got) = server.await.unwrap();
    assert_eq!(features, FEATURE_MULTIPLEX);
    assert_eq!(&got, b"hello");
}

#[tokio::test]
async fn server_picks_client_table_among_candidates() {
    let key = "rotating";
    let patterns = ["", "xpxvvpvv", "vxpvxvvp"];
    let server_cfg = SudokuConfig::new(key, patterns.iter().map(|p| table(key, p)).collect());

    for pattern in patterns {
        let client_cfg = SudokuConfig::new(key, vec![table(key, pattern)]);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = server_cfg.clone();
        let server = tokio::spawn(async move {
            let mut session = server_handshake(Box::new(b), &cfg).await.unwrap();
            let mut buf = [0u8; 4];
            session.stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut stream = client_handshake(Box::new(a), &client_cfg).await.unwrap();
        write_tcp_preface(&mut stream, &"1.1.1.1:53".parse().unwrap()).await.unwrap();
        stream.write_all(b"rota").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(&server.await.unwrap(), b"rota");
    }
}

#[tokio::test]
async fn udp_over_tcp_session() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server_cfg = basic_config();
    let server = tokio::spawn(async move {
        let mut session = server_handshake(Box::new(b), &server_cfg).await.unwrap();
        assert_eq!(session.session_type, SessionType::UdpOverTcp);
        assert!(session.target.is_none());
        let (addr, payload) = read_datagram(&mut session.stream).await.unwrap().unwrap();
        write_datagram(&mut session.stream, &addr, &payload).await.unwrap();
        session
    });

    let mut stream = client_handshake(Box::new(a), &basic_config()).await.unwrap();
    start_uot_client(&mut stream).await.unwrap();
    let dns: Address = "8.8.4.4:53".parse().unwrap();
    write_datagram(&mut stream, &dns, b"\x12\x34query").await.unwrap();

    let (addr, payload) = read_datagram(&mut stream).await.unwrap().unwrap();
    assert_eq!(addr, dns);
    assert_eq!(payload, b"\x12\x34query");
    let _session = server.await.unwrap();
}

#[tokio::test]
async fn multiplex_session_carries_independent_streams() {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let server_cfg = basic_config();
    let server = tokio::spawn(async move {
        let session = server_handshake(Box::new(b), &server_cfg).await.unwrap();
        assert_eq!(session.session_type, SessionType::Multiplex);
        let mux = accept_multiplex_server(session.stream, MuxConfig::default());
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let (mut stream, target) = mux.accept_tcp().await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut body = Vec::new();
                stream.read_to_end(&mut body).await.unwrap();
                body.extend_from_slice(target.to_string().as_bytes());
                stream.write_all(&body).await.unwrap();
                stream.shutdown().await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        mux
    });

    let stream = client_handshake(Box::new(a), &basic_config()).await.unwrap();
    let client = start_multiplex_client(stream, MuxConfig::default()).await.unwrap();
    let mut handles = Vec::new();
    let client = Arc::new(client);
    for i in 0..3u8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let target: Address = format!("10.0.0.{}:80", i + 1).parse().unwrap();
            let mut s = client.open_tcp(&target).await.unwrap();
            let body = vec![i; 10_000 * (i as usize + 1)];
            s.write_all(&body).await.unwrap();
            s.shutdown().await.unwrap();
            let mut reply = Vec::new();
            s.read_to_end(&mut reply).await.unwrap();
            let mut expected = body;
            expected.extend_from_slice(target.to_string().as_bytes());
            assert_eq!(reply, expected);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let _mux = server.await.unwrap();
}

#[tokio::test]
async fn garbage_is_handed_back_for_fallback() {
    let mut cfg = basic_config();
    cfg.handshake_timeout = Duration::from_millis(300);
    let (mut a, b) = tokio::io::duplex(64 * 1024);

    let probe = b"GET /index.html HTTP/1.1\r\nHost: decoy\r\n\r\nnot sudoku at all".to_vec();
    a.write_all(&probe).await.unwrap();

    let rejection = server_handshake_with_fallback(Box::new(b), &cfg).await.unwrap_err();
    let fallback = rejection.fallback.expect("pre-auth failure keeps the connection");
    assert_eq!(fallback.replay, probe);

    // 原始连接仍然可用
    let mut raw = fallback.stream;
    a.write_all(b"more").await.unwrap();
    let mut buf = [0u8; 4];
    raw.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"more");
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let client_cfg = SudokuConfig::new("other", vec![table("k", "")]);
    let mut server_cfg = basic_config();
    server_cfg.handshake_timeout = Duration::from_millis(500);

    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { server_handshake_with_fallback(Box::new(b), &server_cfg).await });
    let _ = client_handshake(Box::new(a), &client_cfg).await;
    let rejection = server.await.unwrap().unwrap_err();
    assert!(matches!(rejection.error, SudokuError::DecryptFailed));
    assert!(rejection.fallback.is_some());
}
