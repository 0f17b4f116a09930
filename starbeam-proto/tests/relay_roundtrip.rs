use k9::assert_equal;
use starbeam_proto::relay::*;

#[test]
fn test_register_serialization() {
    let original = RelayMessage::Register(RegisterMessage {
        hostname: "gamer-rig".to_string(),
        unique_id: "gamer-rig_1234".to_string(),
        auth_key: "secret".to_string(),
        host_id: None,
        capabilities: HostCapabilities {
            video_codecs: vec!["H264".to_string(), "HEVC".to_string(), "AV1".to_string()],
            audio_codecs: vec!["opus".to_string()],
            ..Default::default()
        },
    });

    let json = original.to_json().unwrap();
    let decoded = RelayMessage::from_json(&json).unwrap();
    assert_equal!(decoded, original);

    // Optional fields are omitted from the wire form entirely.
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_equal!(value["type"], "register");
    assert!(value.get("host_id").is_none());
    assert!(value["capabilities"].get("max_width").is_none());
    assert_equal!(value["capabilities"]["audio_codecs"][0], "opus");
}

#[test]
fn test_register_ack_parsing() {
    let json = r#"{
        "type": "register_ack",
        "host_id": "h1",
        "ports": {"http": 10, "https": 11, "rtsp": 12, "video": 13, "audio": 14, "control": 15},
        "external_address": "203.0.113.7"
    }"#;

    let msg = RelayMessage::from_json(json).unwrap();
    let RelayMessage::RegisterAck(ack) = msg else {
        panic!("expected register_ack, got {:?}", msg);
    };
    assert_equal!(ack.host_id, "h1");
    assert_equal!(ack.ports.http, 10);
    assert_equal!(ack.ports.video, 13);
    assert_equal!(ack.ports.control, 15);
    assert_equal!(ack.external_address.as_deref(), Some("203.0.113.7"));
}

#[test]
fn test_http_request_defaults() {
    // query, headers, body and is_https are all optional on the wire.
    let json = r#"{"type":"http_request","id":7,"method":"GET","path":"/x","client_addr":"1.2.3.4"}"#;

    let msg = RelayMessage::from_json(json).unwrap();
    let RelayMessage::HttpRequest(req) = msg else {
        panic!("expected http_request");
    };
    assert_equal!(req.id, 7);
    assert_equal!(req.query, None);
    assert_equal!(req.headers.len(), 0);
    assert_equal!(req.body, None);
    assert_equal!(req.is_https, false);
}

#[test]
fn test_http_response_serialization() {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());

    let resp = RelayMessage::HttpResponse(HttpResponseMessage {
        id: 7,
        status: 200,
        headers,
        body: Some("hi".to_string()),
    });

    let value: serde_json::Value = serde_json::from_str(&resp.to_json().unwrap()).unwrap();
    assert_equal!(value["type"], "http_response");
    assert_equal!(value["id"], 7);
    assert_equal!(value["status"], 200);
    assert_equal!(value["headers"]["Content-Type"], "text/plain");
    assert_equal!(value["body"], "hi");
}

#[test]
fn test_rtsp_roundtrip() {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("CSeq".to_string(), "2".to_string());

    let original = RelayMessage::RtspResponse(RtspResponseMessage {
        id: 3,
        status: 200,
        reason: "OK".to_string(),
        headers,
        body: None,
    });

    let json = original.to_json().unwrap();
    let decoded = RelayMessage::from_json(&json).unwrap();
    assert_equal!(decoded, original);

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value.get("body").is_none());
}

#[test]
fn test_udp_channel_setup_parsing() {
    let json = r#"{"type":"udp_channel_setup","session_id":1,"channel":"video","client_addr":"1.2.3.4"}"#;
    let msg = RelayMessage::from_json(json).unwrap();
    let RelayMessage::UdpChannelSetup(setup) = msg else {
        panic!("expected udp_channel_setup");
    };
    assert_equal!(setup.session_id, 1);
    assert_equal!(setup.channel, ChannelKind::Video);
}

#[test]
fn test_udp_channel_ack_wire_form() {
    let ack = RelayMessage::UdpChannelAck(UdpChannelAckMessage {
        session_id: 1,
        channel: ChannelKind::Audio,
        relay_port: 14,
        local_port: 40123,
    });

    let value: serde_json::Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
    assert_equal!(value["type"], "udp_channel_ack");
    assert_equal!(value["channel"], "audio");
    assert_equal!(value["relay_port"], 14);
    assert_equal!(value["local_port"], 40123);
}

#[test]
fn test_ping_pong_ts_echo() {
    let msg = RelayMessage::from_json(r#"{"type":"ping","ts":42}"#).unwrap();
    let RelayMessage::Ping(ping) = msg else {
        panic!("expected ping");
    };

    let pong = RelayMessage::Pong(PongMessage { ts: ping.ts });
    assert_equal!(pong.to_json().unwrap(), r#"{"type":"pong","ts":42}"#);
}

#[test]
fn test_session_end_reason_omitted() {
    let msg = RelayMessage::SessionEnd(SessionEndMessage {
        session_id: 9,
        reason: None,
    });
    assert_equal!(msg.to_json().unwrap(), r#"{"type":"session_end","session_id":9}"#);

    let msg = RelayMessage::SessionEnd(SessionEndMessage {
        session_id: 9,
        reason: Some("client gone".to_string()),
    });
    let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
    assert_equal!(value["reason"], "client gone");
}

#[test]
fn test_unknown_type_is_tolerated() {
    let msg = RelayMessage::from_json(r#"{"type":"never_heard_of_it","whatever":1}"#).unwrap();
    assert_equal!(msg, RelayMessage::Unknown);

    // Enumerated but unused types also parse without payloads we care about.
    let msg = RelayMessage::from_json(r#"{"type":"udp_channel_close","session_id":1}"#).unwrap();
    assert_equal!(msg, RelayMessage::UdpChannelClose);
}

#[test]
fn test_malformed_json_is_an_error() {
    assert!(RelayMessage::from_json("{not json").is_err());
    assert!(RelayMessage::from_json(r#"{"no_type_field":true}"#).is_err());
}
