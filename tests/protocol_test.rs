use mcplink::protocol::{
    codes, CapabilityFlags, ClientCapabilities, JsonRpcRequest, JsonRpcResponse, RequestId,
    ServerCapabilities, ServerMessage, ServerNotification, ServerRequest,
};
use mcplink::ProtocolError;
use serde_json::json;

#[test]
fn request_ids_parse_as_string_or_number() {
    let n: RequestId = serde_json::from_value(json!(7)).unwrap();
    assert_eq!(n, RequestId::Number(7));
    assert_eq!(n.as_number(), Some(7));

    let s: RequestId = serde_json::from_value(json!("abc")).unwrap();
    assert_eq!(s, RequestId::String("abc".to_string()));
    assert_eq!(s.as_number(), None);

    // Shapes round-trip untouched.
    assert_eq!(serde_json::to_value(&n).unwrap(), json!(7));
    assert_eq!(serde_json::to_value(&s).unwrap(), json!("abc"));
}

#[test]
fn request_envelope_omits_absent_fields() {
    let request = JsonRpcRequest::new(1.into(), "tools/list", None);
    let raw = serde_json::to_value(&request).unwrap();
    assert_eq!(raw, json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }));

    let notification = JsonRpcRequest::notification("notifications/initialized", None);
    assert!(notification.is_notification());
    let raw = serde_json::to_value(&notification).unwrap();
    assert_eq!(
        raw,
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
    );
}

#[test]
fn response_envelopes_carry_result_or_error() {
    let ok = JsonRpcResponse::success(1.into(), json!({"x": 1}));
    let raw = serde_json::to_value(&ok).unwrap();
    assert_eq!(raw, json!({ "jsonrpc": "2.0", "id": 1, "result": {"x": 1} }));

    let err = JsonRpcResponse::error(2.into(), ProtocolError::new(codes::METHOD_NOT_FOUND, "nope"));
    let raw = serde_json::to_value(&err).unwrap();
    assert_eq!(
        raw,
        json!({ "jsonrpc": "2.0", "id": 2, "error": { "code": -32601, "message": "nope" } })
    );
}

#[test]
fn classify_separates_the_three_shapes() {
    let request = ServerMessage::classify(json!({
        "jsonrpc": "2.0", "id": 5, "method": "ping",
    }))
    .unwrap();
    assert!(matches!(request, ServerMessage::Request(_)));

    let response = ServerMessage::classify(json!({
        "jsonrpc": "2.0", "id": 5, "result": {},
    }))
    .unwrap();
    assert!(matches!(response, ServerMessage::Response(_)));

    let notification = ServerMessage::classify(json!({
        "jsonrpc": "2.0", "method": "notifications/progress", "params": {},
    }))
    .unwrap();
    assert!(matches!(notification, ServerMessage::Notification(_)));
}

#[test]
fn classify_rejects_shapeless_messages() {
    let err = ServerMessage::classify(json!({ "jsonrpc": "2.0" })).unwrap_err();
    assert_eq!(err.code, codes::INVALID_REQUEST);
    // A null id does not make a response.
    let err = ServerMessage::classify(json!({ "jsonrpc": "2.0", "id": null })).unwrap_err();
    assert_eq!(err.code, codes::INVALID_REQUEST);
}

#[test]
fn server_requests_parse_by_method() {
    assert!(matches!(ServerRequest::parse("ping", None), ServerRequest::Ping));
    assert!(matches!(
        ServerRequest::parse("roots/list", None),
        ServerRequest::RootsList
    ));
    assert!(matches!(
        ServerRequest::parse("sampling/createMessage", Some(json!({"messages": []}))),
        ServerRequest::SamplingCreateMessage(_)
    ));
    assert!(matches!(
        ServerRequest::parse("tools/strange", None),
        ServerRequest::Other(_)
    ));
}

#[test]
fn server_notifications_parse_by_method() {
    match ServerNotification::parse("notifications/cancelled", Some(json!({"requestId": 9}))) {
        ServerNotification::Cancelled { request_id } => {
            assert_eq!(request_id, Some(RequestId::Number(9)));
        }
        other => panic!("unexpected {other:?}"),
    }
    match ServerNotification::parse(
        "notifications/progress",
        Some(json!({"progressToken": "t1", "progress": 5})),
    ) {
        ServerNotification::Progress { token, .. } => assert_eq!(token, Some(json!("t1"))),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        ServerNotification::parse("notifications/tools/list_changed", None),
        ServerNotification::ToolsListChanged
    ));
    match ServerNotification::parse(
        "notifications/resources/updated",
        Some(json!({"uri": "mem://1"})),
    ) {
        ServerNotification::ResourcesUpdated { uri } => assert_eq!(uri.as_deref(), Some("mem://1")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        ServerNotification::parse("notifications/unheard_of", None),
        ServerNotification::Other(_)
    ));
}

#[test]
fn capability_flags_pack_the_advertised_surface() {
    let caps: ServerCapabilities = serde_json::from_value(json!({
        "logging": {},
        "tools": { "listChanged": true },
        "resources": { "subscribe": true },
    }))
    .unwrap();
    let flags = CapabilityFlags::from_capabilities(&caps);

    assert!(flags.contains(CapabilityFlags::LOGGING));
    assert!(flags.contains(CapabilityFlags::TOOLS | CapabilityFlags::TOOLS_LIST_CHANGED));
    assert!(flags.contains(CapabilityFlags::RESOURCES | CapabilityFlags::RESOURCES_SUBSCRIBE));
    assert!(!flags.contains(CapabilityFlags::PROMPTS));
    assert!(!flags.contains(CapabilityFlags::RESOURCES_LIST_CHANGED));

    assert_eq!(
        flags.to_string(),
        "logging|resources|resources.subscribe|tools|tools.listChanged"
    );
    assert_eq!(CapabilityFlags::NONE.to_string(), "none");
}

#[test]
fn capability_flags_survive_a_storage_round_trip() {
    let flags = CapabilityFlags::TOOLS | CapabilityFlags::LOGGING;
    let raw = serde_json::to_value(flags).unwrap();
    // Transparent u32, cheap to persist and compare.
    assert_eq!(raw, json!(flags.0));
    let back: CapabilityFlags = serde_json::from_value(raw).unwrap();
    assert_eq!(back, flags);
}

#[test]
fn client_capabilities_advertise_handlers_conditionally() {
    let bare = serde_json::to_value(ClientCapabilities::new(false, false)).unwrap();
    assert_eq!(bare, json!({ "roots": { "listChanged": true } }));

    let full = serde_json::to_value(ClientCapabilities::new(true, true)).unwrap();
    assert_eq!(full["sampling"], json!({}));
    assert_eq!(full["elicitation"], json!({ "form": {}, "url": {} }));
}

#[test]
fn url_elicitation_shape_requires_reserved_code_and_url() {
    let yes = ProtocolError::new(-32001, "auth").with_data(json!({"url": "https://x"}));
    assert!(yes.is_url_elicitation_required());

    // Wrong code range.
    let no = ProtocolError::new(-32601, "auth").with_data(json!({"url": "https://x"}));
    assert!(!no.is_url_elicitation_required());
    // Reserved code but no url in data.
    let no = ProtocolError::new(-32001, "auth").with_data(json!({"hint": "open browser"}));
    assert!(!no.is_url_elicitation_required());
    let no = ProtocolError::new(-32001, "auth");
    assert!(!no.is_url_elicitation_required());
}
