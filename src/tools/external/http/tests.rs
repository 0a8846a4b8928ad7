use super::*;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn initialize_and_list_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": { "protocolVersion": "2024-11-05", "capabilities": {} }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": { "tools": [
                { "name": "lookup", "description": "Looks things up",
                  "inputSchema": { "type": "object" } }
            ] }
        })))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(server.uri());
    client.initialize().await.unwrap();
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "lookup");
}

#[tokio::test]
async fn call_tool_collects_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "tools/call" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {
                "content": [
                    { "type": "text", "text": "line one" },
                    { "type": "text", "text": "line two" }
                ],
                "isError": false
            }
        })))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(server.uri());
    let (output, is_error) = client.call_tool("lookup", json!({ "q": "x" })).await.unwrap();
    assert_eq!(output, "line one\nline two");
    assert!(!is_error);
}

#[tokio::test]
async fn jsonrpc_error_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32601, "message": "method not found" }
        })))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(server.uri());
    let err = client.initialize().await.unwrap_err();
    assert!(err.to_string().contains("method not found"));
}
