//! Integration tests for `RequestExecutor` using wiremock.

use std::sync::Arc;
use std::time::Duration;

use assert2::{check, let_assert};
use rigging::{
    DiscoveredEndpoint, DiscoveryMode, Error, Method, Operation, Request, RequestContext,
    RequestExecutor,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

fn context(operation: Operation, server: &MockServer, route: &str) -> RequestContext {
    let url = url::Url::parse(&format!("{}{route}", server.uri())).expect("url");
    let request = Request::builder(Method::POST, url)
        .header("X-Amz-Target", format!("DynamoDB_20120810.{}", operation.name()))
        .json(&serde_json::json!({"Limit": 10}))
        .expect("json body")
        .build();
    RequestContext::new(Arc::new(operation), request)
}

#[tokio::test]
async fn test_successful_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("X-Amz-Target", "DynamoDB_20120810.ListTables"))
        .and(body_json(serde_json::json!({"Limit": 10})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"TableNames": ["users"]})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let executor = RequestExecutor::builder().build().expect("executor");
    let response = executor
        .call(context(Operation::new("ListTables"), &mock_server, "/"))
        .await
        .expect("response");

    check!(response.status() == 200);
    let body: serde_json::Value = response.json().expect("json");
    check!(body["TableNames"][0] == "users");
}

#[tokio::test]
async fn test_server_errors_retried_up_to_limit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let executor = RequestExecutor::builder()
        .retry_limit(2)
        .retry_base_delay(Duration::from_millis(5))
        .build()
        .expect("executor");

    let result = executor
        .call(context(Operation::new("ListTables"), &mock_server, "/"))
        .await;

    let_assert!(Err(err) = result);
    check!(err.status() == Some(503));
    check!(err.code() == Some("Http503Error"));
}

#[tokio::test]
async fn test_throttling_recovers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-amzn-errortype", "ThrottlingException")
                .set_body_json(serde_json::json!({"message": "Rate exceeded"})),
        )
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let executor = RequestExecutor::builder()
        .retry_base_delay(Duration::from_millis(5))
        .build()
        .expect("executor");

    let response = executor
        .call(context(Operation::new("PutItem"), &mock_server, "/"))
        .await
        .expect("recovered");
    check!(response.status() == 200);
}

#[tokio::test]
async fn test_client_errors_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-amzn-errortype", "ValidationException:http://internal.example.com/")
                .set_body_json(serde_json::json!({"message": "1 validation error detected"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let executor = RequestExecutor::builder().build().expect("executor");
    let result = executor
        .call(context(Operation::new("PutItem"), &mock_server, "/"))
        .await;

    let_assert!(Err(err) = result);
    check!(err.code() == Some("ValidationException"));
    check!(err.message() == Some("1 validation error detected"));
}

#[tokio::test]
async fn test_required_discovery_redirects() {
    let default_server = MockServer::start().await;
    let discovered_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&default_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Item": {}})))
        .expect(2)
        .mount(&discovered_server)
        .await;

    let address = discovered_server.uri();
    let executor = RequestExecutor::builder()
        .endpoint_discovery(true)
        .discover(move |_ctx: RequestContext| {
            let address = address.clone();
            async move {
                Ok::<_, Error>(vec![DiscoveredEndpoint::new(
                    address,
                    Duration::from_secs(60),
                )])
            }
        })
        .build()
        .expect("executor");

    let operation = || Operation::new("GetItem").with_discovery(DiscoveryMode::Required);
    for _ in 0..2 {
        let response = executor
            .call(context(operation(), &default_server, "/"))
            .await
            .expect("response");
        check!(response.status() == 200);
    }
    check!(executor.endpoint_cache().len() == 1);
}

#[tokio::test]
async fn test_required_discovery_disabled() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let executor = RequestExecutor::builder()
        .discover(|_ctx: RequestContext| async {
            Ok::<_, Error>(Vec::<DiscoveredEndpoint>::new())
        })
        .build()
        .expect("executor");

    let operation = Operation::new("GetItem").with_discovery(DiscoveryMode::Required);
    let result = executor.call(context(operation, &mock_server, "/")).await;

    let_assert!(Err(Error::EndpointDiscovery(_)) = result);
}
