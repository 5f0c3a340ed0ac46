use std::time::Duration;

use compliance_research::gateway::Attribution;
use compliance_research::research::{OutcomeStatus, SearchExecutor, SearchMode, SearchTask};
use compliance_research::search::{SearchError, SearchProvider, SearchRequest, SonarAdapter};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> SonarAdapter {
    SonarAdapter::with_config("pplx-test", server.uri(), "sonar-pro", Duration::from_secs(5))
        .unwrap()
}

fn answer(content: &str, citations: &[&str]) -> serde_json::Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "citations": citations,
    })
}

#[tokio::test]
async fn scoped_search_sends_domain_filter_and_returns_citations() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer pplx-test"))
        .and(body_partial_json(json!({
            "model": "sonar-pro",
            "search_domain_filter": ["fda.gov", "cbp.gov"],
            "messages": [
                {"role": "system", "content": "search carefully"},
                {"role": "user", "content": "honey import rules"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer(
            "Register the facility [1].",
            &["https://www.fda.gov/food/registration"],
        )))
        .expect(1)
        .mount(&server)
        .await;

    let req = SearchRequest::new("honey import rules", "search carefully")
        .scoped(vec!["fda.gov".into(), "cbp.gov".into()]);
    let resp = adapter(&server).search(req).await.unwrap();

    assert_eq!(resp.content, "Register the facility [1].");
    assert_eq!(resp.citations, vec!["https://www.fda.gov/food/registration"]);
}

#[tokio::test]
async fn unscoped_search_omits_filter_and_schema() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("prose", &[])))
        .mount(&server)
        .await;

    adapter(&server)
        .search(SearchRequest::new("q", "p"))
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body.get("search_domain_filter").is_none());
    assert!(body.get("response_format").is_none());
}

#[tokio::test]
async fn structured_search_requests_schema_and_normalizes_records() {
    let server = MockServer::start().await;
    let structured = json!({
        "certifications": [{
            "certificate_name": "Food Facility Registration",
            "certificate_description": "Registration of the producing facility",
            "legal_regulation": "21 CFR 1.225",
            "legal_text_excerpt": "must register",
            "legal_text_meaning": "register before shipping",
            "registration_fee": "none",
            "is_required": true
        }]
    })
    .to_string();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": {"type": "json_schema"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer(&structured, &[])))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .search(SearchRequest::new("honey certifications", "list them").structured(true))
        .await
        .unwrap();

    let records: serde_json::Value = serde_json::from_str(&resp.content).unwrap();
    assert!(records.is_array());
    assert_eq!(records[0]["legal_regulation"], "21 CFR 1.225");
    assert_eq!(records[0]["is_required"], true);
    // Pretty-printed array, not the wrapper object.
    assert!(resp.content.starts_with("[\n"));
}

#[tokio::test]
async fn structured_answer_off_schema_keeps_raw_text() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("Just some prose.", &[])))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .search(SearchRequest::new("q", "p").structured(true))
        .await
        .unwrap();
    assert_eq!(resp.content, "Just some prose.");
}

#[tokio::test]
async fn error_statuses_are_typed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{"content": "p"}, {"content": "limited"}]})))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{"content": "p"}, {"content": "broken"}]})))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{"content": "p"}, {"content": "empty"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let a = adapter(&server);
    assert!(matches!(
        a.search(SearchRequest::new("limited", "p")).await,
        Err(SearchError::RateLimited)
    ));
    match a.search(SearchRequest::new("broken", "p")).await {
        Err(SearchError::Status { status, message }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "bad gateway");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(matches!(
        a.search(SearchRequest::new("empty", "p")).await,
        Err(SearchError::Malformed(_))
    ));
}

#[tokio::test]
async fn executor_isolates_a_slow_provider_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{}, {"content": "slow"}]})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(answer("late", &[]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{}, {"content": "fast"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer(
            "See https://www.fda.gov/honey.",
            &["https://www.fda.gov/honey"],
        )))
        .mount(&server)
        .await;

    let provider = adapter(&server);
    let tasks = vec![
        SearchTask::unscoped("slow"),
        SearchTask::scoped("fast", vec!["fda.gov".into()]),
    ];
    let out = SearchExecutor::new(&provider)
        .with_timeout(Duration::from_millis(300))
        .execute(&tasks, SearchMode::Search, &Attribution::new("test"))
        .await;

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].status, OutcomeStatus::Timeout);
    assert!(out[0].content.is_empty());
    assert_eq!(out[1].status, OutcomeStatus::Success);
    assert_eq!(out[1].links, vec!["https://www.fda.gov/honey".to_string()]);
    assert_eq!(out[1].citations, vec!["https://www.fda.gov/honey".to_string()]);
}
