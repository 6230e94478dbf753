mod common;

use std::time::Duration;

use common::{reference, CollectingSink};
use pretty_assertions::assert_eq;
use relink_engine::{
    fetch_all, FailureKind, FetchSettings, Fetcher, PipelineEvent, ReqwestFetcher, RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_jitter: Duration::ZERO,
        ..RetryPolicy::default()
    }
}

fn settings() -> FetchSettings {
    FetchSettings {
        retry: quick_retry(),
        ..FetchSettings::default()
    }
}

#[tokio::test]
async fn fetcher_captures_bytes_mime_and_filename() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/Annual%20Report.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(b"%PDF-1.7 payload".to_vec(), "application/pdf"),
        )
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(settings());
    let url = format!("{}/files/Annual%20Report.pdf", server.uri());
    let content = fetcher.fetch(&reference(&url)).await.expect("fetch ok");

    assert_eq!(content.bytes.as_ref(), b"%PDF-1.7 payload");
    assert_eq!(content.byte_size, 16);
    assert_eq!(content.mime_type, "application/pdf");
    assert_eq!(content.suggested_filename, "Annual Report.pdf");
    assert!(content.integrity_hash.is_none());
}

#[tokio::test]
async fn digest_is_computed_on_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"abc".to_vec(), "application/pdf"))
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings {
        compute_digest: true,
        ..settings()
    });
    let url = format!("{}/doc.pdf", server.uri());
    let content = fetcher.fetch(&reference(&url)).await.expect("fetch ok");

    // sha256("abc")
    assert_eq!(
        content.integrity_hash.as_deref(),
        Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
}

#[tokio::test]
async fn batch_isolates_a_terminal_404() {
    // Three references, the second answers 404: two successes, one failure
    // that spent no retries.
    let server = MockServer::start().await;
    for good in ["/one.pdf", "/three.pdf"] {
        Mock::given(method("GET"))
            .and(path(good))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"ok".to_vec(), "application/pdf"))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/two.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let references = [
        reference(&format!("{}/one.pdf", server.uri())),
        reference(&format!("{}/two.pdf", server.uri())),
        reference(&format!("{}/three.pdf", server.uri())),
    ];
    let fetcher = ReqwestFetcher::new(settings());
    let sink = CollectingSink::new();
    let batch = fetch_all(
        &fetcher,
        &references,
        &settings(),
        &CancellationToken::new(),
        &sink,
    )
    .await;

    assert_eq!(batch.fetched.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    let failure = &batch.failures[0];
    assert_eq!(failure.status_code, Some(404));
    assert_eq!(failure.retry_attempts, 0);
    assert_eq!(failure.error.kind, FailureKind::HttpStatus(404));

    // One progress event per completion.
    let progress: Vec<_> = sink
        .take()
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::Progress(_)))
        .collect();
    assert_eq!(progress.len(), 3);
    if let Some(PipelineEvent::Progress(last)) = progress.last() {
        assert_eq!(last.completed, 2);
        assert_eq!(last.failed, 1);
        assert_eq!(last.total, 3);
        assert_eq!(last.bytes, 4);
    }
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"ok".to_vec(), "application/pdf"))
        .mount(&server)
        .await;

    let references = [reference(&format!("{}/flaky.pdf", server.uri()))];
    let fetcher = ReqwestFetcher::new(settings());
    let batch = fetch_all(
        &fetcher,
        &references,
        &settings(),
        &CancellationToken::new(),
        &common::CollectingSink::new(),
    )
    .await;

    assert_eq!(batch.fetched.len(), 1);
    assert_eq!(batch.failures.len(), 0);
}

#[tokio::test]
async fn rate_limiting_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy.pdf"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"ok".to_vec(), "application/pdf"))
        .mount(&server)
        .await;

    let references = [reference(&format!("{}/busy.pdf", server.uri()))];
    let fetcher = ReqwestFetcher::new(settings());
    let batch = fetch_all(
        &fetcher,
        &references,
        &settings(),
        &CancellationToken::new(),
        &common::CollectingSink::new(),
    )
    .await;

    assert_eq!(batch.fetched.len(), 1);
}

#[tokio::test]
async fn retry_budget_is_spent_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down.pdf"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let references = [reference(&format!("{}/down.pdf", server.uri()))];
    let fetcher = ReqwestFetcher::new(settings());
    let batch = fetch_all(
        &fetcher,
        &references,
        &settings(),
        &CancellationToken::new(),
        &common::CollectingSink::new(),
    )
    .await;

    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].retry_attempts, 3);
    assert_eq!(batch.failures[0].status_code, Some(500));
}

#[tokio::test]
async fn oversized_content_length_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .insert_header("Content-Length", "11")
                .set_body_string("01234567890"),
        )
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings {
        max_bytes: 10,
        ..settings()
    });
    let url = format!("{}/big.pdf", server.uri());
    let err = fetcher.fetch(&reference(&url)).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::TooLarge {
            max_bytes: 10,
            actual: Some(11)
        }
    );
    assert!(!err.kind.is_retryable());
}

#[tokio::test]
async fn oversized_streamed_body_is_rejected_without_content_length() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chunky.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 64], "application/pdf"))
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings {
        max_bytes: 32,
        ..settings()
    });
    let url = format!("{}/chunky.pdf", server.uri());
    let err = fetcher.fetch(&reference(&url)).await.unwrap_err();
    assert!(matches!(err.kind, FailureKind::TooLarge { .. }));
}

#[tokio::test]
async fn redirect_chains_beyond_the_limit_fail_terminally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop.pdf"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop.pdf"))
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(settings());
    let url = format!("{}/loop.pdf", server.uri());
    let err = fetcher.fetch(&reference(&url)).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::RedirectLimitExceeded);
    assert!(!err.kind.is_retryable());
}

#[tokio::test]
async fn slow_responses_time_out_and_classify_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(250))
                .set_body_string("slow"),
        )
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings {
        request_timeout: Duration::from_millis(50),
        retry: RetryPolicy::with_max_retries(0),
        ..FetchSettings::default()
    });
    let url = format!("{}/slow.pdf", server.uri());
    let err = fetcher.fetch(&reference(&url)).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Timeout);
    assert!(err.kind.is_retryable());
}

#[tokio::test]
async fn cancellation_aborts_in_flight_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hang.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_string("late"),
        )
        .mount(&server)
        .await;

    let references = [reference(&format!("{}/hang.pdf", server.uri()))];
    let fetcher = ReqwestFetcher::new(settings());
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();

    let fetch_settings = settings();
    let batch = tokio::join!(
        fetch_all(&fetcher, &references, &fetch_settings, &cancel, &sink),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    )
    .0;

    assert_eq!(batch.fetched.len(), 0);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].error.kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn invalid_urls_fail_terminally() {
    let fetcher = ReqwestFetcher::new(settings());
    let err = fetcher.fetch(&reference("not a url")).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::InvalidUrl);
    assert!(!err.kind.is_retryable());
}
