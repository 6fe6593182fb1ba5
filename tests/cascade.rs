mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resilient_fetch::{
    EngineConfig, FetchEngine, FetchOptions, FetchResult, FetchStrategy, StrategyContext,
    StrategyStage,
};

use common::{CannedBrowser, FixedTransport, RecordingHandler, StaticDriver, page_body};

const URL: &str = "https://shop.example.com/items";

#[tokio::test(start_paused = true)]
async fn direct_success_short_circuits_the_cascade() {
    let transport = FixedTransport::new(200, page_body());
    let driver = StaticDriver::new(page_body());
    let blocking = CannedBrowser::new(page_body());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .with_browser_driver(driver.clone())
        .with_blocking_browser(blocking.clone())
        .build()
        .unwrap();

    let result = engine.get(URL).await;

    assert!(result.success);
    assert_eq!(result.strategy, "direct");
    assert_eq!(result.status, Some(200));
    assert_eq!(transport.calls(), 1);
    assert_eq!(driver.contexts(), 0);
    assert_eq!(blocking.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn blocked_transport_escalates_to_the_browser() {
    let transport = FixedTransport::new(403, "forbidden");
    let driver = StaticDriver::new(page_body());
    let blocking = CannedBrowser::new(page_body());
    let events = Arc::new(RecordingHandler::default());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .with_browser_driver(driver.clone())
        .with_blocking_browser(blocking.clone())
        .with_event_handler(events.clone())
        .build()
        .unwrap();

    let result = engine.get(URL).await;

    assert!(result.success);
    assert_eq!(result.strategy, "browser");
    assert_eq!(result.final_url, URL);
    // one direct attempt plus the two configured rotating retries
    assert_eq!(transport.calls(), 3);
    assert_eq!(driver.contexts(), 1);
    assert_eq!(driver.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(blocking.calls(), 0);
    assert_eq!(
        events.attempts_started(),
        vec![("direct", 1), ("rotating", 1), ("rotating", 2), ("browser", 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn thin_rendered_page_falls_through_to_the_blocking_browser() {
    let transport = FixedTransport::new(503, "unavailable");
    let driver = StaticDriver::new("<html><body>loading</body></html>");
    let blocking = CannedBrowser::new(page_body());
    let engine = FetchEngine::builder()
        .with_transport(transport)
        .with_browser_driver(driver.clone())
        .with_blocking_browser(blocking.clone())
        .build()
        .unwrap();

    let result = engine.get(URL).await;

    assert!(result.success);
    assert_eq!(result.strategy, "blocking_browser");
    assert_eq!(driver.contexts(), 1);
    assert_eq!(blocking.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_cascade_reports_the_last_error() {
    let transport = FixedTransport::new(429, "slow down");
    let events = Arc::new(RecordingHandler::default());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .with_event_handler(events.clone())
        .build()
        .unwrap();

    let result = engine.get(URL).await;

    assert!(!result.success);
    assert_eq!(result.strategy, "none");
    let error = result.error.unwrap();
    assert!(error.starts_with("rotating:"), "{error}");
    assert!(error.contains("429"), "{error}");
    assert_eq!(transport.calls(), 3);
    // browser stage enabled without a driver
    assert_eq!(events.degraded(), 1);
}

#[tokio::test(start_paused = true)]
async fn block_pages_are_not_accepted_from_transport() {
    let blocked = format!(
        "<html><body>Our systems have detected unusual traffic from your network. {}</body></html>",
        "x".repeat(200)
    );
    let transport = FixedTransport::new(200, blocked);
    let engine = FetchEngine::builder()
        .with_transport(transport)
        .disable_js_rendering()
        .build()
        .unwrap();

    let result = engine.get(URL).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("unusual traffic"));
}

#[tokio::test(start_paused = true)]
async fn force_browser_skips_transport_stages() {
    let transport = FixedTransport::new(200, page_body());
    let driver = StaticDriver::new(page_body());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .with_browser_driver(driver.clone())
        .build()
        .unwrap();

    let result = engine.fetch(URL, FetchOptions::new().force_browser()).await;

    assert_eq!(result.strategy, "browser");
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn force_alternative_starts_with_rotating_retries() {
    let transport = FixedTransport::new(200, page_body());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .build()
        .unwrap();

    let result = engine
        .fetch(URL, FetchOptions::new().force_alternative())
        .await;

    assert_eq!(result.strategy, "rotating");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn request_options_reach_the_transport() {
    let transport = FixedTransport::new(200, page_body());
    let engine = FetchEngine::builder()
        .with_transport(transport.clone())
        .with_request_timeout(Duration::from_secs(7))
        .build()
        .unwrap();

    engine
        .fetch(
            URL,
            FetchOptions::new()
                .with_header("X-Trace", "abc")
                .with_query("page", "2"),
        )
        .await;

    let requests = transport.requests.lock();
    let request = &requests[0];
    assert_eq!(request.timeout, Duration::from_secs(7));
    assert_eq!(request.query, vec![("page".to_string(), "2".to_string())]);
    assert_eq!(request.headers.get("x-trace").unwrap(), "abc");
    assert!(request.headers.get("user-agent").is_some());
}

struct AlwaysFails(&'static str, StrategyStage);

#[async_trait]
impl FetchStrategy for AlwaysFails {
    fn name(&self) -> &'static str {
        self.0
    }

    fn stage(&self) -> StrategyStage {
        self.1
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult {
        FetchResult::failed(ctx.request_id, ctx.url.as_str(), self.0, format!("{} gave up", self.0))
    }
}

#[tokio::test(start_paused = true)]
async fn custom_cascade_waits_between_strategies() {
    let engine = FetchEngine::builder()
        .with_config(EngineConfig {
            strategy_delay_ms: 250,
            ..EngineConfig::default()
        })
        .with_strategies(vec![
            Arc::new(AlwaysFails("first", StrategyStage::Direct)),
            Arc::new(AlwaysFails("second", StrategyStage::Rotating)),
            Arc::new(AlwaysFails("third", StrategyStage::Browser)),
            Arc::new(AlwaysFails("fourth", StrategyStage::BlockingBrowser)),
        ])
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = engine.get(URL).await;

    assert_eq!(result.strategy, "none");
    assert_eq!(result.error.as_deref(), Some("fourth: fourth gave up"));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(750) && waited < Duration::from_millis(800));
}
