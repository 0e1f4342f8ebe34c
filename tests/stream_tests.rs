use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::Instant;
use zenith_sse::sse::{EventManager, SseError, SseEvent, StreamOptions};

fn counting_events(n: u64) -> impl futures::Stream<Item = Result<SseEvent, Infallible>> {
    stream::iter((0..n).map(|i| {
        Ok(SseEvent::json(&json!({"value": i}))
            .unwrap()
            .with_id(i.to_string())
            .with_type("count"))
    }))
}

fn text(chunk: &Bytes) -> &str {
    std::str::from_utf8(chunk).unwrap()
}

#[tokio::test(start_paused = true)]
async fn basic_stream_delivers_in_order() {
    let manager = EventManager::default();
    let stream = manager.stream(counting_events(3), StreamOptions::default());

    let chunks: Vec<Bytes> = stream.map(Result::unwrap).collect().await;

    assert_eq!(chunks.len(), 3);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(
            text(chunk),
            format!("id: {i}\nevent: count\ndata: {{\"value\": {i}}}\n\n")
        );
    }

    let stats = manager.stats();
    assert_eq!(stats.events_sent, 3);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(
        stats.bytes_streamed,
        chunks.iter().map(|c| c.len() as u64).sum::<u64>()
    );
    assert_eq!(manager.get_connection_count(None), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_stream_is_delayed_not_dropped() {
    let manager = EventManager::default();
    let stream = manager.stream(
        counting_events(5),
        StreamOptions::default().with_rate_limit(1.0),
    );

    let start = Instant::now();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 5);
    assert!(chunks.iter().all(Result::is_ok));
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(manager.stats().events_sent, 5);
    assert!(manager.stats().backpressure_throttles >= 4);
}

#[tokio::test(start_paused = true)]
async fn vanishing_rate_is_bounded_by_max_wait() {
    let manager = EventManager::default();
    let stream = manager.stream(
        counting_events(2),
        StreamOptions::default().with_rate_limit(1e-30),
    );

    let start = Instant::now();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(Result::is_ok));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn disabling_adaptive_throttling_skips_rate_limit() {
    let manager = EventManager::default();
    let stream = manager.stream(
        counting_events(5),
        StreamOptions::default()
            .with_rate_limit(1.0)
            .with_adaptive_throttling(false),
    );

    let start = Instant::now();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 5);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(manager.stats().backpressure_throttles, 0);
}

#[tokio::test(start_paused = true)]
async fn producer_error_ends_stream_after_cleanup() {
    let manager = EventManager::default();
    let events = stream::iter(vec![
        Ok(SseEvent::new("first")),
        Err(std::io::Error::other("producer exploded")),
        Ok(SseEvent::new("never sent")),
    ]);
    let mut stream = manager.stream(events, StreamOptions::default());
    let id = stream.id().to_string();
    manager.subscribe_to_channel(&id, "news");

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(text(&first), "data: first\n\n");

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, SseError::Producer(_)));
    assert!(err.to_string().contains("producer exploded"));

    // cleanup already ran before the error surfaced
    assert_eq!(manager.stats().active_connections, 0);
    assert_eq!(manager.get_connection_count(Some("news")), 0);
    assert!(manager.connection_info(&id).is_none());

    assert!(stream.next().await.is_none());
    assert_eq!(manager.stats().events_sent, 1);
}

#[tokio::test]
async fn dropping_stream_runs_cleanup() {
    let manager = EventManager::default();
    let stream = manager.stream(
        stream::pending::<Result<SseEvent, Infallible>>(),
        StreamOptions::default().with_channels(["news", "sports"]),
    );
    let id = stream.id().to_string();

    assert_eq!(manager.get_connection_count(Some("news")), 1);
    assert_eq!(manager.stats().active_connections, 1);

    drop(stream);

    assert_eq!(manager.stats().active_connections, 0);
    assert!(manager.list_channels().is_empty());
    assert!(manager.connection_info(&id).is_none());
    assert!(!manager.cleanup_connection(&id));
}

#[tokio::test(start_paused = true)]
async fn channel_stream_receives_published_events() {
    let manager = EventManager::default();
    let stream = manager.channel_stream(vec!["news".to_string()], StreamOptions::default());
    let id = stream.id().to_string();

    assert_eq!(manager.publish("news", &SseEvent::new("one").with_type("headline")), 1);
    assert_eq!(manager.publish("sports", &SseEvent::new("ignored")), 0);
    assert_eq!(manager.broadcast(&SseEvent::new("two")), 1);
    assert!(manager.disconnect(&id));

    let chunks: Vec<Bytes> = stream.map(Result::unwrap).collect().await;
    let texts: Vec<&str> = chunks.iter().map(text).collect();
    assert_eq!(texts, vec!["event: headline\ndata: one\n\n", "data: two\n\n"]);

    assert_eq!(manager.stats().active_connections, 0);
    assert_eq!(manager.get_connection_count(Some("news")), 0);
}

#[tokio::test(start_paused = true)]
async fn drop_oldest_keeps_latest_events() {
    let manager = EventManager::new(zenith_sse::config::SseConfig {
        queue_capacity: 2,
        ..Default::default()
    });
    let stream = manager.channel_stream(vec!["ticks".to_string()], StreamOptions::default());
    let id = stream.id().to_string();

    for i in 0..4 {
        assert_eq!(manager.publish("ticks", &SseEvent::new(i.to_string())), 1);
    }
    assert_eq!(manager.stats().events_dropped, 2);
    manager.disconnect(&id);

    let chunks: Vec<Bytes> = stream.map(Result::unwrap).collect().await;
    let texts: Vec<&str> = chunks.iter().map(text).collect();
    assert_eq!(texts, vec!["data: 2\n\n", "data: 3\n\n"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_channel_streams() {
    let manager = EventManager::default();
    let first = manager.channel_stream(vec!["a".to_string()], StreamOptions::default());
    let second = manager.channel_stream(vec!["b".to_string()], StreamOptions::default());

    manager.shutdown();

    assert_eq!(first.count().await, 0);
    assert_eq!(second.count().await, 0);
    assert_eq!(manager.stats().active_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn response_carries_streaming_headers_and_body() {
    let manager = EventManager::default();

    let mut custom = HeaderMap::new();
    custom.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    custom.insert("x-request-source", HeaderValue::from_static("test"));

    let response = zenith_sse::create_sse_response(&manager, counting_events(2), Some(custom));

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
    assert_eq!(headers[header::CONNECTION], "keep-alive");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(headers["x-accel-buffering"], "no");
    assert_eq!(headers["x-sse-backpressure"], "enabled");
    assert_eq!(headers["x-request-source"], "test");
    assert_eq!(manager.get_connection_count(None), 1);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        std::str::from_utf8(&body).unwrap(),
        "id: 0\nevent: count\ndata: {\"value\": 0}\n\n\
         id: 1\nevent: count\ndata: {\"value\": 1}\n\n"
    );
    assert_eq!(manager.get_connection_count(None), 0);
}

#[tokio::test(start_paused = true)]
async fn performance_stats_reflect_activity() {
    let manager = EventManager::default();
    let _idle = manager.channel_stream(vec!["news".to_string()], StreamOptions::default());

    let done: Vec<_> = manager
        .stream(counting_events(2), StreamOptions::default())
        .collect()
        .await;
    assert_eq!(done.len(), 2);

    let perf = manager.get_performance_stats();
    assert_eq!(perf.counters.events_sent, 2);
    assert_eq!(perf.counters.active_connections, 1);
    assert_eq!(perf.channel_count, 1);
    assert!(perf.average_event_bytes > 0.0);

    manager.reset_stats();
    assert_eq!(manager.stats().events_sent, 0);
}
