//! End-to-end detection and enrichment scenarios driven through the
//! assembled application state, with manifests served by wiremock and the
//! helper stubbed out.

mod common;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{test_app, wait_until};
use stream_scout::events::RequestEvent;
use stream_scout::fanout::{OutboundMessage, UpdateAction};

fn hls_event(tab_id: i64, url: String) -> RequestEvent {
    serde_json::from_value(serde_json::json!({
        "tabId": tab_id,
        "url": url,
        "contentType": "application/vnd.apple.mpegurl",
    }))
    .unwrap()
}

const MASTER_BODY: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n1080.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n720.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=842x480\n480.m3u8\n";

const MEDIA_BODY: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXTINF:6.0,\nseg0.ts\n\
#EXTINF:6.0,\nseg1.ts\n\
#EXT-X-ENDLIST\n";

#[tokio::test]
async fn test_master_with_three_variants() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER_BODY))
        .mount(&server)
        .await;

    let master_url = format!("{}/v/master.m3u8", server.uri());
    app.state.ingestor.on_request(hls_event(1, master_url)).await;

    // Wait until the top variant has both probe metadata and a preview.
    wait_until(|| async {
        let visible = app.state.registry.visible_streams(1).await;
        visible.len() == 1
            && visible[0]
                .variants
                .first()
                .map(|v| v.preview_url.is_some())
                .unwrap_or(false)
            && visible[0].variants.iter().all(|v| v.probe_meta.is_some())
    })
    .await;

    let visible = app.state.registry.visible_streams(1).await;
    assert_eq!(visible.len(), 1);
    let master = &visible[0];
    assert!(master.is_master);
    assert!(master.fully_parsed);
    assert_eq!(master.variants.len(), 3);
    assert_eq!(master.variants[0].height, Some(1080));
    assert_eq!(master.variants[1].height, Some(720));
    assert_eq!(master.variants[2].height, Some(480));
    assert!(master.variants[0].preview_url.is_some());
    assert!(master.variants[1].preview_url.is_none());

    // Variants were probed sequentially, highest quality first.
    let probes = app.helper.probes.lock().await.clone();
    assert_eq!(probes.len(), 3);
    assert!(probes[0].contains("1080"));
    assert!(probes[1].contains("720"));
    assert!(probes[2].contains("480"));
}

#[tokio::test]
async fn test_variant_seen_before_master() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER_BODY))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/1080.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MEDIA_BODY))
        .mount(&server)
        .await;

    let mut deltas = app.state.fanout.register("popup", Some(1), None).await;

    // The 1080 variant arrives first and becomes a standalone stream.
    let variant_url = format!("{}/v/1080.m3u8", server.uri());
    app.state
        .ingestor
        .on_request(hls_event(1, variant_url.clone()))
        .await;
    wait_until(|| async {
        app.state
            .registry
            .visible_streams(1)
            .await
            .first()
            .map(|s| s.light_parsed)
            .unwrap_or(false)
    })
    .await;

    // Then the master shows up and claims it.
    let master_url = format!("{}/v/master.m3u8", server.uri());
    app.state
        .ingestor
        .on_request(hls_event(1, master_url.clone()))
        .await;

    let variant_canonical = stream_scout::detection::canonicalize(&variant_url);
    let master_canonical = stream_scout::detection::canonicalize(&master_url);

    wait_until(|| async {
        app.state
            .registry
            .get(1, &variant_canonical)
            .await
            .map(|s| s.has_known_master)
            .unwrap_or(false)
    })
    .await;

    let linked = app.state.registry.get(1, &variant_canonical).await.unwrap();
    assert!(linked.is_variant);
    assert_eq!(linked.master_canonical.as_deref(), Some(master_canonical.as_str()));

    // The linked variant left the visible set; only the master remains.
    let visible = app.state.registry.visible_streams(1).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].canonical, master_canonical);

    // Delta order: add(standalone), add(master), then an update marking the
    // standalone as owned. Interleaved enrichment updates are allowed.
    let mut adds = Vec::new();
    let mut saw_link_update = false;
    while let Ok(message) = deltas.try_recv() {
        if let OutboundMessage::VideosStateUpdate { action, video, .. } = message {
            match action {
                UpdateAction::Add => adds.push(video.unwrap().canonical.clone()),
                UpdateAction::Update => {
                    if let Some(video) = video {
                        if video.canonical == variant_canonical && video.has_known_master {
                            saw_link_update = true;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    assert_eq!(adds, vec![variant_canonical.clone(), master_canonical.clone()]);
    assert!(saw_link_update);
}

#[tokio::test]
async fn test_dash_segment_suppression() {
    let app = test_app().await;
    let server = MockServer::start().await;

    let mpd_body = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT60S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate media="segments/video_$Number$.mp4" initialization="segments/init.mp4"/>
      <Representation id="v1" codecs="avc1.640028" width="1920" height="1080" bandwidth="4000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    Mock::given(method("GET"))
        .and(path("/dash/v1/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mpd_body))
        .mount(&server)
        .await;

    let mpd_url = format!("{}/dash/v1/manifest.mpd", server.uri());
    let event: RequestEvent = serde_json::from_value(serde_json::json!({
        "tabId": 7,
        "url": mpd_url,
        "contentType": "application/dash+xml",
    }))
    .unwrap();
    app.state.ingestor.on_request(event).await;

    // Wait for the full parse to teach the context its segment prefix.
    wait_until(|| async {
        app.state
            .context
            .hints_for(7)
            .await
            .segment_prefixes
            .iter()
            .any(|p| p.contains("/dash/v1/segments/"))
    })
    .await;

    // Byte-range segment addressed inside the learned prefix.
    let segment: RequestEvent = serde_json::from_value(serde_json::json!({
        "tabId": 7,
        "url": format!("{}/dash/v1/segments/video_12.mp4?range=0-499999", server.uri()),
        "contentType": "video/mp4",
        "contentLength": 10_000_000u64,
    }))
    .unwrap();
    app.state.ingestor.on_request(segment).await;

    // A prefix-only match (no range, no numbered pattern) is suppressed too.
    let segment: RequestEvent = serde_json::from_value(serde_json::json!({
        "tabId": 7,
        "url": format!("{}/dash/v1/segments/parta.mp4", server.uri()),
        "contentType": "video/mp4",
        "contentLength": 10_000_000u64,
    }))
    .unwrap();
    app.state.ingestor.on_request(segment).await;

    let visible = app.state.registry.visible_streams(7).await;
    assert_eq!(visible.len(), 1, "segments must not become streams");
    assert!(visible[0].canonical.ends_with("/dash/v1/manifest.mpd"));
}

#[tokio::test]
async fn test_tracking_wrapper_extraction() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MEDIA_BODY))
        .mount(&server)
        .await;

    let inner = format!("{}/m.m3u8", server.uri());
    let wrapper = format!(
        "https://tracker.example/ping.gif?u={}",
        urlencoding::encode(&inner)
    );
    let event: RequestEvent = serde_json::from_value(serde_json::json!({
        "tabId": 3,
        "url": wrapper,
    }))
    .unwrap();
    app.state.ingestor.on_request(event).await;

    let canonical = stream_scout::detection::canonicalize(&inner);
    wait_until(|| async { app.state.registry.get(3, &canonical).await.is_some() }).await;

    let stream = app.state.registry.get(3, &canonical).await.unwrap();
    assert!(stream.found_from_query_param);
    assert_eq!(stream.url, inner);
    assert!(stream.original_url.as_deref().unwrap().contains("tracker.example"));
}

#[tokio::test]
async fn test_tab_close_clears_state() {
    let app = test_app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER_BODY))
        .mount(&server)
        .await;

    let master_url = format!("{}/v/master.m3u8", server.uri());
    app.state.ingestor.on_request(hls_event(5, master_url)).await;
    wait_until(|| async { !app.state.registry.visible_streams(5).await.is_empty() }).await;

    let event: stream_scout::events::TabEvent =
        serde_json::from_value(serde_json::json!({"tabId": 5, "action": "closed"})).unwrap();
    app.state.ingestor.on_tab(event).await;

    assert!(app.state.registry.visible_streams(5).await.is_empty());
    assert!(app.state.context.hints_for(5).await.segment_prefixes.is_empty());
}
