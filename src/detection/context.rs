//! Per-tab detection state
//!
//! Tracks which tabs have seen a DASH manifest and which segment path
//! prefixes their manifests use, so the classifier can suppress segment
//! requests that would otherwise look like direct files.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::classifier::SegmentHints;
use crate::models::TabId;

/// Prefixes learned for a tab with an unknown origin attach to any tab that
/// saw an MPD within this window.
const RECENT_MPD_WINDOW_SECS: i64 = 60;

#[derive(Debug, Default, Clone)]
struct TabDetectionState {
    mpd_seen_at: Option<DateTime<Utc>>,
    dash_segment_prefixes: BTreeSet<String>,
}

/// Shared registry of [`TabDetectionState`], one entry per tab.
#[derive(Clone, Default)]
pub struct DetectionContext {
    tabs: Arc<RwLock<HashMap<TabId, TabDetectionState>>>,
}

impl DetectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an MPD was observed for this tab.
    pub async fn mark_mpd(&self, tab_id: TabId, now: DateTime<Utc>) {
        let mut tabs = self.tabs.write().await;
        tabs.entry(tab_id).or_default().mpd_seen_at = Some(now);
    }

    /// Union segment path prefixes into a tab's set.
    ///
    /// When `tab_id` is `None` (the manifest was fetched outside any known
    /// tab), the prefixes attach to the tab that most recently saw an MPD,
    /// provided that was under a minute ago. This is a best-effort
    /// association and can misattribute under rapid tab churn.
    pub async fn add_segment_prefixes(&self, tab_id: Option<TabId>, prefixes: &[String]) {
        if prefixes.is_empty() {
            return;
        }
        let mut tabs = self.tabs.write().await;

        let target = match tab_id {
            Some(tab_id) => Some(tab_id),
            None => {
                let cutoff = Utc::now() - Duration::seconds(RECENT_MPD_WINDOW_SECS);
                tabs.iter()
                    .filter(|(_, state)| state.mpd_seen_at.map(|at| at > cutoff).unwrap_or(false))
                    .max_by_key(|(_, state)| state.mpd_seen_at)
                    .map(|(tab_id, _)| *tab_id)
            }
        };

        let Some(target) = target else {
            debug!(
                "dropping {} segment prefixes: no tab and no recent MPD",
                prefixes.len()
            );
            return;
        };

        let state = tabs.entry(target).or_default();
        for prefix in prefixes {
            state.dash_segment_prefixes.insert(prefix.clone());
        }
    }

    /// Snapshot the hints the classifier needs for a tab.
    pub async fn hints_for(&self, tab_id: TabId) -> SegmentHints {
        let tabs = self.tabs.read().await;
        match tabs.get(&tab_id) {
            Some(state) => SegmentHints {
                has_mpd_context: state.mpd_seen_at.is_some(),
                segment_prefixes: state.dash_segment_prefixes.iter().cloned().collect(),
            },
            None => SegmentHints::default(),
        }
    }

    /// True when the URL matches a learned segment prefix for the tab.
    pub async fn is_segment_for(&self, tab_id: TabId, url: &str) -> bool {
        let tabs = self.tabs.read().await;
        tabs.get(&tab_id)
            .map(|state| {
                state
                    .dash_segment_prefixes
                    .iter()
                    .any(|prefix| url.contains(prefix.as_str()))
            })
            .unwrap_or(false)
    }

    /// Drop all state for a tab.
    pub async fn cleanup(&self, tab_id: TabId) {
        let mut tabs = self.tabs.write().await;
        tabs.remove(&tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_and_hints() {
        let ctx = DetectionContext::new();
        assert!(!ctx.hints_for(7).await.has_mpd_context);

        ctx.mark_mpd(7, Utc::now()).await;
        assert!(ctx.hints_for(7).await.has_mpd_context);
        assert!(!ctx.hints_for(8).await.has_mpd_context);
    }

    #[tokio::test]
    async fn test_prefixes_union() {
        let ctx = DetectionContext::new();
        ctx.add_segment_prefixes(Some(7), &["/dash/v1/segments/".to_string()])
            .await;
        ctx.add_segment_prefixes(
            Some(7),
            &["/dash/v1/segments/".to_string(), "/dash/v2/".to_string()],
        )
        .await;

        let hints = ctx.hints_for(7).await;
        assert_eq!(hints.segment_prefixes.len(), 2);
        assert!(
            ctx.is_segment_for(7, "https://cdn.example.com/dash/v1/segments/video_1.mp4")
                .await
        );
        assert!(!ctx.is_segment_for(7, "https://cdn.example.com/other/x.mp4").await);
    }

    #[tokio::test]
    async fn test_orphan_prefixes_attach_to_recent_mpd_tab() {
        let ctx = DetectionContext::new();
        ctx.mark_mpd(3, Utc::now() - Duration::seconds(120)).await;
        ctx.mark_mpd(9, Utc::now()).await;

        ctx.add_segment_prefixes(None, &["/live/seg/".to_string()]).await;

        assert!(ctx.is_segment_for(9, "https://cdn.example.com/live/seg/0.mp4").await);
        assert!(!ctx.is_segment_for(3, "https://cdn.example.com/live/seg/0.mp4").await);
    }

    #[tokio::test]
    async fn test_orphan_prefixes_dropped_without_recent_mpd() {
        let ctx = DetectionContext::new();
        ctx.mark_mpd(3, Utc::now() - Duration::seconds(120)).await;
        ctx.add_segment_prefixes(None, &["/live/seg/".to_string()]).await;
        assert!(!ctx.is_segment_for(3, "https://x/live/seg/0.mp4").await);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let ctx = DetectionContext::new();
        ctx.mark_mpd(7, Utc::now()).await;
        ctx.add_segment_prefixes(Some(7), &["/seg/".to_string()]).await;
        ctx.cleanup(7).await;
        let hints = ctx.hints_for(7).await;
        assert!(!hints.has_mpd_context);
        assert!(hints.segment_prefixes.is_empty());
    }
}
