//! Per-tab stream registry
//!
//! Deduplicating store of discovered streams keyed by `(tab, canonical)`,
//! plus the variant→master linkage map. Every mutation emits its delta to
//! the fan-out before the write lock is released, so observers always see
//! updates in mutation order and each delta reflects the post-change state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::fanout::{FanOut, OutboundMessage, UpdateAction};
use crate::models::{ManifestSubtype, Stream, TabId, Variant};

/// Whether an upsert created a stream or merged into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Merged,
}

#[derive(Default)]
struct TabStreams {
    streams: HashMap<String, Stream>,
    /// variant canonical → master canonical
    variant_masters: HashMap<String, String>,
}

#[derive(Clone)]
pub struct VideoRegistry {
    tabs: Arc<RwLock<HashMap<TabId, TabStreams>>>,
    fanout: FanOut,
}

impl VideoRegistry {
    pub fn new(fanout: FanOut) -> Self {
        Self {
            tabs: Arc::new(RwLock::new(HashMap::new())),
            fanout,
        }
    }

    /// Insert or merge a stream.
    ///
    /// Merging preserves what enrichment has already earned: detection time,
    /// parse state, probe metadata, and relationship fields. Presentation
    /// fields (`poster`, `title`, `expiry_info`) take the incoming value
    /// when provided.
    pub async fn upsert(&self, tab_id: TabId, mut stream: Stream) -> UpsertOutcome {
        let mut tabs = self.tabs.write().await;
        let tab = tabs.entry(tab_id).or_default();
        let canonical = stream.canonical.clone();

        // A variant may arrive after its master was parsed; link it on sight.
        if let Some(master) = tab.variant_masters.get(&canonical) {
            if master != &canonical {
                stream.is_variant = true;
                stream.has_known_master = true;
                stream.master_canonical = Some(master.clone());
            }
        }

        let (outcome, snapshot) = match tab.streams.get_mut(&canonical) {
            Some(existing) => {
                merge_into(existing, stream);
                (UpsertOutcome::Merged, existing.clone())
            }
            None => {
                tab.streams.insert(canonical.clone(), stream.clone());
                (UpsertOutcome::New, stream)
            }
        };

        let action = match outcome {
            UpsertOutcome::New => UpdateAction::Add,
            UpsertOutcome::Merged => UpdateAction::Update,
        };
        self.emit(tab_id, action, snapshot).await;
        outcome
    }

    /// Mutate one stream in place and emit the update delta.
    /// Returns false when the stream is gone.
    pub async fn update_stream<F>(&self, tab_id: TabId, canonical: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Stream),
    {
        let mut tabs = self.tabs.write().await;
        let Some(stream) = tabs
            .get_mut(&tab_id)
            .and_then(|tab| tab.streams.get_mut(canonical))
        else {
            return false;
        };
        mutate(stream);
        let snapshot = stream.clone();
        self.emit(tab_id, UpdateAction::Update, snapshot).await;
        true
    }

    /// Record a master's variant list and link any standalone streams that
    /// turn out to be its variants.
    pub async fn attach_variants(
        &self,
        tab_id: TabId,
        master_canonical: &str,
        variants: Vec<Variant>,
    ) {
        let mut tabs = self.tabs.write().await;
        let Some(tab) = tabs.get_mut(&tab_id) else {
            return;
        };

        for variant in &variants {
            tab.variant_masters
                .insert(variant.canonical.clone(), master_canonical.to_string());
        }

        if let Some(master) = tab.streams.get_mut(master_canonical) {
            master.is_master = true;
            master.subtype = Some(ManifestSubtype::Master);
            master.fully_parsed = true;
            master.variants = variants.clone();
            let snapshot = master.clone();
            self.emit(tab_id, UpdateAction::Update, snapshot).await;
        }

        for variant in &variants {
            if variant.canonical == master_canonical {
                continue;
            }
            if let Some(existing) = tab.streams.get_mut(&variant.canonical) {
                if existing.has_known_master {
                    continue;
                }
                existing.is_variant = true;
                existing.has_known_master = true;
                existing.master_canonical = Some(master_canonical.to_string());
                let snapshot = existing.clone();
                self.emit(tab_id, UpdateAction::Update, snapshot).await;
            }
        }
    }

    /// Mutate one variant of a master (by index) and emit the master update.
    pub async fn update_variant<F>(
        &self,
        tab_id: TabId,
        master_canonical: &str,
        index: usize,
        mutate: F,
    ) -> bool
    where
        F: FnOnce(&mut Variant),
    {
        let mut tabs = self.tabs.write().await;
        let Some(master) = tabs
            .get_mut(&tab_id)
            .and_then(|tab| tab.streams.get_mut(master_canonical))
        else {
            return false;
        };
        let Some(variant) = master.variants.get_mut(index) else {
            return false;
        };
        mutate(variant);
        let snapshot = master.clone();
        self.emit(tab_id, UpdateAction::Update, snapshot).await;
        true
    }

    pub async fn get(&self, tab_id: TabId, canonical: &str) -> Option<Stream> {
        let tabs = self.tabs.read().await;
        tabs.get(&tab_id)
            .and_then(|tab| tab.streams.get(canonical))
            .cloned()
    }

    /// Streams the UI should list: everything except variants linked to a
    /// known master, newest first.
    pub async fn visible_streams(&self, tab_id: TabId) -> Vec<Stream> {
        let tabs = self.tabs.read().await;
        let Some(tab) = tabs.get(&tab_id) else {
            return Vec::new();
        };
        let mut streams: Vec<Stream> = tab
            .streams
            .values()
            .filter(|stream| {
                match tab.variant_masters.get(&stream.canonical) {
                    Some(master) => master == &stream.canonical,
                    None => true,
                }
            })
            .cloned()
            .collect();
        streams.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        streams
    }

    /// Push a full refresh of a tab's visible set to its observers.
    pub async fn emit_full_refresh(&self, tab_id: TabId) {
        let videos = self.visible_streams(tab_id).await;
        self.fanout
            .broadcast_tab(
                tab_id,
                OutboundMessage::VideosStateUpdate {
                    action: UpdateAction::FullRefresh,
                    tab_id,
                    video_url: None,
                    video: None,
                    videos: Some(videos),
                },
            )
            .await;
    }

    /// Count previews held in registry entries: (entries, tabs with any).
    pub async fn preview_cache_stats(&self) -> (usize, usize) {
        let tabs = self.tabs.read().await;
        let mut entries = 0;
        let mut tabs_with_previews = 0;
        for tab in tabs.values() {
            let count: usize = tab
                .streams
                .values()
                .map(|stream| {
                    let own = usize::from(stream.preview_url.is_some());
                    let variants = stream
                        .variants
                        .iter()
                        .filter(|v| v.preview_url.is_some())
                        .count();
                    own + variants
                })
                .sum();
            if count > 0 {
                tabs_with_previews += 1;
            }
            entries += count;
        }
        (entries, tabs_with_previews)
    }

    /// Drop all preview URLs (the helper's cache was cleared underneath).
    pub async fn clear_previews(&self) {
        let mut tabs = self.tabs.write().await;
        for tab in tabs.values_mut() {
            for stream in tab.streams.values_mut() {
                stream.preview_url = None;
                for variant in stream.variants.iter_mut() {
                    variant.preview_url = None;
                }
            }
        }
    }

    /// Drop all per-tab state. Nothing is emitted; the tab is gone.
    pub async fn destroy(&self, tab_id: TabId) {
        let mut tabs = self.tabs.write().await;
        if tabs.remove(&tab_id).is_some() {
            debug!("registry dropped tab {tab_id}");
        }
    }

    async fn emit(&self, tab_id: TabId, action: UpdateAction, stream: Stream) {
        let message = match action {
            UpdateAction::Remove => OutboundMessage::VideosStateUpdate {
                action,
                tab_id,
                video_url: Some(stream.canonical),
                video: None,
                videos: None,
            },
            _ => OutboundMessage::VideosStateUpdate {
                action,
                tab_id,
                video_url: Some(stream.canonical.clone()),
                video: Some(Box::new(stream)),
                videos: None,
            },
        };
        self.fanout.broadcast_tab(tab_id, message).await;
    }
}


/// Merge an incoming re-detection into the stored stream.
fn merge_into(existing: &mut Stream, incoming: Stream) {
    // Newest sighting may carry fresher presentation fields.
    if incoming.title.is_some() {
        existing.title = incoming.title;
    }
    if incoming.poster.is_some() {
        existing.poster = incoming.poster;
    }
    if incoming.expiry_info.is_some() {
        existing.expiry_info = incoming.expiry_info;
    }

    // Fill gaps without clobbering earned state.
    if existing.container.is_none() {
        existing.container = incoming.container;
    }
    if existing.media_kind.is_none() {
        existing.media_kind = incoming.media_kind;
    }
    if existing.probe_meta.is_none() {
        existing.probe_meta = incoming.probe_meta;
    }
    if existing.parser_meta.is_none() {
        existing.parser_meta = incoming.parser_meta;
    }
    if existing.preview_url.is_none() {
        existing.preview_url = incoming.preview_url;
    }
    if existing.original_url.is_none() {
        existing.original_url = incoming.original_url;
    }
    existing.found_from_query_param =
        existing.found_from_query_param || incoming.found_from_query_param;

    // Relationship fields only ever strengthen.
    if incoming.has_known_master && !existing.has_known_master {
        existing.is_variant = true;
        existing.has_known_master = true;
        existing.master_canonical = incoming.master_canonical;
    }
}
