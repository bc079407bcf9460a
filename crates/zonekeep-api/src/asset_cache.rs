use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;

/// Static noVNC assets every console page pulls in.
pub const WARM_MANIFEST: &[&str] = &[
    "app/ui.js",
    "app/localization.js",
    "app/webutil.js",
    "app/styles/base.css",
    "app/styles/input.css",
    "app/images/icons/novnc-icon.svg",
    "app/locale/en.json",
    "core/rfb.js",
    "core/websock.js",
    "core/display.js",
    "core/inflator.js",
    "core/deflator.js",
    "core/encodings.js",
    "core/input/keyboard.js",
    "core/input/keysym.js",
    "core/input/keysymdef.js",
    "core/input/util.js",
    "core/util/logging.js",
    "core/util/events.js",
    "core/util/browser.js",
    "core/util/element.js",
    "core/util/strings.js",
    "core/decoders/raw.js",
    "core/decoders/copyrect.js",
    "core/decoders/tight.js",
    "core/decoders/zrle.js",
    "vendor/pako/lib/zlib/inflate.js",
    "vendor/pako/lib/zlib/deflate.js",
];

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub data: Arc<[u8]>,
    pub content_type: String,
}

struct CacheEntry {
    asset: CachedAsset,
    stored_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            self.order.retain(|p| p != path);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
}

/// Bounded TTL cache for proxied console assets, keyed by request path.
///
/// Overflow evicts the oldest-inserted entry; reads do not refresh an entry.
pub struct AssetCache {
    capacity: usize,
    ttl: Duration,
    max_asset_bytes: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl AssetCache {
    pub fn new(capacity: usize, ttl: Duration, max_asset_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            max_asset_bytes,
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_asset_bytes(&self) -> usize {
        self.max_asset_bytes
    }

    pub fn get(&self, path: &str) -> Option<CachedAsset> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired = match inner.entries.get(path) {
            None => return None,
            Some(e) => now.saturating_duration_since(e.stored_at) > self.ttl,
        };
        if expired {
            inner.remove(path);
            return None;
        }
        inner.entries.get(path).map(|e| e.asset.clone())
    }

    pub fn set(&self, path: &str, data: impl Into<Arc<[u8]>>, content_type: &str) {
        let entry = CacheEntry {
            asset: CachedAsset {
                data: data.into(),
                content_type: content_type.to_string(),
            },
            stored_at: self.clock.now(),
        };

        let mut inner = self.lock();
        inner.remove(path);
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.entries.insert(path.to_string(), entry);
        inner.order.push_back(path.to_string());
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock().entries.len(),
            capacity: self.capacity,
        }
    }

    /// Prefetches [`WARM_MANIFEST`] from a freshly started console on `port`.
    /// Best effort: failures are logged at debug and otherwise ignored.
    pub async fn warm(&self, port: u16, client: &reqwest::Client) -> usize {
        let fetches = WARM_MANIFEST
            .iter()
            .filter(|p| self.get(p).is_none())
            .map(|path| async move {
                let url = format!("http://127.0.0.1:{port}/{path}");
                let resp = match client.get(&url).send().await {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::debug!(%err, path, "cache warm fetch failed");
                        return None;
                    }
                };
                if !resp.status().is_success() {
                    return None;
                }
                if resp
                    .content_length()
                    .is_some_and(|n| n > self.max_asset_bytes as u64)
                {
                    return None;
                }
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let body = resp.bytes().await.ok()?;
                if body.len() > self.max_asset_bytes {
                    return None;
                }
                Some((*path, body, content_type))
            });

        let mut cached = 0;
        for (path, body, content_type) in futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
        {
            self.set(path, body.to_vec(), &content_type);
            cached += 1;
        }
        tracing::debug!(port, cached, "asset cache warmed");
        cached
    }
}
