//! Cloud forwarding: store-and-forward delivery to a remote endpoint
//!
//! Accepted capsules are replicated to the configured cloud base URL. A
//! delivery that fails is spooled to disk as a `TxItem` and retried by a
//! periodic drain loop with capped exponential backoff. The spool is bounded
//! three ways (entry TTL, total bytes, item count); eviction removes the
//! oldest entries first. The drain loop is guarded by a busy flag so two
//! ticks can never process the same item concurrently.

use crate::config::CloudConfig;
use crate::error::Result;
use crate::util::now_ms;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ureq::Agent;

/// Drain loop period
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(750);

/// Backoff cap between retries of one item
const BACKOFF_CAP_MS: u64 = 15_000;

/// One spooled delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxItem {
    pub id: String,
    pub body: serde_json::Value,
    pub tries: u32,
    pub next_at: u64,
    pub created_at: u64,
    pub size: usize,
}

struct CloudState {
    queue: Vec<TxItem>,
    bytes: usize,
}

/// Cloud forward queue
pub struct CloudForwarder {
    state: Mutex<CloudState>,
    dir: PathBuf,
    base_url: Option<String>,
    agent: Agent,
    max_items: usize,
    max_bytes: usize,
    ttl_ms: u64,
    busy: AtomicBool,
    cloud_ok: AtomicBool,
}

impl CloudForwarder {
    /// Create the forwarder and load any spooled items from disk.
    ///
    /// Invalid, expired, and duplicate-id spool files are deleted during the
    /// load; caps are enforced on whatever remains.
    pub fn new(cfg: &CloudConfig) -> Result<Self> {
        let dir = PathBuf::from(&cfg.spool_dir);
        std::fs::create_dir_all(&dir)?;

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build();

        let forwarder = Self {
            state: Mutex::new(CloudState { queue: Vec::new(), bytes: 0 }),
            dir,
            base_url: cfg
                .base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            agent,
            max_items: cfg.max_items,
            max_bytes: cfg.max_bytes,
            ttl_ms: cfg.ttl_ms,
            busy: AtomicBool::new(false),
            // "ok" until a delivery actually fails; trivially ok when disabled
            cloud_ok: AtomicBool::new(true),
        };
        forwarder.load_from_disk();
        Ok(forwarder)
    }

    /// Is forwarding configured at all?
    pub fn enabled(&self) -> bool {
        self.base_url.is_some()
    }

    /// Did the last delivery attempt succeed?
    pub fn cloud_ok(&self) -> bool {
        self.cloud_ok.load(Ordering::Relaxed)
    }

    /// Queued item count
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queued bytes (serialized body sizes)
    pub fn queue_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Offer a capsule for cloud delivery: one immediate attempt, spool on
    /// failure. Returns `(forwarded, queued)`.
    pub fn submit(&self, id: &str, body: serde_json::Value) -> (bool, bool) {
        if !self.enabled() {
            return (false, false);
        }
        if self.try_forward(&body) {
            return (true, false);
        }

        let now = now_ms();
        let size = body.to_string().len();
        let item = TxItem {
            id: id.to_string(),
            body,
            tries: 0,
            next_at: now,
            created_at: now,
            size,
        };
        self.persist(&item);
        {
            let mut state = self.state.lock();
            state.bytes += item.size;
            state.queue.push(item);
            self.enforce_caps(&mut state, now);
        }
        (false, true)
    }

    fn try_forward(&self, body: &serde_json::Value) -> bool {
        let Some(base) = &self.base_url else {
            return true;
        };
        let url = format!("{}/api/tx", base);
        let ok = match self.agent.post(&url).send_json(body.clone()) {
            Ok(_) => true,
            Err(ureq::Error::Status(code, _)) => {
                log::debug!("cloud: {} answered {}", url, code);
                false
            }
            Err(e) => {
                log::debug!("cloud: delivery failed: {}", e);
                false
            }
        };
        self.cloud_ok.store(ok, Ordering::Relaxed);
        ok
    }

    /// One drain pass: evictions first, then retries of due items.
    ///
    /// Skipped entirely when a previous pass is still running.
    pub fn tick(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let now = now_ms();
        let due: Vec<(String, serde_json::Value)> = {
            let mut state = self.state.lock();
            self.enforce_caps(&mut state, now);
            state
                .queue
                .iter()
                .filter(|it| it.next_at <= now)
                .map(|it| (it.id.clone(), it.body.clone()))
                .collect()
        };

        for (id, body) in due {
            let delivered = self.try_forward(&body);
            let mut state = self.state.lock();
            if delivered {
                if let Some(pos) = state.queue.iter().position(|it| it.id == id) {
                    let item = state.queue.remove(pos);
                    state.bytes = state.bytes.saturating_sub(item.size);
                    self.remove_file(&item.id);
                    log::info!("cloud: delivered {} after {} tries", item.id, item.tries + 1);
                }
            } else if let Some(item) = state.queue.iter_mut().find(|it| it.id == id) {
                item.tries += 1;
                let jitter = rand::thread_rng().gen_range(0..400);
                item.next_at = now_ms() + backoff_delay_ms(item.tries) + jitter;
                let updated = item.clone();
                drop(state);
                self.persist(&updated);
            }
        }

        self.busy.store(false, Ordering::Release);
    }

    /// Spawn the periodic drain thread
    pub fn spawn_drain(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<()> {
        let forwarder = Arc::clone(self);
        std::thread::Builder::new()
            .name("cloud-drain".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    forwarder.tick();
                    std::thread::sleep(DRAIN_INTERVAL);
                }
                log::debug!("cloud: drain thread exiting");
            })
            .map_err(crate::error::Error::Io)?;
        Ok(())
    }

    /// TTL first, then byte cap, then item cap; oldest `created_at` evicted
    /// first within each cap.
    fn enforce_caps(&self, state: &mut CloudState, now: u64) {
        if self.ttl_ms > 0 {
            let ttl = self.ttl_ms;
            let mut evicted = Vec::new();
            state.queue.retain(|it| {
                if now.saturating_sub(it.created_at) > ttl {
                    evicted.push((it.id.clone(), it.size));
                    false
                } else {
                    true
                }
            });
            for (id, size) in evicted {
                state.bytes = state.bytes.saturating_sub(size);
                self.remove_file(&id);
                log::debug!("cloud: evicted {} (ttl)", id);
            }
        }

        state.queue.sort_by_key(|it| it.created_at);
        while state.bytes > self.max_bytes && !state.queue.is_empty() {
            let victim = state.queue.remove(0);
            state.bytes = state.bytes.saturating_sub(victim.size);
            self.remove_file(&victim.id);
            log::debug!("cloud: evicted {} (byte cap)", victim.id);
        }
        while state.queue.len() > self.max_items {
            let victim = state.queue.remove(0);
            state.bytes = state.bytes.saturating_sub(victim.size);
            self.remove_file(&victim.id);
            log::debug!("cloud: evicted {} (item cap)", victim.id);
        }
    }

    fn spool_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn persist(&self, item: &TxItem) {
        let path = self.spool_path(&item.id);
        match serde_json::to_string(item) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    log::warn!("cloud: cannot persist {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("cloud: cannot serialize {}: {}", item.id, e),
        }
    }

    fn remove_file(&self, id: &str) {
        let _ = std::fs::remove_file(self.spool_path(id));
    }

    fn load_from_disk(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cloud: cannot read spool {}: {}", self.dir.display(), e);
                return;
            }
        };

        let now = now_ms();
        let mut state = self.state.lock();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let item = std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<TxItem>(&text).ok())
                .filter(|it| !it.id.is_empty())
                .filter(|it| self.ttl_ms == 0 || now.saturating_sub(it.created_at) <= self.ttl_ms)
                .filter(|it| !state.queue.iter().any(|q| q.id == it.id));

            match item {
                Some(item) => {
                    state.bytes += item.size;
                    state.queue.push(item);
                }
                None => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        self.enforce_caps(&mut state, now);
        if !state.queue.is_empty() {
            log::info!(
                "cloud: loaded {} queued forwards ({} bytes)",
                state.queue.len(),
                state.bytes
            );
        }
    }
}

/// Retry delay for an item that has failed `tries` times, jitter excluded
fn backoff_delay_ms(tries: u32) -> u64 {
    let raw = 700.0 * 1.8f64.powi(tries as i32);
    (raw as u64).min(BACKOFF_CAP_MS)
}
