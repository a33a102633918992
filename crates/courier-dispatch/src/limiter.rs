use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use courier_common::Channel;
use courier_config::ChannelsConfig;
use dashmap::DashMap;
use tracing::debug;

/// Admission windows for one channel.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Ceiling for the channel's rate-limit key (tenant, or
    /// tenant:contact for AI replies)
    pub max_per_window: u32,
    pub window: Duration,
    /// Additional tenant-wide ceiling over the same window, for channels
    /// keyed narrower than the tenant
    pub tenant_max_per_window: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LimiterKey {
    key: String,
    channel: Channel,
}

/// Exact sliding-window rate limiter.
///
/// Each (rate-limit key, channel) pair owns a deque of admission
/// timestamps. An attempt is admitted only if, after purging entries
/// older than the window, fewer than the ceiling remain. Rejected
/// attempts leave no trace, so a burst of rejections never extends the
/// throttle. Channels with a `tenant_max_per_window` must clear both
/// the key-level and the tenant-level window to be admitted.
pub struct SlidingWindowLimiter {
    configs: HashMap<Channel, WindowConfig>,
    windows: DashMap<LimiterKey, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(configs: HashMap<Channel, WindowConfig>) -> Self {
        Self {
            configs,
            windows: DashMap::new(),
        }
    }

    pub fn from_channels(channels: &ChannelsConfig) -> Self {
        let mut configs = HashMap::new();
        for channel in Channel::all() {
            let cfg = channels.for_channel(channel);
            configs.insert(
                channel,
                WindowConfig {
                    max_per_window: cfg.max_per_window,
                    window: Duration::from_millis(cfg.window_length_ms),
                    tenant_max_per_window: cfg.tenant_max_per_window,
                },
            );
        }
        Self::new(configs)
    }

    pub fn window(&self, channel: Channel) -> Duration {
        self.configs
            .get(&channel)
            .map(|c| c.window)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Purge, check, and record as one atomic step per window. Returns
    /// false without side effects when either window is full.
    pub fn try_acquire(&self, tenant_id: &str, key: &str, channel: Channel) -> bool {
        let Some(config) = self.configs.get(&channel) else {
            return true;
        };

        if !self.admit(key, channel, config.max_per_window, config.window) {
            debug!(rate_limit_key = %key, channel = %channel, "rate limit window full");
            return false;
        }

        if let Some(tenant_max) = config.tenant_max_per_window {
            if key != tenant_id
                && !self.admit(tenant_id, channel, tenant_max, config.window)
            {
                // Give back the key-level admission we just recorded
                self.retract(key, channel);
                debug!(tenant_id = %tenant_id, channel = %channel, "tenant window full");
                return false;
            }
        }
        true
    }

    fn admit(&self, key: &str, channel: Channel, max: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(LimiterKey {
                key: key.to_string(),
                channel,
            })
            .or_default();

        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= max as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    fn retract(&self, key: &str, channel: Channel) {
        if let Some(mut entry) = self.windows.get_mut(&LimiterKey {
            key: key.to_string(),
            channel,
        }) {
            entry.pop_back();
        }
    }

    /// Number of admissions currently inside the window for a key.
    pub fn in_window(&self, key: &str, channel: Channel) -> usize {
        let Some(config) = self.configs.get(&channel) else {
            return 0;
        };
        let now = Instant::now();
        self.windows
            .get(&LimiterKey {
                key: key.to_string(),
                channel,
            })
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) < config.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Evict keys with no admission inside the retention horizon.
    /// Returns the number of evicted keys. Counted inside the retain
    /// pass: acquisitions land concurrently, so two length reads would
    /// not agree.
    pub fn sweep(&self, retention: Duration) -> usize {
        let mut evicted = 0;
        self.windows.retain(|_, window| {
            let keep = window
                .back()
                .map(|last| last.elapsed() < retention)
                .unwrap_or(false);
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
