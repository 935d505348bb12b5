/// KIP nonce 防重放
///
/// 按 user-hash 分桶，每桶一把锁，只有同一用户的连接之间会争用。
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(120);
pub const MAX_NONCES_PER_USER: usize = 4096;
pub const MAX_USERS: usize = 16384;

pub type Nonce = [u8; 16];

struct NonceSet {
    entries: HashMap<Nonce, Instant>,
    last_prune: Instant,
}

impl NonceSet {
    fn new(now: Instant) -> Self {
        NonceSet {
            entries: HashMap::new(),
            last_prune: now,
        }
    }

    fn prune(&mut self, now: Instant, cap: usize) {
        self.entries.retain(|_, expiry| *expiry > now);
        self.last_prune = now;
        if self.entries.len() >= cap {
            let excess = self.entries.len() + 1 - cap;
            let victims: Vec<Nonce> = self.entries.keys().take(excess).copied().collect();
            for nonce in victims {
                self.entries.remove(&nonce);
            }
        }
    }
}

/// 时间窗口内的 nonce 集合
pub struct ReplayGuard {
    ttl: Duration,
    per_user_cap: usize,
    user_cap: usize,
    users: RwLock<HashMap<[u8; 8], Arc<Mutex<NonceSet>>>>,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ReplayGuard {
    pub fn new(ttl: Duration) -> Self {
        Self::with_limits(ttl, MAX_NONCES_PER_USER, MAX_USERS)
    }

    pub fn with_limits(ttl: Duration, per_user_cap: usize, user_cap: usize) -> Self {
        ReplayGuard {
            ttl,
            per_user_cap: per_user_cap.max(1),
            user_cap: user_cap.max(1),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn bucket(&self, user_hash: &[u8; 8], now: Instant) -> Arc<Mutex<NonceSet>> {
        if let Ok(users) = self.users.read() {
            if let Some(set) = users.get(user_hash) {
                return set.clone();
            }
        }
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
        if !users.contains_key(user_hash) && users.len() >= self.user_cap {
            // 用户数超限：先清掉空桶，仍不够就任意淘汰一个
            users.retain(|_, set| set.lock().map(|s| !s.entries.is_empty()).unwrap_or(false));
            if users.len() >= self.user_cap {
                if let Some(victim) = users.keys().next().copied() {
                    users.remove(&victim);
                }
            }
        }
        users
            .entry(*user_hash)
            .or_insert_with(|| Arc::new(Mutex::new(NonceSet::new(now))))
            .clone()
    }

    /// 未见过（或已过期）返回 true 并记录；窗口内重复返回 false
    pub fn allow(&self, user_hash: &[u8; 8], nonce: &Nonce, now: Instant) -> bool {
        let bucket = self.bucket(user_hash, now);
        let mut set = bucket.lock().unwrap_or_else(|e| e.into_inner());

        if now.saturating_duration_since(set.last_prune) > self.ttl / 2 || set.entries.len() >= self.per_user_cap {
            set.prune(now, self.per_user_cap);
        }

        if let Some(expiry) = set.entries.get(nonce) {
            if *expiry > now {
                return false;
            }
        }
        set.entries.insert(*nonce, now + self.ttl);
        true
    }

    pub fn user_count(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }
}
