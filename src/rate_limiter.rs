//! Cross-process rate limiter: token bucket + concurrency semaphore + ban clock,
//! all persisted to disk so every collector process sharing `data_dir` sees the same
//! budget (spec §4.1). Grounded on `fs2` for the OS advisory lock (same crate used by
//! `denniswon-crypto-strategy-rust` and `aptos-labs-aptos-core` for the same purpose)
//! and on the teacher's `DatabaseManager` pattern of one struct owning one resource
//! directory with atomic writes.

use crate::error::{DatacatError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    tokens: f64,
    last_refill_ms: i64,
    ban_until_ms: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A process-shared token bucket backed by a JSON file under `dir/rate_limit_state.json`,
/// guarded by an OS lock file `dir/rate_limit.lock` for the read-modify-write cycle.
pub struct RateLimiter {
    dir: PathBuf,
    capacity: f64,
    refill_per_sec: f64,
    semaphore: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(dir: impl AsRef<Path>, rate_per_minute: u32, max_concurrent: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| DatacatError::config(e.to_string()))?;
        Ok(Self {
            dir,
            capacity: rate_per_minute as f64,
            refill_per_sec: rate_per_minute as f64 / 60.0,
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("rate_limit.lock")
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("rate_limit_state.json")
    }

    fn lock_file(&self) -> Result<File> {
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| DatacatError::config(e.to_string()))?;
        f.lock_exclusive().map_err(|e| DatacatError::config(e.to_string()))?;
        Ok(f)
    }

    /// A never-touched bucket starts full (spec §4.1), not empty — an operator
    /// starting a fresh `data_dir` shouldn't pay the refill time of a cold bucket.
    fn initial_state(&self) -> PersistedState {
        PersistedState {
            tokens: self.capacity,
            last_refill_ms: now_ms(),
            ban_until_ms: 0,
        }
    }

    fn read_state(&self) -> PersistedState {
        let Ok(mut f) = File::open(self.state_path()) else {
            return self.initial_state();
        };
        let mut buf = String::new();
        if f.read_to_string(&mut buf).is_err() {
            return self.initial_state();
        }
        serde_json::from_str(&buf).unwrap_or_else(|_| self.initial_state())
    }

    /// Writes `state` via a temp file + rename so a concurrent reader never observes
    /// a half-written file (spec §4.1 "atomic write-temp-then-rename").
    fn write_state(&self, state: &PersistedState) -> Result<()> {
        let tmp = self.dir.join(format!("rate_limit_state.{}.tmp", std::process::id()));
        let body = serde_json::to_string(state).map_err(|e| DatacatError::config(e.to_string()))?;
        {
            let mut f = File::create(&tmp).map_err(|e| DatacatError::config(e.to_string()))?;
            f.write_all(body.as_bytes()).map_err(|e| DatacatError::config(e.to_string()))?;
            f.sync_all().map_err(|e| DatacatError::config(e.to_string()))?;
        }
        std::fs::rename(&tmp, self.state_path()).map_err(|e| DatacatError::config(e.to_string()))?;
        Ok(())
    }

    fn refill(&self, state: &mut PersistedState) {
        let now = now_ms();
        let elapsed_secs = ((now - state.last_refill_ms).max(0) as f64) / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        state.last_refill_ms = now;
    }

    /// How long the caller must sleep before a token is available, `None` if one is
    /// available now. Returns `Some` covering the remaining ban too.
    fn try_reserve(&self) -> Result<Option<Duration>> {
        let lock = self.lock_file()?;
        let mut state = self.read_state();
        self.refill(&mut state);

        let now = now_ms();
        if state.ban_until_ms > now {
            let wait = (state.ban_until_ms - now) as u64;
            self.write_state(&state)?;
            lock.unlock().ok();
            return Ok(Some(Duration::from_millis(wait)));
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.write_state(&state)?;
            lock.unlock().ok();
            Ok(None)
        } else {
            let deficit = 1.0 - state.tokens;
            let wait_secs = deficit / self.refill_per_sec;
            // Persist the refilled-but-still-short state so the next retry resumes
            // from here instead of re-reading a missing file as a fresh bucket.
            self.write_state(&state)?;
            lock.unlock().ok();
            Ok(Some(Duration::from_secs_f64(wait_secs.max(0.0))))
        }
    }

    /// Acquires a concurrency permit first, then the token bucket, retrying the
    /// latter after the computed backoff until a token is free and any ban has
    /// lapsed (spec §4.1's exact step order: ban check, then semaphore, then
    /// token refill/reserve — taking the semaphore first bounds in-flight
    /// requests even while many callers are backed off waiting on tokens).
    pub async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DatacatError::config(e.to_string()))?;
        loop {
            match self.try_reserve()? {
                None => break,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
        Ok(permit)
    }

    /// Records a ban given as a delay from now (HTTP 429's `Retry-After` header),
    /// honoured by every process sharing this directory (spec §8 S5).
    pub fn record_ban(&self, retry_after: Duration) -> Result<()> {
        self.set_ban_until(now_ms() + retry_after.as_millis() as i64)
    }

    /// `set_ban(until_epoch_seconds)`: atomically raises the ban deadline to
    /// `max(current, until)` (spec §4.1). Used for HTTP 418, whose body carries an
    /// absolute `banned until <unix_ms>` deadline rather than a relative delay.
    pub fn set_ban_until(&self, until_ms: i64) -> Result<()> {
        let lock = self.lock_file()?;
        let mut state = self.read_state();
        state.ban_until_ms = state.ban_until_ms.max(until_ms);
        self.write_state(&state)?;
        lock.unlock().ok();
        Ok(())
    }

    pub fn banned_until_ms(&self) -> i64 {
        self.read_state().ban_until_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_with_fresh_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(dir.path(), 1200, 20).unwrap();
        let _permit = limiter.acquire().await.unwrap();
    }

    #[test]
    fn ban_is_persisted_and_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(dir.path(), 1200, 20).unwrap();
        limiter.record_ban(Duration::from_secs(30)).unwrap();
        assert!(limiter.banned_until_ms() > now_ms());
    }

    #[test]
    fn fresh_bucket_starts_full_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(dir.path(), 120, 20).unwrap();
        assert_eq!(limiter.read_state().tokens, 120.0);
    }

    #[test]
    fn state_survives_a_second_handle_on_the_same_dir() {
        let dir = tempfile::tempdir().unwrap();
        let a = RateLimiter::new(dir.path(), 60, 20).unwrap();
        a.try_reserve().unwrap();
        let b = RateLimiter::new(dir.path(), 60, 20).unwrap();
        let state = b.read_state();
        assert!(state.tokens < 60.0);
    }
}
