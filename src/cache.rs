// ===============================
// src/cache.rs
// ===============================
//
// Shared rolling-window market data.
//
// - One writer at a time: `append` holds the writer mutex while it merges,
//   derives daily bars and trims, all on writer-private maps.
// - Readers never see the writer maps. Each append that changes anything ends by
//   publishing a fresh immutable `MarketSnapshot` through a watch channel, so
//   `snapshot()` is an Arc clone of either the previous or the new state, never
//   a mix. A replay that changes nothing keeps the version and publishes nothing.
// - Observations of a day that is still open can be trimmed before the day is
//   promoted. Their open, close and volumes are folded into a carry bar that
//   seeds the daily bar once the day completes.
// - The network fetch that feeds `append` happens outside of all of this.
//
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::domain::{DailyBar, Observation};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Keep observations no older than this, relative to the newest one.
    pub max_age: Option<Duration>,
    /// Keep at most this many observations (all symbols together).
    pub max_rows: Option<usize>,
    /// Keep daily bars of at most this many trading days.
    pub max_days: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age: Some(Duration::days(14)), max_rows: None, max_days: 270 }
    }
}

/// Immutable published state. Observations are ordered by (timestamp, symbol),
/// daily bars by (date, symbol).
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub version: u64,
    pub observations: Vec<Observation>,
    pub daily: Vec<DailyBar>,
}

impl MarketSnapshot {
    pub fn is_empty(&self) -> bool { self.observations.is_empty() }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|o| o.timestamp)
    }

    pub fn latest_daily_date(&self) -> Option<NaiveDate> {
        self.daily.last().map(|b| b.date)
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.observations.iter().rev().find(|o| o.symbol == symbol).map(|o| o.price)
    }

    pub fn symbols(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.observations.iter().map(|o| o.symbol.as_str()).collect();
        set.into_iter().collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("no observations to append")]
    EmptyInput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendResult {
    pub inserted: usize,
    pub replaced: usize,
    pub daily_added: usize,
    pub evicted_observations: usize,
    pub evicted_daily: usize,
    /// Observations at or before the newest evicted key, ignored.
    pub stale: usize,
    pub version: u64,
}

impl AppendResult {
    fn changed_nothing(&self, modified: usize) -> bool {
        self.inserted == 0
            && modified == 0
            && self.daily_added == 0
            && self.evicted_observations == 0
            && self.evicted_daily == 0
    }
}

type ObsKey = (DateTime<Utc>, String);
type BarKey = (NaiveDate, String);

#[derive(Default)]
struct WriterState {
    observations: BTreeMap<ObsKey, Observation>,
    daily: BTreeMap<BarKey, DailyBar>,
    /// Partial bars of not yet promoted days, built from evicted observations.
    carry: BTreeMap<BarKey, DailyBar>,
    /// Newest key ever evicted.
    floor: Option<ObsKey>,
    /// Last date that has been aggregated into daily bars.
    promoted_through: Option<NaiveDate>,
    version: u64,
}

fn opening_bar(o: &Observation) -> DailyBar {
    DailyBar {
        symbol: o.symbol.clone(),
        date: o.date(),
        open: o.price,
        close: o.price,
        ask_volume: o.ask_volume,
        bid_volume: o.bid_volume,
    }
}

fn extend_bar(bar: &mut DailyBar, o: &Observation) {
    bar.close = o.price;
    bar.ask_volume += o.ask_volume;
    bar.bid_volume += o.bid_volume;
}

impl WriterState {
    /// Returns how many existing observations got a different value.
    fn merge(&mut self, batch: Vec<Observation>, res: &mut AppendResult) -> usize {
        let mut modified = 0;
        for o in batch {
            let key = (o.timestamp, o.symbol.clone());
            if self.floor.as_ref().is_some_and(|floor| key <= *floor) {
                res.stale += 1;
                continue;
            }
            match self.observations.get_mut(&key) {
                Some(existing) => {
                    res.replaced += 1;
                    if *existing != o {
                        *existing = o;
                        modified += 1;
                    }
                }
                None => {
                    self.observations.insert(key, o);
                    res.inserted += 1;
                }
            }
        }
        modified
    }

    fn retire(&mut self, key: ObsKey, o: Observation) {
        if self.promoted_through.map_or(true, |d| o.date() > d) {
            self.carry
                .entry((o.date(), o.symbol.clone()))
                .and_modify(|b| extend_bar(b, &o))
                .or_insert_with(|| opening_bar(&o));
        }
        if self.floor.as_ref().map_or(true, |f| key > *f) {
            self.floor = Some(key);
        }
    }

    /// Aggregates every day that is newer than the last promoted one and strictly older
    /// than the newest observation's day.
    fn derive_daily(&mut self) -> usize {
        let Some(latest_date) = self.observations.last_key_value().map(|((ts, _), _)| ts.date_naive()) else {
            return 0;
        };

        let lower = match self.promoted_through {
            Some(last_date) => match last_date.succ_opt() {
                Some(next) => Bound::Included((next.and_time(Default::default()).and_utc(), String::new())),
                None => return 0,
            },
            None => Bound::Unbounded,
        };

        // evicted observations precede every retained one, so carried bars come first
        let still_open = self.carry.split_off(&(latest_date, String::new()));
        let mut fresh = std::mem::replace(&mut self.carry, still_open);
        for o in self
            .observations
            .range((lower, Bound::Unbounded))
            .map(|(_, o)| o)
            .take_while(|o| o.date() < latest_date)
        {
            fresh
                .entry((o.date(), o.symbol.clone()))
                .and_modify(|b| extend_bar(b, o))
                .or_insert_with(|| opening_bar(o));
        }
        if let Some(((last, _), _)) = fresh.last_key_value() {
            self.promoted_through = self.promoted_through.max(Some(*last));
        }
        let n = fresh.len();
        self.daily.extend(fresh);
        n
    }

    fn enforce(&mut self, policy: &RetentionPolicy, res: &mut AppendResult) {
        let before = self.observations.len();
        let cutoff = policy
            .max_age
            .zip(self.observations.last_key_value().map(|((ts, _), _)| *ts))
            .map(|(age, latest)| (latest - age, String::new()));
        if let Some(cutoff) = cutoff {
            let kept = self.observations.split_off(&cutoff);
            let evicted = std::mem::replace(&mut self.observations, kept);
            for (key, o) in evicted {
                self.retire(key, o);
            }
        }
        if let Some(max_rows) = policy.max_rows {
            while self.observations.len() > max_rows {
                match self.observations.pop_first() {
                    Some((key, o)) => self.retire(key, o),
                    None => break,
                }
            }
        }
        res.evicted_observations = before - self.observations.len();

        let before = self.daily.len();
        if policy.max_days == 0 {
            self.daily.clear();
        } else {
            let dates: BTreeSet<NaiveDate> = self.daily.keys().map(|(d, _)| *d).collect();
            if let Some(first_kept) = dates.iter().rev().nth(policy.max_days - 1) {
                self.daily = self.daily.split_off(&(*first_kept, String::new()));
            }
        }
        res.evicted_daily = before - self.daily.len();
    }

    fn publishable(&self) -> MarketSnapshot {
        MarketSnapshot {
            version: self.version,
            observations: self.observations.values().cloned().collect(),
            daily: self.daily.values().cloned().collect(),
        }
    }
}

struct Inner {
    writer: Mutex<WriterState>,
    published: watch::Sender<Arc<MarketSnapshot>>,
    retention: RetentionPolicy,
    #[cfg(test)]
    publish_delay: Option<std::time::Duration>,
}

/// Cheap to clone handle; every clone refers to the same cache.
#[derive(Clone)]
pub struct MarketDataCache {
    inner: Arc<Inner>,
}

impl MarketDataCache {
    pub fn new(retention: RetentionPolicy) -> Self {
        let (published, _) = watch::channel(Arc::new(MarketSnapshot::default()));
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(WriterState::default()),
                published,
                retention,
                #[cfg(test)]
                publish_delay: None,
            }),
        }
    }

    /// Pauses between finishing the merge and publishing it.
    #[cfg(test)]
    fn with_publish_delay(retention: RetentionPolicy, delay: std::time::Duration) -> Self {
        let (published, _) = watch::channel(Arc::new(MarketSnapshot::default()));
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(WriterState::default()),
                published,
                retention,
                publish_delay: Some(delay),
            }),
        }
    }

    pub fn retention(&self) -> &RetentionPolicy { &self.inner.retention }

    pub async fn append(&self, batch: Vec<Observation>) -> Result<AppendResult, AppendError> {
        if batch.is_empty() {
            return Err(AppendError::EmptyInput);
        }
        let mut st = self.inner.writer.lock().await;
        let mut res = AppendResult::default();

        let modified = st.merge(batch, &mut res);
        res.daily_added = st.derive_daily();
        st.enforce(&self.inner.retention, &mut res);
        if res.changed_nothing(modified) {
            res.version = st.version;
            debug!(version = res.version, replaced = res.replaced, stale = res.stale, "cache unchanged");
            return Ok(res);
        }
        st.version += 1;
        res.version = st.version;

        let snap = Arc::new(st.publishable());

        #[cfg(test)]
        if let Some(d) = self.inner.publish_delay {
            tokio::time::sleep(d).await;
        }

        self.inner.published.send_replace(snap);
        debug!(
            version = res.version,
            inserted = res.inserted,
            replaced = res.replaced,
            daily_added = res.daily_added,
            evicted = res.evicted_observations,
            "cache published"
        );
        Ok(res)
    }

    pub fn snapshot(&self) -> Arc<MarketSnapshot> {
        self.inner.published.borrow().clone()
    }

    /// Receiver that is notified after every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.inner.published.subscribe()
    }
}
