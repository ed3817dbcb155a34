// Access-sequence model behind preload suggestions.

use std::collections::{HashMap, VecDeque};

const MAX_RECENT_ACCESSES: usize = 100;
const MAX_FOLLOWERS: usize = 20;
const RECENT_WINDOW: usize = 10;

const FOLLOWER_WEIGHT: f32 = 1.0;
const FREQUENCY_WEIGHT: f32 = 0.1;
const RECENCY_WEIGHT: f32 = 0.5;
const RECENCY_DECAY: f32 = 0.8;

#[derive(Debug, Default)]
struct AccessRecord {
    access_count: u32,
    /// Assets requested right after this one, oldest first.
    followers: VecDeque<String>,
}

/// Scores candidate assets from three signals: what usually follows the
/// current asset, overall access frequency, and how recently each was used.
#[derive(Debug, Default)]
pub struct PreloadPredictor {
    records: HashMap<String, AccessRecord>,
    recent: VecDeque<String>,
}

impl PreloadPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }

        self.records
            .entry(path.to_string())
            .or_default()
            .access_count += 1;

        if let Some(previous) = self.recent.back() {
            if let Some(record) = self.records.get_mut(previous) {
                if !record.followers.iter().any(|f| f == path) {
                    record.followers.push_back(path.to_string());
                    if record.followers.len() > MAX_FOLLOWERS {
                        record.followers.pop_front();
                    }
                }
            }
        }

        self.recent.push_back(path.to_string());
        if self.recent.len() > MAX_RECENT_ACCESSES {
            self.recent.pop_front();
        }
    }

    /// Up to `max_count` assets likely to be requested after `current`, best first.
    pub fn predict(&self, current: &str, max_count: usize) -> Vec<String> {
        let mut scores: HashMap<&str, f32> = HashMap::new();

        if let Some(record) = self.records.get(current) {
            for next in record.followers.iter().filter(|f| *f != current) {
                *scores.entry(next).or_default() += FOLLOWER_WEIGHT;
            }
        }

        let mut frequent: Vec<(&String, &AccessRecord)> = self.records.iter().collect();
        frequent.sort_by(|a, b| {
            b.1.access_count
                .cmp(&a.1.access_count)
                .then_with(|| a.0.cmp(b.0))
        });
        for (path, record) in frequent.into_iter().take(max_count * 2) {
            if path == current {
                continue;
            }
            *scores.entry(path).or_default() += record.access_count as f32 * FREQUENCY_WEIGHT;
        }

        let mut weight = RECENCY_WEIGHT;
        for path in self.recent.iter().rev().take(RECENT_WINDOW) {
            if path == current {
                continue;
            }
            *scores.entry(path).or_default() += weight;
            weight *= RECENCY_DECAY;
        }

        let mut ranked: Vec<(&str, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        ranked
            .into_iter()
            .take(max_count)
            .map(|(path, _)| path.to_string())
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.recent.clear();
    }
}
