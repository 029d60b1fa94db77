//! Dataset loading and splitting for batch evaluation.
//!
//! A dataset file is a JSON array of [`Episode`] records.  Splits are
//! contiguous chunks of the id-sorted episode list; when the count does not
//! divide evenly the first chunks get one extra episode, so every episode
//! belongs to exactly one split.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use subnav_types::{Episode, NavError};

pub fn load(path: &Path) -> Result<Vec<Episode>, NavError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        NavError::Configuration(format!("failed to read dataset {}: {e}", path.display()))
    })?;
    parse(&raw)
}

pub fn parse(raw: &str) -> Result<Vec<Episode>, NavError> {
    let episodes: Vec<Episode> = serde_json::from_str(raw)
        .map_err(|e| NavError::Configuration(format!("invalid dataset: {e}")))?;
    if episodes.is_empty() {
        return Err(NavError::Configuration("dataset has no episodes".into()));
    }
    Ok(episodes)
}

/// Numeric ids compare as numbers, everything else lexically.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Chunk `split_id` (0-based) of `split_num`.
pub fn split(
    mut episodes: Vec<Episode>,
    split_num: usize,
    split_id: usize,
) -> Result<Vec<Episode>, NavError> {
    if split_num == 0 {
        return Err(NavError::Configuration("split-num must be positive".into()));
    }
    if split_id >= split_num {
        return Err(NavError::Configuration(format!(
            "split-id {split_id} out of range for {split_num} splits"
        )));
    }
    episodes.sort_by(|a, b| compare_ids(&a.episode_id, &b.episode_id));

    let base = episodes.len() / split_num;
    let extra = episodes.len() % split_num;
    let start = split_id * base + split_id.min(extra);
    let len = base + usize::from(split_id < extra);
    Ok(episodes.into_iter().skip(start).take(len).collect())
}

pub fn find<'e>(episodes: &'e [Episode], episode_id: &str) -> Option<&'e Episode> {
    episodes.iter().find(|e| e.episode_id == episode_id)
}
