use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::review_schema::{ReviewResult, ValidationResult};
use crate::store::KvStore;

pub const DEFAULT_HISTORY_CAP: usize = 500;
pub const REVIEW_HISTORY_KEY: &str = "review-history";
pub const VALIDATION_HISTORY_KEY: &str = "validation-history";

/// A result that can be filed under an issue/PR number and ordered in time.
pub trait Recorded {
    fn entity_number(&self) -> u64;
    fn recorded_at(&self) -> DateTime<Utc>;
}

impl Recorded for ReviewResult {
    fn entity_number(&self) -> u64 {
        self.pr_number
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.reviewed_at
    }
}

impl Recorded for ValidationResult {
    fn entity_number(&self) -> u64 {
        self.issue_number
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.validated_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry<T> {
    pub id: String,
    pub repository: String,
    #[serde(flatten)]
    pub result: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub repository: Option<String>,
    pub entity_number: Option<u64>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn for_entity(repository: &str, entity_number: u64) -> Self {
        Self {
            repository: Some(repository.to_string()),
            entity_number: Some(entity_number),
            limit: None,
        }
    }

    fn matches<T: Recorded>(&self, entry: &HistoryEntry<T>) -> bool {
        self.repository
            .as_deref()
            .is_none_or(|repo| entry.repository == repo)
            && self
                .entity_number
                .is_none_or(|n| entry.result.entity_number() == n)
    }
}

/// Append-only, capped log of past results, stored newest-first under one key.
pub struct HistoryStore<T> {
    store: Arc<dyn KvStore>,
    key: String,
    cap: usize,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HistoryStore<T>
where
    T: Recorded + Clone + Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>, cap: usize) -> Self {
        Self {
            store,
            key: key.into(),
            cap: cap.max(1),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Stored entries as raw JSON, newest first. Entries this build cannot
    /// read are kept so that writes carry them through untouched.
    fn load_raw(&self) -> Result<Vec<Value>> {
        match self.store.get(&self.key)? {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(Error::History(format!("stored {} is not a list", self.key))),
        }
    }

    fn load(&self) -> Result<Vec<HistoryEntry<T>>> {
        Ok(self
            .load_raw()?
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<HistoryEntry<T>>(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = self.key, error = %e, "skipping unreadable history entry");
                    None
                }
            })
            .collect())
    }

    fn persist(&self, entries: Vec<Value>) -> Result<()> {
        self.store.set(&self.key, Value::Array(entries))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::History("history lock poisoned".to_string()))
    }

    /// Record a result under a fresh id. At capacity the oldest entries are evicted.
    pub fn save(&self, repository: &str, result: T) -> Result<HistoryEntry<T>> {
        let _guard = self.lock()?;
        let mut entries = self.load_raw()?;
        let entry = HistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            repository: repository.to_string(),
            result,
        };
        let value = serde_json::to_value(&entry)
            .map_err(|e| Error::History(format!("failed to serialize history entry: {e}")))?;
        entries.insert(0, value);
        if entries.len() > self.cap {
            let evicted = entries.len() - self.cap;
            entries.truncate(self.cap);
            debug!(key = self.key, evicted, "history at capacity, evicted oldest entries");
        }
        self.persist(entries)?;
        Ok(entry)
    }

    /// Matching entries, newest first.
    pub fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry<T>>> {
        let mut entries: Vec<_> = self
            .load()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.result.recorded_at()));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn get(&self, id: &str) -> Result<Option<HistoryEntry<T>>> {
        Ok(self.load()?.into_iter().find(|e| e.id == id))
    }

    pub fn get_latest(&self, repository: &str, entity_number: u64) -> Result<Option<HistoryEntry<T>>> {
        let filter = HistoryFilter {
            limit: Some(1),
            ..HistoryFilter::for_entity(repository, entity_number)
        };
        Ok(self.list(&filter)?.into_iter().next())
    }

    /// Entries for one PR/issue, oldest first, trimmed to the most recent `limit`.
    pub fn get_chain(
        &self,
        repository: &str,
        entity_number: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry<T>>> {
        let mut chain = self.list(&HistoryFilter::for_entity(repository, entity_number))?;
        chain.reverse();
        if chain.len() > limit {
            chain.drain(..chain.len() - limit);
        }
        Ok(chain)
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let mut entries = self.load_raw()?;
        let before = entries.len();
        entries.retain(|e| raw_field(e, "id") != Some(id));
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(entries)?;
        Ok(true)
    }

    /// Remove every entry for `repository`, or everything when `None`.
    /// Returns the number of entries removed.
    pub fn clear(&self, repository: Option<&str>) -> Result<usize> {
        let _guard = self.lock()?;
        let mut entries = self.load_raw()?;
        let before = entries.len();
        match repository {
            Some(repo) => entries.retain(|e| raw_field(e, "repository") != Some(repo)),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        self.persist(entries)?;
        Ok(removed)
    }
}

fn raw_field<'a>(entry: &'a Value, field: &str) -> Option<&'a str> {
    entry.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review_schema::AgentUsage;
    use crate::store::{JsonFileStore, MemoryStore};
    use chrono::Duration;

    fn review(pr: u64, minutes: i64, score: f64) -> ReviewResult {
        ReviewResult {
            pr_number: pr,
            pr_title: format!("PR {pr}"),
            summary: "ok".to_string(),
            score,
            findings: vec![],
            sub_agent_scores: vec![],
            inline_comments: vec![],
            dropped_comments: vec![],
            reviewed_at: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes),
            usage: AgentUsage::default(),
            commit_sha: None,
            review_sequence: 1,
            is_re_review: false,
            previous_review_id: None,
            previous_score: None,
        }
    }

    fn memory_history(cap: usize) -> HistoryStore<ReviewResult> {
        HistoryStore::new(Arc::new(MemoryStore::new()), REVIEW_HISTORY_KEY, cap)
    }

    #[test]
    fn test_save_assigns_unique_ids() {
        let history = memory_history(10);
        let a = history.save("o/r", review(1, 0, 7.0)).unwrap();
        let b = history.save("o/r", review(1, 1, 7.0)).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(history.get(&a.id).unwrap().unwrap().result.score, 7.0);
    }

    #[test]
    fn test_list_newest_first_with_filters() {
        let history = memory_history(10);
        history.save("o/r", review(1, 0, 5.0)).unwrap();
        history.save("o/r", review(2, 1, 6.0)).unwrap();
        history.save("o/other", review(1, 2, 7.0)).unwrap();
        history.save("o/r", review(1, 3, 8.0)).unwrap();

        let all = history.list(&HistoryFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].result.score, 8.0);

        let pr1 = history.list(&HistoryFilter::for_entity("o/r", 1)).unwrap();
        let scores: Vec<f64> = pr1.iter().map(|e| e.result.score).collect();
        assert_eq!(scores, vec![8.0, 5.0]);

        let repo_only = HistoryFilter {
            repository: Some("o/r".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(history.list(&repo_only).unwrap().len(), 2);
    }

    #[test]
    fn test_list_sorts_by_timestamp_not_insertion() {
        let history = memory_history(10);
        history.save("o/r", review(1, 10, 1.0)).unwrap();
        history.save("o/r", review(1, 5, 2.0)).unwrap();
        let latest = history.get_latest("o/r", 1).unwrap().unwrap();
        assert_eq!(latest.result.score, 1.0);
    }

    #[test]
    fn test_get_latest_none_for_unknown() {
        let history = memory_history(10);
        assert!(history.get_latest("o/r", 9).unwrap().is_none());
    }

    #[test]
    fn test_chain_is_oldest_first_and_keeps_recent_tail() {
        let history = memory_history(10);
        for (i, score) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            history.save("o/r", review(7, i as i64, score)).unwrap();
        }
        history.save("o/r", review(8, 9, 9.0)).unwrap();

        let chain = history.get_chain("o/r", 7, 10).unwrap();
        let scores: Vec<f64> = chain.iter().map(|e| e.result.score).collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0]);

        let tail = history.get_chain("o/r", 7, 2).unwrap();
        let scores: Vec<f64> = tail.iter().map(|e| e.result.score).collect();
        assert_eq!(scores, vec![3.0, 4.0]);
    }

    #[test]
    fn test_cap_evicts_oldest_globally() {
        let history = memory_history(3);
        history.save("o/a", review(1, 0, 1.0)).unwrap();
        history.save("o/b", review(2, 1, 2.0)).unwrap();
        history.save("o/b", review(2, 2, 3.0)).unwrap();
        history.save("o/b", review(2, 3, 4.0)).unwrap();

        let all = history.list(&HistoryFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(history.list(&HistoryFilter::for_entity("o/a", 1)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_clear() {
        let history = memory_history(10);
        let a = history.save("o/a", review(1, 0, 1.0)).unwrap();
        history.save("o/a", review(2, 1, 2.0)).unwrap();
        history.save("o/b", review(3, 2, 3.0)).unwrap();

        assert!(history.delete(&a.id).unwrap());
        assert!(!history.delete(&a.id).unwrap());
        assert_eq!(history.clear(Some("o/a")).unwrap(), 1);
        assert_eq!(history.list(&HistoryFilter::default()).unwrap().len(), 1);
        assert_eq!(history.clear(None).unwrap(), 1);
        assert!(history.list(&HistoryFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_entries_survive_reopen_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let id = {
            let store = Arc::new(JsonFileStore::new(dir.path()));
            let history: HistoryStore<ReviewResult> =
                HistoryStore::new(store, REVIEW_HISTORY_KEY, 10);
            history.save("o/r", review(4, 0, 6.5)).unwrap().id
        };
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let history: HistoryStore<ReviewResult> = HistoryStore::new(store, REVIEW_HISTORY_KEY, 10);
        let entry = history.get(&id).unwrap().unwrap();
        assert_eq!(entry.repository, "o/r");
        assert_eq!(entry.result.pr_number, 4);
    }

    #[test]
    fn test_unreadable_entries_are_kept_on_write() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                REVIEW_HISTORY_KEY,
                serde_json::json!([{"id": "future-format", "repository": "o/r", "verdictV2": 3}]),
            )
            .unwrap();
        let history: HistoryStore<ReviewResult> =
            HistoryStore::new(Arc::clone(&store) as Arc<dyn KvStore>, REVIEW_HISTORY_KEY, 10);
        assert!(history.list(&HistoryFilter::default()).unwrap().is_empty());

        let saved = history.save("o/r", review(1, 0, 5.0)).unwrap();
        assert_eq!(history.list(&HistoryFilter::default()).unwrap().len(), 1);

        let raw = store.get(REVIEW_HISTORY_KEY).unwrap().unwrap();
        let ids: Vec<&str> = raw
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["id"].as_str())
            .collect();
        assert_eq!(ids, vec![saved.id.as_str(), "future-format"]);

        assert!(history.delete("future-format").unwrap());
        assert_eq!(store.get(REVIEW_HISTORY_KEY).unwrap().unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_store_fails_save_without_overwriting() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("review-history.json"), "[{ truncated").unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let history: HistoryStore<ReviewResult> = HistoryStore::new(store, REVIEW_HISTORY_KEY, 10);

        assert!(history.save("o/r", review(1, 0, 5.0)).is_err());
        let moved_aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("review-history.json.corrupt-"));
        assert!(moved_aside);
    }

    #[test]
    fn test_non_list_history_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.set(REVIEW_HISTORY_KEY, serde_json::json!({"oops": true})).unwrap();
        let history: HistoryStore<ReviewResult> = HistoryStore::new(store, REVIEW_HISTORY_KEY, 10);
        assert!(history.save("o/r", review(1, 0, 5.0)).is_err());
        assert!(history.list(&HistoryFilter::default()).is_err());
    }
}
