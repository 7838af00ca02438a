//! Per-session file list with fuzzy search.
//!
//! The list comes from the session's `ripgrep --files` RPC and is cached for
//! a TTL. Rebuilds hold a per-session async lock and re-check freshness
//! after acquiring it, so concurrent searches trigger one rebuild.

use crate::encryption::Encryption;
use crate::error::{SyncError, SyncResult};
use crate::socket::{self, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_protocol::rpc::{Ripgrep, RipgrepParams};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Source of a session's file list.
#[async_trait]
pub trait FileLister: Send + Sync {
    async fn list_files(&self, session_id: &str) -> SyncResult<Vec<String>>;
}

/// Lists files through the session's `ripgrep` RPC.
pub struct RipgrepLister {
    transport: Arc<dyn Transport>,
    encryption: Arc<Encryption>,
}

impl RipgrepLister {
    pub fn new(transport: Arc<dyn Transport>, encryption: Arc<Encryption>) -> Self {
        Self {
            transport,
            encryption,
        }
    }
}

#[async_trait]
impl FileLister for RipgrepLister {
    async fn list_files(&self, session_id: &str) -> SyncResult<Vec<String>> {
        let params = RipgrepParams {
            args: vec!["--files".to_string(), "--follow".to_string()],
            cwd: None,
        };
        let result =
            socket::rpc::<Ripgrep>(self.transport.as_ref(), &self.encryption, session_id, &params)
                .await?;
        if !result.success {
            return Err(SyncError::Rpc {
                method: "ripgrep".to_string(),
                message: result
                    .error
                    .unwrap_or_else(|| result.stderr.trim().to_string()),
            });
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub path: String,
    pub score: i64,
}

struct Cached {
    files: Arc<Vec<String>>,
    built_at: Instant,
    /// Slot generation the list was fetched under.
    generation: u64,
}

#[derive(Default)]
struct Slot {
    /// Bumped by every invalidate.
    generation: AtomicU64,
    cached: Mutex<Option<Cached>>,
}

pub struct FileSearchIndex {
    lister: Arc<dyn FileLister>,
    ttl: Duration,
    slots: DashMap<String, Arc<Slot>>,
}

impl FileSearchIndex {
    pub fn new(lister: Arc<dyn FileLister>, ttl: Duration) -> Self {
        Self {
            lister,
            ttl,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, session_id: &str) -> Arc<Slot> {
        self.slots
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Mark the session's list stale; the next search rebuilds it.
    pub fn invalidate(&self, session_id: &str) {
        if let Some(slot) = self.slots.get(session_id) {
            slot.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Forget a session entirely.
    pub fn remove(&self, session_id: &str) {
        self.slots.remove(session_id);
    }

    /// The session's file list, rebuilt if stale or expired.
    pub async fn files(&self, session_id: &str) -> SyncResult<Arc<Vec<String>>> {
        let slot = self.slot(session_id);
        let mut cached = slot.cached.lock().await;
        let generation = slot.generation.load(Ordering::SeqCst);
        if let Some(entry) = cached.as_ref()
            && entry.generation == generation
            && entry.built_at.elapsed() < self.ttl
        {
            return Ok(entry.files.clone());
        }

        // Tagged with the generation read before listing, so an invalidate
        // during the rebuild still forces the next one. A failed listing
        // leaves the old entry stale.
        let files = Arc::new(self.lister.list_files(session_id).await?);
        tracing::debug!(session_id = %session_id, count = files.len(), "file index rebuilt");
        *cached = Some(Cached {
            files: files.clone(),
            built_at: Instant::now(),
            generation,
        });
        Ok(files)
    }

    /// Best `limit` matches for `query`, highest score first.
    pub async fn search(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> SyncResult<Vec<FileMatch>> {
        let files = self.files(session_id).await?;
        let mut matches: Vec<FileMatch> = files
            .iter()
            .filter_map(|path| {
                fuzzy_score(path, query).map(|score| FileMatch {
                    path: path.clone(),
                    score,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.path.len().cmp(&b.path.len()))
                .then_with(|| a.path.cmp(&b.path))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

/// Case-insensitive subsequence score, or `None` if `query` is not a
/// subsequence of `path`. Consecutive runs, word starts and hits inside the
/// file name score higher.
pub fn fuzzy_score(path: &str, query: &str) -> Option<i64> {
    let query: Vec<char> = query
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    if query.is_empty() {
        return Some(0);
    }

    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    let mut score = 0i64;
    let mut qi = 0;
    let mut prev_match: Option<usize> = None;
    let mut prev_char: Option<char> = None;

    for (i, c) in path.char_indices() {
        if qi == query.len() {
            break;
        }
        let lower = c.to_lowercase().next().unwrap_or(c);
        if lower == query[qi] {
            score += 1;
            if prev_match.is_some_and(|p| p + prev_char.map_or(1, char::len_utf8) == i) {
                score += 5;
            }
            if matches!(prev_char, None | Some('/' | '_' | '-' | '.' | ' ')) {
                score += 3;
            }
            if i >= name_start {
                score += 2;
            }
            prev_match = Some(i);
            qi += 1;
        }
        prev_char = Some(c);
    }

    (qi == query.len()).then_some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct CountingLister {
        calls: AtomicUsize,
        files: Vec<String>,
    }

    #[async_trait]
    impl FileLister for CountingLister {
        async fn list_files(&self, _session_id: &str) -> SyncResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(self.files.clone())
        }
    }

    /// Serves scripted listings in order.
    struct ScriptedLister {
        calls: AtomicUsize,
        results: std::sync::Mutex<VecDeque<SyncResult<Vec<String>>>>,
    }

    #[async_trait]
    impl FileLister for ScriptedLister {
        async fn list_files(&self, _session_id: &str) -> SyncResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(SyncError::Disconnected))
        }
    }

    fn index() -> (Arc<CountingLister>, Arc<FileSearchIndex>) {
        let lister = Arc::new(CountingLister {
            calls: AtomicUsize::new(0),
            files: vec![
                "src/main.rs".to_string(),
                "src/socket.rs".to_string(),
                "docs/session-sync.md".to_string(),
                "README.md".to_string(),
            ],
        });
        let index = Arc::new(FileSearchIndex::new(lister.clone(), Duration::from_secs(30)));
        (lister, index)
    }

    #[test]
    fn subsequence_scoring() {
        assert_eq!(fuzzy_score("src/main.rs", "xyz"), None);
        assert!(fuzzy_score("src/main.rs", "mn").is_some());
        let contiguous = fuzzy_score("src/socket.rs", "sock").unwrap();
        let scattered = fuzzy_score("docs/session-sync.md", "sock").unwrap_or(0);
        assert!(contiguous > scattered);
        assert_eq!(fuzzy_score("anything", "  "), Some(0));
        assert!(fuzzy_score("README.md", "readme").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_searches_collapse_into_one_rebuild() {
        let (lister, index) = index();
        let a = {
            let index = index.clone();
            tokio::spawn(async move { index.search("s1", "main", 5).await })
        };
        let b = {
            let index = index.clone();
            tokio::spawn(async move { index.search("s1", "sock", 5).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a[0].path, "src/main.rs");
        assert_eq!(b[0].path, "src/socket.rs");
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_and_invalidate_force_rebuild() {
        let (lister, index) = index();
        index.files("s1").await.unwrap();
        index.files("s1").await.unwrap();
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);

        index.invalidate("s1");
        index.files("s1").await.unwrap();
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        index.files("s1").await.unwrap();
        assert_eq!(lister.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rebuild_keeps_the_list_stale() {
        let lister = Arc::new(ScriptedLister {
            calls: AtomicUsize::new(0),
            results: std::sync::Mutex::new(VecDeque::from([
                Ok(vec!["old.rs".to_string()]),
                Err(SyncError::Disconnected),
                Ok(vec!["new.rs".to_string()]),
            ])),
        });
        let index = FileSearchIndex::new(lister.clone(), Duration::from_secs(30));
        assert_eq!(*index.files("s1").await.unwrap(), ["old.rs"]);

        index.invalidate("s1");
        assert!(index.files("s1").await.is_err());
        assert_eq!(*index.files("s1").await.unwrap(), ["new.rs"]);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_during_rebuild_forces_another() {
        let (lister, index) = index();
        let rebuild = {
            let index = index.clone();
            tokio::spawn(async move { index.files("s1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        index.invalidate("s1");
        rebuild.await.unwrap().unwrap();

        index.files("s1").await.unwrap();
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);
    }
}
