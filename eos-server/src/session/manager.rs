//! Session manager (C6, §4.6): dedup-by-key lookup with destination
//! language-set semantics, plus an opaque UUIDv4 session-id index.
//!
//! Grounded on the teacher's `AppState` (`hls-vod-server/src/state.rs`):
//! a `DashMap`-indexed registry with a `cleanup_expired_streams` sweep.
//! Generalized here so the primary index key is the request's
//! `SessionKey` and dedup additionally considers the requested
//! destination-language set (§4.6): an exact match reuses the session,
//! a strict subset reuses the smallest superset session found, anything
//! else opens a new one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use eos_core::SessionKey;
use uuid::Uuid;

use super::session::Session;

/// Sessions idle (no request, no buffer activity) longer than this are
/// reaped by the background sweep (SPEC_FULL.md §C, resolving spec.md
/// §9 Open Question 2 — the source never evicts sessions at all).
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(1800);

#[derive(Default)]
struct KeyEntry {
    sessions: Vec<Arc<Session>>,
}

pub struct SessionManager {
    by_key: DashMap<SessionKey, KeyEntry>,
    by_id: DashMap<Uuid, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self { by_key: DashMap::new(), by_id: DashMap::new() }
    }

    /// Resolve or create a session for a **variant-manifest** request.
    pub fn resolve_for_variant(&self, key: &SessionKey, languages: &BTreeSet<String>, default_language: &str) -> Arc<Session> {
        let mut entry = self.by_key.entry(key.clone()).or_default();

        for session in entry.sessions.iter() {
            if session.languages() == *languages {
                session.touch();
                return session.clone();
            }
        }
        for session in entry.sessions.iter() {
            let existing = session.languages();
            if languages.is_subset(&existing) {
                session.touch();
                return session.clone();
            }
        }

        let session = Arc::new(Session::new(key.clone(), languages.clone(), default_language.to_string()));
        entry.sessions.push(session.clone());
        self.by_id.insert(session.id(), session.clone());
        session
    }

    /// Resolve for a **delayed-live child** request (§4.6): any existing
    /// session under the same key is acceptable.
    pub fn resolve_for_live_child(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.by_key.get(key).and_then(|e| e.sessions.first().cloned())
    }

    /// Resolve for a **subtitle manifest/fragment** request naming one
    /// `dst_lang` (§4.6: "the requested language must be a subset of
    /// some existing session"). Unlike [`Self::resolve_for_live_child`],
    /// several sessions can share a key with disjoint language sets
    /// (see `disjoint_language_set_opens_new_session`), so the right
    /// session must be picked by language membership rather than taking
    /// whichever happened to be created first.
    pub fn resolve_for_dst_lang(&self, key: &SessionKey, dst_lang: &str) -> Option<Arc<Session>> {
        let entry = self.by_key.get(key)?;
        entry
            .sessions
            .iter()
            .find(|s| s.languages().contains(dst_lang))
            .cloned()
            .or_else(|| entry.sessions.first().cloned())
    }

    pub fn by_id(&self, id: Uuid) -> Option<Arc<Session>> {
        self.by_id.get(&id).map(|r| r.clone())
    }

    pub fn session_count(&self) -> usize {
        self.by_id.len()
    }

    /// Reap sessions idle longer than [`SESSION_IDLE_TTL`]. Returns the
    /// number of sessions removed.
    pub fn sweep_idle(&self) -> usize {
        let mut removed = 0usize;
        self.by_key.retain(|_key, entry| {
            entry.sessions.retain(|s| {
                let keep = s.idle_for() < SESSION_IDLE_TTL;
                if !keep {
                    removed += 1;
                }
                keep
            });
            !entry.sessions.is_empty()
        });
        self.by_id.retain(|_, s| s.idle_for() < SESSION_IDLE_TTL);
        removed
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eos_core::{Mode, Protocol, Streaming};

    fn key() -> SessionKey {
        SessionKey::new("https://o/m.m3u8", Protocol::Hls, Streaming::Vod, Mode::Translate, "en")
    }

    fn langs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_language_set_match_reuses_session() {
        let mgr = SessionManager::new();
        let a = mgr.resolve_for_variant(&key(), &langs(&["de-DE", "es-ES"]), "de-DE");
        let b = mgr.resolve_for_variant(&key(), &langs(&["de-DE", "es-ES"]), "de-DE");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn subset_of_existing_session_reuses_it() {
        let mgr = SessionManager::new();
        let a = mgr.resolve_for_variant(&key(), &langs(&["de-DE", "es-ES", "fr-FR"]), "de-DE");
        let b = mgr.resolve_for_variant(&key(), &langs(&["de-DE"]), "de-DE");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn disjoint_language_set_opens_new_session() {
        let mgr = SessionManager::new();
        let a = mgr.resolve_for_variant(&key(), &langs(&["de-DE"]), "de-DE");
        let b = mgr.resolve_for_variant(&key(), &langs(&["ja-JP"]), "ja-JP");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn dst_lang_resolution_picks_matching_session_not_first() {
        let mgr = SessionManager::new();
        let ja = mgr.resolve_for_variant(&key(), &langs(&["ja-JP"]), "ja-JP");
        let de = mgr.resolve_for_variant(&key(), &langs(&["de-DE"]), "de-DE");
        assert_ne!(ja.id(), de.id());

        let resolved = mgr.resolve_for_dst_lang(&key(), "de-DE").unwrap();
        assert_eq!(resolved.id(), de.id());
        let resolved = mgr.resolve_for_dst_lang(&key(), "ja-JP").unwrap();
        assert_eq!(resolved.id(), ja.id());
    }

    #[test]
    fn different_session_key_always_opens_new_session() {
        let mgr = SessionManager::new();
        let other_key = SessionKey::new("https://o/other.m3u8", Protocol::Hls, Streaming::Vod, Mode::Translate, "en");
        let a = mgr.resolve_for_variant(&key(), &langs(&["de-DE"]), "de-DE");
        let b = mgr.resolve_for_variant(&other_key, &langs(&["de-DE"]), "de-DE");
        assert_ne!(a.id(), b.id());
    }
}
