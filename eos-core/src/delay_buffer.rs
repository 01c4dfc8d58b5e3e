//! Live delay buffer (§4.4): one per origin media playlist (HLS) or per
//! AdaptationSet (DASH). Tracks newly appearing fragments and exposes a
//! time-shifted ("delayed live") view lagging the origin by `D` seconds.
//!
//! The buffer is shared between a polling task and request handlers;
//! mutation is serialized by a per-buffer reentrant mutex held for the
//! whole poll and for the whole view emission (§4.4 concurrency
//! contract, §5).

use std::cell::RefCell;
use std::collections::VecDeque;

use parking_lot::ReentrantMutex;

use crate::error::{CoreError, Result};
use crate::types::Fragment;

struct Inner {
    fragments: VecDeque<Fragment>,
    max_order_key: Option<u64>,
    last_playlist_window_secs: f64,
    polled_once: bool,
}

/// A time-shift buffer for one origin rendition.
pub struct DelayBuffer {
    delay_secs: f64,
    inner: ReentrantMutex<RefCell<Inner>>,
}

/// A delayed-live slice of the buffer, ready to be re-emitted as a
/// playlist/MPD timeline.
#[derive(Debug, Clone)]
pub struct DelayedView {
    pub fragments: Vec<Fragment>,
    /// Sequence number (HLS) / first timestamp (DASH) of `fragments[0]`.
    pub first_order_key: Option<u64>,
}

impl DelayBuffer {
    pub fn new(delay_secs: f64) -> Self {
        Self {
            delay_secs,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                fragments: VecDeque::new(),
                max_order_key: None,
                last_playlist_window_secs: 0.0,
                polled_once: false,
            })),
        }
    }

    /// Ingest the fragments observed in one poll of the origin
    /// playlist/MPD. `new_fragments` must already be in ascending
    /// `order_key()` order (the order C2/C3 parsing naturally produces).
    /// Fragments whose `order_key()` does not exceed the buffer's
    /// current maximum are skipped — once observed, a fragment is never
    /// renumbered (§3 StreamBuffer invariant).
    pub fn poll_update(&self, new_fragments: Vec<Fragment>, playlist_window_secs: f64) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let is_first_poll = !inner.polled_once;
        inner.polled_once = true;

        for mut frag in new_fragments {
            let key = frag.order_key();
            if let Some(max) = inner.max_order_key {
                if key <= max {
                    continue;
                }
            }
            if let Some(max) = inner.max_order_key {
                if key != max + 1 && !frag.discontinuity {
                    // A gap in sequence/timestamp without an announced
                    // discontinuity: still accept it (origin renumbering
                    // is out of our control) but do not treat it as an error.
                }
            }
            frag.first_read = is_first_poll;
            inner.max_order_key = Some(key);
            inner.fragments.push_back(frag);
        }

        inner.last_playlist_window_secs = playlist_window_secs;

        // Evict the oldest fragment while retained duration exceeds D + 2*window.
        let threshold = self.delay_secs + 2.0 * playlist_window_secs;
        let mut evicted = 0u32;
        loop {
            let retained = Self::retained_duration(&inner.fragments);
            if retained <= threshold {
                break;
            }
            if inner.fragments.len() <= 1 {
                break;
            }
            inner.fragments.pop_front();
            evicted += 1;
        }

        tracing::trace!(
            delay_secs = self.delay_secs,
            retained = inner.fragments.len(),
            evicted,
            "delay buffer polled"
        );

        Ok(())
    }

    fn retained_duration(fragments: &VecDeque<Fragment>) -> f64 {
        match (fragments.front(), fragments.back()) {
            (Some(first), Some(last)) => last.end_time() - first.start_time,
            _ => 0.0,
        }
    }

    /// Emit a delayed view: walk from newest to oldest accumulating
    /// duration until it reaches `D` (the end boundary), then walk
    /// forward from the buffer head discarding whatever exceeds
    /// `D + playlist_window` (the start boundary).
    pub fn view(&self) -> Result<DelayedView> {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        if inner.fragments.is_empty() {
            return Ok(DelayedView { fragments: Vec::new(), first_order_key: None });
        }

        let newest_end = inner.fragments.back().unwrap().end_time();

        // end_index: walk newest -> oldest until accumulated span reaches D.
        let mut end_index = inner.fragments.len() - 1;
        for (idx, frag) in inner.fragments.iter().enumerate().rev() {
            end_index = idx;
            if newest_end - frag.start_time >= self.delay_secs {
                break;
            }
        }

        // start_index: walk forward, discarding what would push retained
        // duration above D + playlist_window.
        let max_span = self.delay_secs + inner.last_playlist_window_secs;
        let end_time = inner.fragments[end_index].end_time();
        let mut start_index = 0usize;
        for (idx, frag) in inner.fragments.iter().enumerate() {
            if idx > end_index {
                break;
            }
            if end_time - frag.start_time <= max_span {
                start_index = idx;
                break;
            }
        }
        if start_index > end_index {
            start_index = end_index;
        }

        let slice: Vec<Fragment> = inner
            .fragments
            .iter()
            .skip(start_index)
            .take(end_index - start_index + 1)
            .cloned()
            .collect();
        let first_order_key = slice.first().map(|f| f.order_key());

        Ok(DelayedView { fragments: slice, first_order_key })
    }

    /// True once [`view`] can return a non-empty slice whose oldest
    /// fragment satisfies `start_time <= now - D` (invariant 2), i.e.
    /// the buffer has accumulated at least `D` seconds of content.
    pub fn has_enough_delay(&self) -> bool {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        Self::retained_duration(&inner.fragments) >= self.delay_secs
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        guard.borrow().fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fragments whose `order_key()` exceeds `after`, oldest first. Used
    /// by the transcription pipeline's live ingestion loop to pull
    /// newly-arrived fragments without re-processing ones it has already
    /// fed the recognizer (§4.8 "live: consume fragments from the delay
    /// buffer via a listener queue"). Kept on `DelayBuffer` itself, not a
    /// push-based listener registry, so this crate stays free of an
    /// async runtime dependency; the caller is expected to poll this
    /// periodically from a tokio task.
    pub fn fragments_since(&self, after: Option<u64>) -> Vec<Fragment> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .fragments
            .iter()
            .filter(|f| after.map(|a| f.order_key() > a).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Validate invariant 1 of spec §8: for every fragment and every later
/// fragment in a buffer's history, order keys strictly increase. Exposed
/// for tests and for defensive assertions in the transcription pipeline.
pub fn assert_monotonic(fragments: &[Fragment]) -> Result<()> {
    for w in fragments.windows(2) {
        if w[1].order_key() <= w[0].order_key() {
            return Err(CoreError::BufferInvariant(format!(
                "non-monotonic order keys: {} then {}",
                w[0].order_key(),
                w[1].order_key()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(seq: u64, start: f64, dur: f64) -> Fragment {
        Fragment {
            url: format!("seg{seq}.ts"),
            duration_secs: dur,
            start_time: start,
            sequence: Some(seq),
            timestamp: None,
            timescale: None,
            sampling_rate: None,
            first_read: false,
            discontinuity: false,
            encryption: None,
        }
    }

    #[test]
    fn scenario_2_live_delay_window() {
        let buffer = DelayBuffer::new(60.0);
        // 30 polls, one new 4s segment each.
        for i in 0..30u64 {
            buffer.poll_update(vec![frag(i, i as f64 * 4.0, 4.0)], 4.0 * 6.0).unwrap();
        }
        let view = buffer.view().unwrap();
        assert!(!view.fragments.is_empty());
        let total: f64 = view.fragments.iter().map(|f| f.duration_secs).sum();
        assert!(total >= 60.0 - 1e-9, "total={total}");
        assert!(total <= 60.0 + 2.0 * 24.0 + 1e-9, "total={total}");
        assert_eq!(view.first_order_key, view.fragments.first().map(|f| f.order_key()));
    }

    #[test]
    fn never_renumbers_an_observed_fragment() {
        let buffer = DelayBuffer::new(10.0);
        buffer.poll_update(vec![frag(0, 0.0, 4.0), frag(1, 4.0, 4.0)], 8.0).unwrap();
        // Stale/duplicate re-announcement of segment 0 should be ignored.
        buffer.poll_update(vec![frag(0, 0.0, 4.0), frag(2, 8.0, 4.0)], 8.0).unwrap();
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn monotonic_invariant_holds_after_many_polls() {
        let buffer = DelayBuffer::new(20.0);
        for i in 0..50u64 {
            buffer.poll_update(vec![frag(i, i as f64 * 4.0, 4.0)], 24.0).unwrap();
        }
        let view = buffer.view().unwrap();
        assert_monotonic(&view.fragments).unwrap();
    }

    #[test]
    fn eviction_respects_delay_plus_two_windows() {
        let buffer = DelayBuffer::new(10.0);
        let window = 8.0;
        for i in 0..100u64 {
            buffer.poll_update(vec![frag(i, i as f64 * 4.0, 4.0)], window).unwrap();
        }
        let retained = {
            let guard = buffer.inner.lock();
            let inner = guard.borrow();
            Inner::span(&inner)
        };
        assert!(retained <= 10.0 + 2.0 * window + 4.0);
    }

    impl Inner {
        fn span(&self) -> f64 {
            DelayBuffer::retained_duration(&self.fragments)
        }
    }

    #[test]
    fn fragments_since_only_returns_newer_order_keys() {
        let buffer = DelayBuffer::new(60.0);
        for i in 0..5u64 {
            buffer.poll_update(vec![frag(i, i as f64 * 4.0, 4.0)], 20.0).unwrap();
        }
        let all = buffer.fragments_since(None);
        assert_eq!(all.len(), 5);
        let newer = buffer.fragments_since(Some(2));
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].order_key(), 3);
    }
}
