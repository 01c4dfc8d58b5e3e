//! Session (C7, §4.7): per-`SessionKey` request handling for variant
//! manifests, delayed-live child manifests, subtitle manifests and
//! subtitle fragments, plus the transcription pipeline a transcribe-mode
//! session drives in the background.
//!
//! Grounded on the teacher's `MediaInfo`/`AppState` split
//! (`hls-vod-server/src/state.rs`): a `Session` here plays the role of
//! one `MediaInfo` entry — request-scoped collaborators (`RequestClient`,
//! `Transcoder`, the recognizer/translator) are passed in per call
//! (see [`SessionDeps`]) rather than stored on the session, so
//! `SessionManager::resolve_for_variant` can keep constructing a bare
//! `Session::new(key, languages, default_language)`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use eos_core::dash::{
    build_subtitle_adaptation_set_xml, live_attributes, live_timeline_xml, materialize_fragments, rebuild_mpd,
    substitute_template, MpdDocument, SubtitleAdaptationSetOpts, SUBTITLE_SEGMENT_SECS,
};
use eos_core::hls::{
    add_subtitle_track, build_media_playlist, clone_subtitle_manifest, live_media_playlist, make_absolute,
    select_reference_rendition, AddSubtitleOpts, MediaPlaylist, VariantPlaylist,
};
use eos_core::subtitle::{fmp4, ttml, webvtt};
use eos_core::types::{Fragment, Mode, Protocol, Streaming};
use eos_core::{url, DelayBuffer, SessionKey};

use crate::config::Config;
use crate::dispatch::Dispatch;
use crate::error::{Result, ServerError};
use crate::pipeline::{PipelineMode, PcmFragment, SpeechRecognizer, TranscribePipeline, Translator};
use crate::pipeline::audio::extract_aac_samples_from_fmp4;
use crate::pipeline::transcoder::{decrypt_aes128_cbc, Transcoder};
use crate::request_client::RequestClient;

/// Collaborators a session's request handlers need, passed per call
/// rather than stored (see module docs). Cheap to clone — every field
/// is an `Arc`.
#[derive(Clone)]
pub struct SessionDeps {
    pub request_client: Arc<RequestClient>,
    /// A second client dedicated to AES-128 key fetches, so its
    /// last-response memoisation slot (§4.8 step 2) isn't clobbered by
    /// unrelated GETs.
    pub key_client: Arc<RequestClient>,
    pub transcoder: Arc<Transcoder>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub translator: Arc<dyn Translator>,
    pub dispatch: Arc<Dispatch>,
    pub config: Arc<Config>,
}

/// One binary or text response, tagged with the headers §6 requires.
#[derive(Clone)]
pub struct HttpPayload {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

const HLS_PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const DASH_MPD_CONTENT_TYPE: &str = "application/dash+xml";
const WEBVTT_CONTENT_TYPE: &str = "text/vtt";
const FMP4_CONTENT_TYPE: &str = "application/octet-stream";
const CACHE_NONE: &str = "no-cache,no-store";
const CACHE_STATIC: &str = "max-age=604800";

fn cache_control_for(streaming: Streaming) -> &'static str {
    match streaming {
        Streaming::Live => CACHE_NONE,
        Streaming::Vod => CACHE_STATIC,
    }
}

/// Which addressing scheme a subtitle-fragment request used (§4.9/§6).
#[derive(Debug, Clone)]
pub enum SubtitleFragmentKind {
    /// `eos_hls_fragment/{fragment_b64}`, resolved against the
    /// fragment-to-time mapping recorded when the subtitle manifest
    /// (HLS clone) was built.
    Hls { fragment_fp: String },
    /// `eos_dash_fragment/{dst_lang}/Init`.
    DashInit,
    /// `eos_dash_fragment/{dst_lang}/{timestamp}`, a `SUBTITLE_TIMESCALE`-unit timestamp.
    DashMedia { timestamp: u64 },
}

struct ReferenceInfo {
    absolute_url: String,
    fingerprint: String,
    fragments: Vec<Fragment>,
    duration_secs: f64,
    /// Recorded for DASH so the synthesized subtitle `AdaptationSet`'s
    /// segment template/timescale match the top-level MPD's own.
    mpd: Option<MpdDocument>,
    mpd_body: Option<String>,
}

struct VariantCache {
    payload: HttpPayload,
    default_language: String,
}

/// Per-(session, destination-language) subtitle fragment addressing
/// table, populated when the HLS subtitle manifest is cloned (§4.7
/// "subtitle manifest"): maps a fragment fingerprint back to the
/// `Fragment` (hence its time window) it was cloned from.
struct SubtitleFragmentIndex {
    by_fingerprint: std::collections::HashMap<String, Fragment>,
}

pub struct Session {
    key: SessionKey,
    id: Uuid,
    languages: BTreeSet<String>,
    default_language: Mutex<String>,
    last_touch: Mutex<Instant>,

    variant_cache: Mutex<Option<VariantCache>>,
    reference: Mutex<Option<ReferenceInfo>>,
    subtitle_fragment_index: DashMap<String, SubtitleFragmentIndex>,
    /// One delay buffer per rendition fingerprint, live sessions only.
    buffers: DashMap<String, Arc<DelayBuffer>>,
    live_poller_started: AtomicBool,

    pipeline: Mutex<Option<Arc<TranscribePipeline>>>,
    pipeline_starting: AtomicBool,
}

impl Session {
    pub fn new(key: SessionKey, languages: BTreeSet<String>, default_language: String) -> Self {
        Self {
            key,
            id: Uuid::new_v4(),
            languages,
            default_language: Mutex::new(default_language),
            last_touch: Mutex::new(Instant::now()),
            variant_cache: Mutex::new(None),
            reference: Mutex::new(None),
            subtitle_fragment_index: DashMap::new(),
            buffers: DashMap::new(),
            live_poller_started: AtomicBool::new(false),
            pipeline: Mutex::new(None),
            pipeline_starting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn languages(&self) -> BTreeSet<String> {
        self.languages.clone()
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touch.lock().elapsed()
    }

    /// Dispatch tag this session's background jobs (pollers, pipeline
    /// ingestion) are serialized under (§4.10). Truncating the UUID to
    /// 64 bits only needs to avoid *accidental* collisions within one
    /// process's session set, not be globally unique.
    fn tag(&self) -> u64 {
        self.id.as_u128() as u64
    }

    fn session_label(&self) -> String {
        self.id.to_string()
    }

    // ---- variant manifest (§4.7 "variant manifest") -------------------

    pub async fn variant_manifest(&self, deps: &SessionDeps, requested_default: &str) -> Result<HttpPayload> {
        self.touch();

        if self.key.mode == Mode::Ocr {
            return Err(ServerError::MalformedRequest("OCR mode has no defined request handling".into()));
        }

        let default_changed = *self.default_language.lock() != requested_default;
        let force_no_cache = self.key.protocol == Protocol::Dash && self.key.streaming == Streaming::Live;

        if !force_no_cache && !default_changed {
            if let Some(cache) = self.variant_cache.lock().as_ref() {
                return Ok(cache.payload.clone());
            }
        }
        if default_changed {
            *self.default_language.lock() = requested_default.to_string();
        }

        let payload = match self.key.protocol {
            Protocol::Hls => self.build_hls_variant(deps).await?,
            Protocol::Dash => self.build_dash_variant(deps).await?,
        };

        if !force_no_cache {
            *self.variant_cache.lock() = Some(VariantCache { payload: payload.clone(), default_language: requested_default.to_string() });
        }

        if self.key.mode == Mode::Transcribe {
            self.ensure_pipeline_started(deps).await?;
        }

        Ok(payload)
    }

    async fn fetch(&self, deps: &SessionDeps, name: &str, url: &str) -> Result<Bytes> {
        deps.request_client
            .get(&self.session_label(), name, url)
            .await
            .map_err(|e| ServerError::OriginFetch(format!("{url}: {e}")))
    }

    async fn build_hls_variant(&self, deps: &SessionDeps) -> Result<HttpPayload> {
        let body = self.fetch(deps, "variant_manifest", &self.key.origin_url).await?;
        let text = std::str::from_utf8(&body).map_err(|_| ServerError::MalformedRequest("non-UTF8 manifest".into()))?;
        let mut playlist = VariantPlaylist::parse(text, &self.key.origin_url)?;

        let reference_uri = select_reference_rendition(&playlist, &self.key.src_lang)?.to_string();
        let reference_abs = url::resolve(&reference_uri, &self.key.origin_url)?;
        let reference_fp = url::fingerprint(&reference_abs);

        let default_language = self.default_language.lock().clone();
        for dst_lang in &self.languages {
            add_subtitle_track(
                &mut playlist,
                &AddSubtitleOpts {
                    dst_lang,
                    name: dst_lang,
                    is_default: *dst_lang == default_language,
                    manifest_prefix: "eos_manifest",
                    reference_fingerprint: &reference_fp,
                },
            )?;
        }

        let live_prefix = (self.key.streaming == Streaming::Live).then_some("eos_live");
        make_absolute(&mut playlist, &self.key.origin_url, live_prefix)?;

        let ref_body = self.fetch(deps, "reference_playlist", &reference_abs).await?;
        let ref_text = std::str::from_utf8(&ref_body).map_err(|_| ServerError::MalformedRequest("non-UTF8 reference playlist".into()))?;
        let ref_playlist = MediaPlaylist::parse(ref_text, &reference_abs)?;
        let duration_secs: f64 = ref_playlist.fragments.iter().map(|f| f.duration_secs).sum();

        *self.reference.lock() = Some(ReferenceInfo {
            absolute_url: reference_abs.clone(),
            fingerprint: reference_fp.clone(),
            fragments: ref_playlist.fragments.clone(),
            duration_secs,
            mpd: None,
            mpd_body: None,
        });

        if self.key.streaming == Streaming::Live {
            let buffer = self.ensure_buffer(&reference_fp);
            buffer.poll_update(ref_playlist.fragments.clone(), ref_playlist.target_duration as f64)?;
            self.ensure_live_poller(deps, reference_fp.clone(), reference_abs.clone());
        }

        Ok(HttpPayload {
            bytes: Bytes::from(playlist.build()),
            content_type: HLS_PLAYLIST_CONTENT_TYPE,
            cache_control: cache_control_for(self.key.streaming),
        })
    }

    async fn build_dash_variant(&self, deps: &SessionDeps) -> Result<HttpPayload> {
        let body = self.fetch(deps, "variant_manifest", &self.key.origin_url).await?;
        let text = std::str::from_utf8(&body).map_err(|_| ServerError::MalformedRequest("non-UTF8 manifest".into()))?;
        let mpd = MpdDocument::parse(text)?;

        let period = mpd.periods.first().ok_or_else(|| ServerError::MalformedRequest("MPD has no Period".into()))?;
        let audio_set = period
            .adaptation_sets
            .iter()
            .find(|s| s.resolved_content_type().as_deref() == Some("audio") && s.lang.as_deref() == Some(&self.key.src_lang))
            .or_else(|| period.adaptation_sets.iter().find(|s| s.resolved_content_type().as_deref() == Some("audio")))
            .or_else(|| period.adaptation_sets.first())
            .ok_or_else(|| ServerError::MalformedRequest("MPD has no AdaptationSet".into()))?;
        let representation = audio_set
            .representations
            .first()
            .ok_or_else(|| ServerError::MalformedRequest("AdaptationSet has no Representation".into()))?;
        let representation_id = representation.id.clone().unwrap_or_default();
        let bandwidth = representation.bandwidth.unwrap_or(0);

        let fragments = materialize_fragments(audio_set, &representation_id, bandwidth, &self.key.origin_url)?;
        let duration_secs: f64 = fragments.iter().map(|f| f.duration_secs).sum();
        let reference_abs = fragments
            .first()
            .map(|f| f.url.clone())
            .unwrap_or_else(|| self.key.origin_url.clone());
        let reference_fp = url::fingerprint(&self.key.origin_url);

        *self.reference.lock() = Some(ReferenceInfo {
            absolute_url: reference_abs,
            fingerprint: reference_fp,
            fragments: fragments.clone(),
            duration_secs,
            mpd: Some(mpd.clone()),
            mpd_body: Some(text.to_string()),
        });

        let mut extra_sets = Vec::new();
        for dst_lang in &self.languages {
            extra_sets.push(build_subtitle_adaptation_set_xml(&SubtitleAdaptationSetOpts {
                dst_lang_639_2: &to_iso_639_2(dst_lang),
                representation_id: &format!("sub-{dst_lang}"),
                media_template: &format!("eos_dash_fragment/{dst_lang}/$Time$"),
                init_template: &format!("eos_dash_fragment/{dst_lang}/Init"),
                reference_duration_secs: duration_secs,
            }));
        }

        let live = if self.key.streaming == Streaming::Live {
            let original_tsbd = mpd.time_shift_buffer_depth.as_deref().and_then(eos_core::dash::parse_iso8601_duration).unwrap_or(0.0);
            let original_max_seg = mpd.max_segment_duration.as_deref().and_then(eos_core::dash::parse_iso8601_duration).unwrap_or(SUBTITLE_SEGMENT_SECS);
            Some(live_attributes(&now_rfc3339(), original_tsbd, deps.config.app.live_delay_secs, original_max_seg))
        } else {
            None
        };

        let out = rebuild_mpd(&mpd, text, live.as_ref(), &extra_sets)?;

        if self.key.streaming == Streaming::Live {
            let fp = url::fingerprint(&self.key.origin_url);
            let buffer = self.ensure_buffer(&fp);
            let window = fragments.iter().map(|f| f.duration_secs).sum::<f64>().max(SUBTITLE_SEGMENT_SECS);
            buffer.poll_update(fragments, window)?;
            self.ensure_live_poller(deps, fp, self.key.origin_url.clone());
        }

        Ok(HttpPayload { bytes: Bytes::from(out), content_type: DASH_MPD_CONTENT_TYPE, cache_control: CACHE_NONE })
    }

    fn ensure_buffer(&self, fingerprint: &str) -> Arc<DelayBuffer> {
        self.buffers
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(DelayBuffer::new(30.0)))
            .clone()
    }

    /// Spawn the single polling task that keeps `fingerprint`'s buffer
    /// fresh (§5 "each live delay buffer runs a single polling task"),
    /// serialized under this session's dispatch tag so a slow poll never
    /// overlaps a concurrent request handler's own origin refetch.
    fn ensure_live_poller(&self, deps: &SessionDeps, fingerprint: String, origin_url: String) {
        if self.live_poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay_secs = deps.config.app.live_delay_secs;
        let buffer = self.ensure_buffer(&fingerprint);
        let request_client = deps.request_client.clone();
        let protocol = self.key.protocol;
        let session_label = self.session_label();
        let tag = self.tag();

        deps.dispatch.submit(tag, async move {
            loop {
                tokio::time::sleep(Duration::from_secs_f64(delay_secs.min(4.0).max(1.0))).await;
                let body = match request_client.get(&session_label, "live_poll", &origin_url).await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(error = %e, "live buffer poll failed");
                        continue;
                    }
                };
                let text = match std::str::from_utf8(&body) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let result = match protocol {
                    Protocol::Hls => MediaPlaylist::parse(text, &origin_url).map(|pl| (pl.fragments, pl.target_duration as f64)),
                    Protocol::Dash => continue, // DASH re-derives its timeline from the cached MpdDocument on each request instead of a background poll.
                };
                if let Ok((fragments, window)) = result {
                    if let Err(e) = buffer.poll_update(fragments, window) {
                        tracing::warn!(error = %e, "live buffer invariant violated, dropping poll");
                    }
                }
            }
        });
    }

    // ---- live child manifest (§4.7 "live child manifest") -------------

    pub async fn live_child_manifest(&self, rendition_fp: &str) -> Result<HttpPayload> {
        self.touch();
        let buffer = self
            .buffers
            .get(rendition_fp)
            .map(|b| b.clone())
            .ok_or_else(|| ServerError::FragmentNotFound(format!("no live buffer for rendition {rendition_fp}")))?;

        let text = match self.key.protocol {
            Protocol::Hls => {
                let target_duration = self.reference.lock().as_ref().map(|r| r.duration_secs.ceil() as u32).unwrap_or(6);
                live_media_playlist(&buffer, target_duration)?
            }
            Protocol::Dash => live_timeline_xml(&buffer, 1)?,
        };

        Ok(HttpPayload {
            bytes: Bytes::from(text),
            content_type: if self.key.protocol == Protocol::Hls { HLS_PLAYLIST_CONTENT_TYPE } else { DASH_MPD_CONTENT_TYPE },
            cache_control: CACHE_NONE,
        })
    }

    // ---- subtitle manifest (HLS only, §4.7 "subtitle manifest") -------

    pub async fn subtitle_manifest(&self, dst_lang: &str, reference_fp: &str) -> Result<HttpPayload> {
        self.touch();
        if self.key.protocol != Protocol::Hls {
            return Err(ServerError::MalformedRequest("subtitle manifest cloning is HLS-only".into()));
        }

        let reference = self.reference.lock();
        let reference = reference.as_ref().ok_or_else(|| ServerError::SessionNotFound("variant manifest not yet built".into()))?;
        if reference.fingerprint != reference_fp {
            return Err(ServerError::MalformedRequest("reference fingerprint does not match this session".into()));
        }

        let reference_playlist = MediaPlaylist {
            source_url: reference.absolute_url.clone(),
            target_duration: reference.duration_secs.ceil() as u32,
            media_sequence: 0,
            version: 3,
            fragments: reference.fragments.clone(),
            endlist: self.key.streaming == Streaming::Vod,
        };

        let fragment_prefix = "eos_hls_fragment";
        let (cloned, original_fragments) = clone_subtitle_manifest(&reference_playlist, fragment_prefix);

        let mut index = std::collections::HashMap::with_capacity(cloned.fragments.len());
        for (cloned_frag, original) in cloned.fragments.iter().zip(original_fragments.iter()) {
            let fp = cloned_frag.url.rsplit('/').next().unwrap_or(&cloned_frag.url).to_string();
            index.insert(fp, original.clone());
        }
        self.subtitle_fragment_index.insert(dst_lang.to_string(), SubtitleFragmentIndex { by_fingerprint: index });

        Ok(HttpPayload {
            bytes: Bytes::from(build_media_playlist(&cloned)),
            content_type: HLS_PLAYLIST_CONTENT_TYPE,
            cache_control: cache_control_for(self.key.streaming),
        })
    }

    // ---- subtitle fragment (§4.7 "subtitle fragment") ------------------

    pub async fn subtitle_fragment(&self, deps: &SessionDeps, dst_lang: &str, kind: SubtitleFragmentKind) -> Result<HttpPayload> {
        self.touch();
        match self.key.mode {
            Mode::Translate => self.translate_subtitle_fragment(deps, dst_lang, kind).await,
            Mode::Transcribe => self.transcribe_subtitle_fragment(dst_lang, kind).await,
            Mode::Ocr => Err(ServerError::MalformedRequest("OCR mode has no defined request handling".into())),
        }
    }

    async fn fragment_window(&self, dst_lang: &str, kind: &SubtitleFragmentKind) -> Result<(f64, f64, Option<Fragment>)> {
        match kind {
            SubtitleFragmentKind::Hls { fragment_fp } => {
                let index = self
                    .subtitle_fragment_index
                    .get(dst_lang)
                    .ok_or_else(|| ServerError::FragmentNotFound("subtitle manifest not yet built for this language".into()))?;
                let frag = index
                    .by_fingerprint
                    .get(fragment_fp)
                    .cloned()
                    .ok_or_else(|| ServerError::FragmentNotFound(format!("unknown subtitle fragment {fragment_fp}")))?;
                Ok((frag.start_time, frag.end_time(), Some(frag)))
            }
            SubtitleFragmentKind::DashInit => Ok((0.0, 0.0, None)),
            SubtitleFragmentKind::DashMedia { timestamp } => {
                let start = *timestamp as f64 / fmp4::SUBTITLE_TIMESCALE as f64;
                Ok((start, start + SUBTITLE_SEGMENT_SECS, None))
            }
        }
    }

    async fn translate_subtitle_fragment(&self, deps: &SessionDeps, dst_lang: &str, kind: SubtitleFragmentKind) -> Result<HttpPayload> {
        let (start, end, origin_frag) = self.fragment_window(dst_lang, &kind).await?;
        let origin_frag = origin_frag.ok_or_else(|| ServerError::MalformedRequest("translate mode only supports HLS subtitle fragments".into()))?;

        let body = self.fetch(deps, "subtitle_fragment_origin", &origin_frag.url).await?;
        let text = std::str::from_utf8(&body).map_err(|_| ServerError::MalformedRequest("non-UTF8 subtitle fragment".into()))?;
        let cues = webvtt::parse_webvtt(text)?;

        let words: Vec<String> = cues.iter().flat_map(|c| c.text.split_whitespace().map(str::to_string)).collect();
        let translated_cues = if words.is_empty() {
            Vec::new()
        } else {
            match deps.translator.translate_words(&words, &self.key.src_lang, dst_lang).await {
                Ok(translated) if !translated.is_empty() => redistribute_across_cues(&cues, &translated),
                _ => cues,
            }
        };

        let out = webvtt::build_webvtt(&translated_cues, start, end, None);
        Ok(HttpPayload { bytes: Bytes::from(out), content_type: WEBVTT_CONTENT_TYPE, cache_control: cache_control_for(self.key.streaming) })
    }

    async fn transcribe_subtitle_fragment(&self, dst_lang: &str, kind: SubtitleFragmentKind) -> Result<HttpPayload> {
        if matches!(kind, SubtitleFragmentKind::DashInit) {
            return Ok(HttpPayload { bytes: fmp4::build_init_segment(), content_type: FMP4_CONTENT_TYPE, cache_control: CACHE_STATIC });
        }

        let (start, end, _) = self.fragment_window(dst_lang, &kind).await?;
        let pipeline = self.pipeline.lock().clone().ok_or_else(|| ServerError::SessionNotFound("transcription pipeline not started".into()))?;
        let cues = pipeline.query(dst_lang, start, end);

        match kind {
            SubtitleFragmentKind::Hls { .. } => {
                let out = webvtt::build_webvtt(&cues, start, end, None);
                Ok(HttpPayload { bytes: Bytes::from(out), content_type: WEBVTT_CONTENT_TYPE, cache_control: cache_control_for(self.key.streaming) })
            }
            SubtitleFragmentKind::DashMedia { timestamp } => {
                let body = ttml::build_ttml(&cues);
                let sequence_number = (timestamp / fmp4::SEGMENT_DURATION_UNITS as u64) as u32;
                let bytes = fmp4::build_media_segment(sequence_number, timestamp, &body);
                Ok(HttpPayload { bytes, content_type: FMP4_CONTENT_TYPE, cache_control: CACHE_NONE })
            }
            SubtitleFragmentKind::DashInit => unreachable!("handled above"),
        }
    }

    // ---- transcription pipeline ingestion (§4.8) -----------------------

    async fn ensure_pipeline_started(&self, deps: &SessionDeps) -> Result<()> {
        if self.pipeline_starting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.pipeline.lock().is_some() {
            return Ok(());
        }

        let mode = if self.key.streaming == Streaming::Live { PipelineMode::Live } else { PipelineMode::Vod };
        let dst_langs: Vec<String> = self.languages.iter().cloned().collect();
        let pipeline = TranscribePipeline::new(
            mode,
            self.key.src_lang.clone(),
            dst_langs,
            crate::pipeline::pipeline::RECOGNIZER_SAMPLE_RATE_HZ,
            deps.recognizer.clone(),
            deps.translator.clone(),
        );
        let feed_tx = pipeline.start();
        *self.pipeline.lock() = Some(pipeline.clone());

        let reference = self.reference.lock().as_ref().map(|r| (r.fragments.clone(), r.fingerprint.clone()));
        let Some((fragments, fingerprint)) = reference else {
            return Ok(());
        };

        let protocol = self.key.protocol;
        let transcoder = deps.transcoder.clone();
        let request_client = deps.request_client.clone();
        let key_client = deps.key_client.clone();
        let session_label = self.session_label();
        let sample_rate = crate::pipeline::pipeline::RECOGNIZER_SAMPLE_RATE_HZ;
        let tag = self.tag();
        let buffer = (self.key.streaming == Streaming::Live).then(|| self.ensure_buffer(&fingerprint));

        deps.dispatch.submit(tag, async move {
            ingest_fragments(
                fragments,
                buffer,
                feed_tx,
                protocol,
                transcoder,
                request_client,
                key_client,
                &session_label,
                sample_rate,
            )
            .await;
        });

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_fragments(
    initial_fragments: Vec<Fragment>,
    buffer: Option<Arc<DelayBuffer>>,
    feed_tx: tokio::sync::mpsc::Sender<PcmFragment>,
    protocol: Protocol,
    transcoder: Arc<Transcoder>,
    request_client: Arc<RequestClient>,
    key_client: Arc<RequestClient>,
    session_label: &str,
    sample_rate_hz: u32,
) {
    let mut last_key: Option<u64> = None;

    let mut pending = initial_fragments;
    loop {
        for frag in pending.drain(..) {
            last_key = Some(frag.order_key());
            match ingest_one_fragment(&frag, protocol, &transcoder, &request_client, &key_client, session_label, sample_rate_hz).await {
                Ok(pcm) => {
                    if feed_tx.send(PcmFragment { pcm, start_time: frag.start_time }).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, url = %frag.url, "skipping fragment the ingestion loop could not decode"),
            }
        }

        let Some(buffer) = &buffer else {
            // VOD: the reference fragment list was exhausted; ingestion is done.
            return;
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        pending = buffer.fragments_since(last_key);
    }
}

async fn ingest_one_fragment(
    frag: &Fragment,
    protocol: Protocol,
    transcoder: &Transcoder,
    request_client: &RequestClient,
    key_client: &RequestClient,
    session_label: &str,
    sample_rate_hz: u32,
) -> Result<Vec<u8>> {
    let body = request_client
        .get(session_label, "ingest_fragment", &frag.url)
        .await
        .map_err(|e| ServerError::OriginFetch(e.to_string()))?;

    let plaintext = match &frag.encryption {
        Some(enc) if enc.method.eq_ignore_ascii_case("AES-128") => {
            let key = key_client.get_memoized(session_label, "key_fetch", &enc.key_uri).await.map_err(|e| ServerError::OriginFetch(e.to_string()))?;
            decrypt_aes128_cbc(&body, &key, enc)?
        }
        _ => body.to_vec(),
    };

    let temp_path = transcoder.persist_temp(&frag.url, &Bytes::from(plaintext)).await?;
    let aac = match protocol {
        Protocol::Hls => transcoder.extract_aac_hls(&temp_path).await,
        Protocol::Dash => {
            let data = tokio::fs::read(&temp_path).await.map_err(|e| ServerError::Internal(format!("reread temp: {e}")));
            match data {
                Ok(bytes) => {
                    let samples = extract_aac_samples_from_fmp4(&bytes)?;
                    Ok(crate::pipeline::audio::wrap_samples_with_adts(&samples, frag.sampling_rate.unwrap_or(sample_rate_hz), 2).to_vec())
                }
                Err(e) => Err(e),
            }
        }
    };
    transcoder.remove_temp(&temp_path).await;
    let aac = aac?;

    let aac_path = transcoder.persist_temp(&format!("{}#aac", frag.url), &Bytes::from(aac)).await?;
    let pcm = transcoder.resample_to_pcm16(&aac_path, sample_rate_hz).await;
    transcoder.remove_temp(&aac_path).await;
    Ok(pcm?)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Allocate a batch-translated word list back across the input cues it
/// was flattened from, proportionally to each cue's character-count
/// share of the whole fragment (§4.8 "Translation fan-out"), so a
/// multi-cue fragment comes back as the same number of cues with their
/// original timing intact rather than one cue spanning the fragment.
///
/// Mirrors `pipeline::translate`'s per-word `redistribute` scheme at
/// cue granularity, and the original's per-caption
/// reconstruction in `OttHandler._translate_caption_set`
/// (`examples/original_source/easy-ott-subtitles/OttHandler.py:142`).
fn redistribute_across_cues(cues: &[eos_core::SubtitleEntry], translated_words: &[String]) -> Vec<eos_core::SubtitleEntry> {
    let total_chars: usize = cues.iter().map(|c| c.text.chars().count()).sum::<usize>().max(1);
    let n = translated_words.len();
    let mut out = Vec::with_capacity(cues.len());
    let mut assigned_chars = 0usize;
    let mut word_cursor = 0usize;

    for (i, cue) in cues.iter().enumerate() {
        assigned_chars += cue.text.chars().count();
        let target_cursor = if i + 1 == cues.len() {
            n
        } else {
            ((assigned_chars as f64 / total_chars as f64) * n as f64).round() as usize
        };
        let take = target_cursor.saturating_sub(word_cursor).min(n - word_cursor);
        let text = translated_words[word_cursor..word_cursor + take].join(" ");
        word_cursor += take;
        out.push(eos_core::SubtitleEntry { start_sec: cue.start_sec, end_sec: cue.end_sec, text });
    }
    out
}

/// Best-effort BCP-47 primary-subtag -> ISO 639-2/B mapping for the
/// handful of languages this system is realistically configured for;
/// everything else falls back to its lowercased 3-letter prefix
/// (DESIGN.md open question 5).
fn to_iso_639_2(bcp47: &str) -> String {
    let primary = bcp47.split('-').next().unwrap_or(bcp47).to_lowercase();
    let mapped = match primary.as_str() {
        "en" => "eng",
        "de" => "deu",
        "es" => "spa",
        "fr" => "fra",
        "it" => "ita",
        "pt" => "por",
        "nl" => "nld",
        "ja" => "jpn",
        "zh" => "zho",
        "ru" => "rus",
        "ko" => "kor",
        "ar" => "ara",
        other if other.len() >= 3 => return other[..3].to_string(),
        other => return format!("{other:0<3}"),
    };
    mapped.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eos_core::{Mode as CoreMode, Protocol as CoreProtocol, Streaming as CoreStreaming};

    fn key() -> SessionKey {
        SessionKey::new("https://o/m.m3u8", CoreProtocol::Hls, CoreStreaming::Vod, CoreMode::Translate, "en")
    }

    #[test]
    fn new_session_has_unique_id_and_fresh_touch() {
        let s1 = Session::new(key(), BTreeSet::new(), "de-DE".into());
        let s2 = Session::new(key(), BTreeSet::new(), "de-DE".into());
        assert_ne!(s1.id(), s2.id());
        assert!(s1.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn touch_resets_idle_timer() {
        let s = Session::new(key(), BTreeSet::new(), "de-DE".into());
        std::thread::sleep(Duration::from_millis(5));
        s.touch();
        assert!(s.idle_for() < Duration::from_millis(500));
    }

    #[test]
    fn iso_639_2_mapping_covers_common_languages_and_falls_back() {
        assert_eq!(to_iso_639_2("de-DE"), "deu");
        assert_eq!(to_iso_639_2("en"), "eng");
        assert_eq!(to_iso_639_2("xx-YY"), "xx0");
    }

    #[tokio::test]
    async fn ocr_mode_variant_manifest_is_rejected() {
        let key = SessionKey::new("https://o/m.m3u8", CoreProtocol::Hls, CoreStreaming::Vod, CoreMode::Ocr, "en");
        let session = Session::new(key, BTreeSet::new(), "en".into());
        let deps = SessionDeps {
            request_client: Arc::new(RequestClient::new(Arc::new(crate::stats::Stats::new()))),
            key_client: Arc::new(RequestClient::new(Arc::new(crate::stats::Stats::new()))),
            transcoder: Arc::new(Transcoder::new("ffmpeg", "sox", std::env::temp_dir())),
            recognizer: Arc::new(NullRecognizer),
            translator: Arc::new(NullTranslator),
            dispatch: Dispatch::start(1),
            config: Arc::new(Config::default()),
        };
        let err = session.variant_manifest(&deps, "en").await.unwrap_err();
        assert!(matches!(err, ServerError::MalformedRequest(_)));
    }

    struct NullRecognizer;
    #[async_trait::async_trait]
    impl SpeechRecognizer for NullRecognizer {
        async fn open_stream(&self, _sample_rate_hz: u32) -> Result<Box<dyn crate::pipeline::RecognizerStream>> {
            Err(ServerError::Internal("no recognizer configured".into()))
        }
    }

    struct NullTranslator;
    #[async_trait::async_trait]
    impl Translator for NullTranslator {
        async fn translate_words(&self, words: &[String], _src: &str, _dst: &str) -> Result<Vec<String>> {
            Ok(words.to_vec())
        }
    }

    #[test]
    fn redistribute_across_cues_preserves_cue_count_and_timing() {
        let cues = vec![
            eos_core::SubtitleEntry { start_sec: 0.0, end_sec: 2.0, text: "hi".into() },
            eos_core::SubtitleEntry { start_sec: 2.0, end_sec: 4.0, text: "there friend".into() },
            eos_core::SubtitleEntry { start_sec: 4.0, end_sec: 6.0, text: "goodbye".into() },
        ];
        let translated: Vec<String> =
            ["[hi]", "[there]", "[friend]", "[goodbye]"].iter().map(|s| s.to_string()).collect();

        let out = redistribute_across_cues(&cues, &translated);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].start_sec, 0.0);
        assert_eq!(out[0].end_sec, 2.0);
        assert_eq!(out[1].start_sec, 2.0);
        assert_eq!(out[1].end_sec, 4.0);
        assert_eq!(out[2].start_sec, 4.0);
        assert_eq!(out[2].end_sec, 6.0);
        // every translated word is placed in exactly one cue, in order.
        let all_words: Vec<&str> = out.iter().flat_map(|c| c.text.split_whitespace()).collect();
        assert_eq!(all_words, vec!["[hi]", "[there]", "[friend]", "[goodbye]"]);
        assert!(!out[2].text.is_empty(), "last cue gets the remainder of the translated words");
    }
}
