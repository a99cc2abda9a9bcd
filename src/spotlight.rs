//! One Spotlight view: a message set at one granularity, its summaries,
//! narrations and playback sessions.
//!
//! Dropping the view tears down every playback handle it opened.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audio::AudioOutput;
use crate::config::Config;
use crate::error::SpotlightError;
use crate::narration::{CacheCorrelation, HttpSpeechClient, NarrationSynthesizer, SpeechBackend};
use crate::period::{group_messages, Granularity, Message, PeriodGroup};
use crate::playback::{PlaybackController, SessionSnapshot};
use crate::store::NarrationStore;
use crate::summary::{HttpSummaryClient, PeriodSummarizer, Summary, SummaryBackend};

/// Everything a period card renders.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodCard {
    pub key: String,
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
    pub message_count: usize,
    pub summary: Option<Summary>,
    pub narration_cached: bool,
    pub playback: Option<SessionSnapshot>,
}

struct View {
    granularity: Granularity,
    messages: Vec<Message>,
    groups: Vec<PeriodGroup>,
}

pub struct Spotlight {
    user_id: String,
    summarizer: PeriodSummarizer,
    synthesizer: Arc<NarrationSynthesizer>,
    playback: Arc<PlaybackController>,
    view: Mutex<View>,
}

impl Spotlight {
    pub fn new(
        config: &Config,
        summaries: Arc<dyn SummaryBackend>,
        speech: Arc<dyn SpeechBackend>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let store = NarrationStore::new(config.narration.cache_file(), config.narration.max_entries);
        let synthesizer = Arc::new(NarrationSynthesizer::new(speech, store, &config.narration));
        let playback = Arc::new(PlaybackController::new(
            synthesizer.clone(),
            output,
            &config.playback,
        ));

        Self {
            user_id: config.user_id.clone(),
            summarizer: PeriodSummarizer::new(summaries, &config.user_id, config.summary.timeout()),
            synthesizer,
            playback,
            view: Mutex::new(View {
                granularity: config.summary.granularity,
                messages: Vec::new(),
                groups: Vec::new(),
            }),
        }
    }

    /// Wire up the HTTP backends from config.
    pub fn connect(config: &Config, output: Arc<dyn AudioOutput>) -> reqwest::Result<Self> {
        let summaries = Arc::new(HttpSummaryClient::new(&config.backend)?);
        let speech = Arc::new(HttpSpeechClient::new(&config.backend, config.narration.timeout())?);
        Ok(Self::new(config, summaries, speech, output))
    }

    pub fn playback(&self) -> &Arc<PlaybackController> {
        &self.playback
    }

    pub fn granularity(&self) -> Granularity {
        self.view().granularity
    }

    pub fn cached_narrations(&self) -> usize {
        self.synthesizer.len()
    }

    /// Replace the message set, optionally switching granularity, and
    /// request summaries for the resulting periods.
    ///
    /// When the period set differs from the current one, summaries are
    /// dropped and playback is torn down once before the new pass.
    /// Narrations stay cached on disk.
    pub fn load(&self, messages: Vec<Message>, granularity: Option<Granularity>) -> Vec<JoinHandle<()>> {
        self.load_at(messages, granularity, Utc::now().date_naive())
    }

    pub fn load_at(
        &self,
        messages: Vec<Message>,
        granularity: Option<Granularity>,
        today: NaiveDate,
    ) -> Vec<JoinHandle<()>> {
        let mut view = self.view();
        let granularity = granularity.unwrap_or(view.granularity);
        self.replace(&mut view, messages, granularity, today)
    }

    pub fn load_messages(&self, messages: Vec<Message>) -> Vec<JoinHandle<()>> {
        self.load(messages, None)
    }

    pub fn load_messages_at(&self, messages: Vec<Message>, today: NaiveDate) -> Vec<JoinHandle<()>> {
        self.load_at(messages, None, today)
    }

    /// Re-run the summary pass, as any re-render would. Never double-fetches.
    pub fn refresh(&self) -> Vec<JoinHandle<()>> {
        self.refresh_at(Utc::now().date_naive())
    }

    pub fn refresh_at(&self, today: NaiveDate) -> Vec<JoinHandle<()>> {
        let groups = self.view().groups.clone();
        self.summarizer.ensure_summaries_at(&groups, today)
    }

    /// Switch between weekly and monthly cards over the current messages.
    pub fn set_granularity(&self, granularity: Granularity) -> Vec<JoinHandle<()>> {
        self.set_granularity_at(granularity, Utc::now().date_naive())
    }

    pub fn set_granularity_at(&self, granularity: Granularity, today: NaiveDate) -> Vec<JoinHandle<()>> {
        let mut view = self.view();
        if view.granularity == granularity {
            return Vec::new();
        }
        let messages = std::mem::take(&mut view.messages);
        self.replace(&mut view, messages, granularity, today)
    }

    // Caller holds the view lock for the whole pass.
    fn replace(
        &self,
        view: &mut View,
        messages: Vec<Message>,
        granularity: Granularity,
        today: NaiveDate,
    ) -> Vec<JoinHandle<()>> {
        let groups = group_messages(&messages, granularity);
        let changed = granularity != view.granularity || groups != view.groups;
        view.granularity = granularity;
        view.messages = messages;
        view.groups = groups;

        if changed {
            info!("Loaded {} {granularity} period(s)", view.groups.len());
            self.playback.teardown();
            self.summarizer.clear();
        }
        self.summarizer.ensure_summaries_at(&view.groups, today)
    }

    pub fn cards(&self) -> Vec<PeriodCard> {
        let groups = self.view().groups.clone();
        groups
            .iter()
            .map(|group| {
                let key = group.period.key();
                PeriodCard {
                    label: group.period.label(),
                    start: group.period.start,
                    end: group.period.end,
                    granularity: group.period.granularity,
                    message_count: group.messages.len(),
                    summary: self.summarizer.get(&key),
                    narration_cached: self.synthesizer.cached(&key).is_some(),
                    playback: self.playback.snapshot(&key),
                    key,
                }
            })
            .collect()
    }

    pub fn retry(&self, key: &str) -> Result<Option<JoinHandle<()>>, SpotlightError> {
        let group = self.group(key)?;
        Ok(self.summarizer.retry(&group))
    }

    /// Play the card's narration, synthesizing it on first use.
    pub async fn play(&self, key: &str) -> Result<SessionSnapshot, SpotlightError> {
        let group = self.group(key)?;
        let text = match self.summarizer.get(key) {
            Some(summary) if summary.is_ready() && !summary.text.trim().is_empty() => summary.text,
            // A persisted narration outlives the in-memory summary.
            _ if self.synthesizer.cached(key).is_some() => String::new(),
            _ => return Err(SpotlightError::SummaryUnavailable(key.to_string())),
        };
        let correlation = CacheCorrelation::for_period(&self.user_id, &group.period);
        Ok(self.playback.play(key, &text, Some(correlation)).await?)
    }

    pub fn pause(&self, key: &str) -> Result<SessionSnapshot, SpotlightError> {
        Ok(self.playback.pause(key)?)
    }

    pub fn stop(&self, key: &str) -> Result<SessionSnapshot, SpotlightError> {
        Ok(self.playback.stop(key)?)
    }

    pub fn begin_seek(&self, key: &str) -> Result<SessionSnapshot, SpotlightError> {
        Ok(self.playback.begin_seek(key)?)
    }

    pub fn seek(&self, key: &str, percent: f64) -> Result<SessionSnapshot, SpotlightError> {
        Ok(self.playback.seek(key, percent)?)
    }

    /// Lifecycle hook for view teardown.
    pub fn teardown(&self) -> usize {
        self.playback.teardown()
    }

    fn group(&self, key: &str) -> Result<PeriodGroup, SpotlightError> {
        self.view()
            .groups
            .iter()
            .find(|g| g.period.key() == key)
            .cloned()
            .ok_or_else(|| SpotlightError::UnknownPeriod(key.to_string()))
    }

    fn view(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Spotlight {
    fn drop(&mut self) {
        self.playback.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NarrationConfig;
    use crate::playback::TransportState;
    use crate::summary::SummaryState;
    use crate::test_support::{messages_in, FakeOutput, FakeSpeech, FakeSummaries};
    use std::time::Duration;

    const WEEK1: &str = "week:2024-01-01:2024-01-07";
    const WEEK2: &str = "week:2024-01-08:2024-01-14";

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn messages() -> Vec<Message> {
        let mut all = messages_in(day(2024, 1, 2), 4);
        all.extend(messages_in(day(2024, 1, 10), 2));
        all
    }

    struct Rig {
        _tmp: tempfile::TempDir,
        summaries: Arc<FakeSummaries>,
        speech: Arc<FakeSpeech>,
        output: Arc<FakeOutput>,
        spotlight: Spotlight,
    }

    fn rig() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            user_id: "u-9".into(),
            narration: NarrationConfig {
                cache_path: tmp.path().join("cache.json").display().to_string(),
                ..NarrationConfig::default()
            },
            ..Config::default()
        };
        let summaries = Arc::new(FakeSummaries::new(Duration::from_millis(10)));
        let speech = Arc::new(FakeSpeech::new(2.0));
        let output = FakeOutput::new();
        let spotlight = Spotlight::new(&config, summaries.clone(), speech.clone(), output.clone());
        Rig {
            _tmp: tmp,
            summaries,
            speech,
            output,
            spotlight,
        }
    }

    async fn settle(handles: Vec<JoinHandle<()>>) {
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn summary_then_narration_then_playback() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages(), day(2024, 2, 1))).await;
        // Re-render pressure: no further requests.
        settle(r.spotlight.refresh_at(day(2024, 2, 1))).await;
        assert_eq!(r.summaries.calls(), 2);

        let snap = r.spotlight.play(WEEK1).await.unwrap();
        assert_eq!(snap.state, TransportState::Playing);

        let request = &r.speech.requests()[0];
        assert_eq!(request.text, "4 messages starting 2024-01-01");
        let correlation = request.correlation.as_ref().unwrap();
        assert_eq!(correlation.user_id, "u-9");
        assert_eq!(correlation.period_end, day(2024, 1, 7));

        let cards = r.spotlight.cards();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[1].key, WEEK1);
        assert!(cards[1].narration_cached);
        assert_eq!(cards[1].playback.as_ref().unwrap().state, TransportState::Playing);
        assert!(cards[0].playback.is_none());
    }

    #[tokio::test]
    async fn open_period_card_cannot_play() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages(), day(2024, 1, 12))).await;
        assert_eq!(r.summaries.calls(), 1);

        let open = r
            .spotlight
            .cards()
            .into_iter()
            .find(|c| c.key == WEEK2)
            .unwrap();
        assert_eq!(open.summary.unwrap().state, SummaryState::AwaitingClose);
        assert!(matches!(
            r.spotlight.play(WEEK2).await,
            Err(SpotlightError::SummaryUnavailable(_))
        ));
        assert_eq!(r.speech.calls(), 0);
    }

    #[tokio::test]
    async fn granularity_toggle_refetches_and_tears_down() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages(), day(2024, 3, 1))).await;
        r.spotlight.play(WEEK1).await.unwrap();

        settle(r.spotlight.set_granularity_at(Granularity::Month, day(2024, 3, 1))).await;
        assert_eq!(r.spotlight.granularity(), Granularity::Month);
        assert!(r.output.handle(0).lock().unwrap().stopped);

        let cards = r.spotlight.cards();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].key, "month:2024-01-01:2024-01-31");
        assert_eq!(cards[0].message_count, 6);
        assert!(cards[0].summary.as_ref().unwrap().is_ready());
        assert_eq!(r.summaries.calls(), 3);

        // Same granularity again is a no-op.
        assert!(r
            .spotlight
            .set_granularity_at(Granularity::Month, day(2024, 3, 1))
            .is_empty());
    }

    #[tokio::test]
    async fn load_with_new_granularity_summarizes_the_new_messages() {
        let r = rig();
        settle(r.spotlight.load_at(
            messages_in(day(2024, 1, 3), 1),
            Some(Granularity::Week),
            day(2024, 3, 1),
        ))
        .await;

        settle(r.spotlight.load_at(
            messages_in(day(2024, 1, 20), 5),
            Some(Granularity::Month),
            day(2024, 3, 1),
        ))
        .await;

        let cards = r.spotlight.cards();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].message_count, 5);
        assert_eq!(
            cards[0].summary.as_ref().unwrap().text,
            "5 messages starting 2024-01-01"
        );
        assert_eq!(r.summaries.calls(), 2);
    }

    #[tokio::test]
    async fn changed_messages_for_a_surviving_period_are_resummarized() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages_in(day(2024, 1, 3), 1), day(2024, 3, 1))).await;
        r.spotlight.play(WEEK1).await.unwrap();

        settle(r.spotlight.load_messages_at(messages_in(day(2024, 1, 3), 6), day(2024, 3, 1))).await;
        assert_eq!(r.summaries.calls(), 2);
        assert!(r.output.handle(0).lock().unwrap().stopped);

        let card = &r.spotlight.cards()[0];
        assert_eq!(card.message_count, 6);
        assert_eq!(card.summary.as_ref().unwrap().text, "6 messages starting 2024-01-01");
        assert!(card.playback.is_none());
    }

    #[tokio::test]
    async fn identical_reload_keeps_summaries_and_playback() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages(), day(2024, 3, 1))).await;
        r.spotlight.play(WEEK1).await.unwrap();

        settle(r.spotlight.load_messages_at(messages(), day(2024, 3, 1))).await;
        assert_eq!(r.summaries.calls(), 2);
        assert!(!r.output.handle(0).lock().unwrap().stopped);
        let snap = r.spotlight.playback().snapshot(WEEK1).unwrap();
        assert_eq!(snap.state, TransportState::Playing);
    }

    #[tokio::test]
    async fn unknown_key_is_reported() {
        let r = rig();
        assert!(matches!(
            r.spotlight.play("week:1999-01-04:1999-01-10").await,
            Err(SpotlightError::UnknownPeriod(_))
        ));
        assert!(matches!(r.spotlight.retry("nope"), Err(SpotlightError::UnknownPeriod(_))));
    }

    #[tokio::test]
    async fn drop_releases_handles() {
        let r = rig();
        settle(r.spotlight.load_messages_at(messages(), day(2024, 3, 1))).await;
        r.spotlight.play(WEEK1).await.unwrap();
        let output = r.output.clone();
        drop(r);
        assert!(output.handle(0).lock().unwrap().stopped);
    }
}
