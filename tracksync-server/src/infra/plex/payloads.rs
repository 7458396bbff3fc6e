//! Plex JSON payloads and their conversion into tracksync listings.
//!
//! Plex wraps every response in a `MediaContainer` and is inconsistent about
//! whether keys are strings or numbers, so keys go through [`Key`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use tracksync_core::{
    EpisodeListing, HistoryEntry, InboundEvent, LibraryListing, PlaybackEvent, Result,
    ScanEvent, SeasonListing, SelectedTracks, ShowListing, SyncError,
};
use tracksync_model::{
    EpisodeId, LibraryId, PartId, SeasonId, SequencePosition, ShowId, TrackId,
    UNDETERMINED_LANGUAGE, UserId,
};

pub const STREAM_TYPE_AUDIO: u8 = 2;
pub const STREAM_TYPE_SUBTITLE: u8 = 3;

/// A rating key, section id or account id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Text(String),
    Number(u64),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Text(text) => f.write_str(text.trim()),
            Key::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    pub container: T,
}

#[derive(Debug, Default, Deserialize)]
pub struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    pub directories: Vec<SectionDirectory>,
}

#[derive(Debug, Deserialize)]
pub struct SectionDirectory {
    pub key: Key,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
}

impl SectionDirectory {
    /// Only TV show sections take part in propagation.
    pub fn into_listing(self) -> Option<LibraryListing> {
        (self.kind == "show").then(|| LibraryListing {
            id: LibraryId::new(self.key.to_string()),
            name: self.title,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataContainer {
    #[serde(rename = "Metadata", default)]
    pub metadata: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataItem {
    pub rating_key: Option<Key>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub index: Option<u32>,
    pub parent_index: Option<u32>,
    pub parent_rating_key: Option<Key>,
    pub grandparent_rating_key: Option<Key>,
    pub grandparent_key: Option<String>,
    #[serde(rename = "librarySectionID")]
    pub library_section_id: Option<Key>,
    #[serde(rename = "Label", default)]
    pub labels: Vec<Tag>,
    #[serde(rename = "Media", default)]
    pub media: Vec<Media>,
    pub viewed_at: Option<i64>,
    #[serde(rename = "accountID")]
    pub account_id: Option<Key>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Media {
    #[serde(rename = "Part", default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    pub id: Key,
    #[serde(rename = "Stream", default)]
    pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: u64,
    pub stream_type: u8,
    pub language_code: Option<String>,
    pub codec: Option<String>,
    pub audio_channel_layout: Option<String>,
    pub channels: Option<u32>,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub hearing_impaired: bool,
    pub title: Option<String>,
    pub display_title: Option<String>,
    pub extended_display_title: Option<String>,
}

/// Title words marking commentary and audio description tracks.
const DESCRIPTIVE_TERMS: [&str; 6] = [
    "commentary",
    "description",
    "descriptive",
    "narration",
    "narrative",
    "described",
];

impl Stream {
    fn language(&self) -> &str {
        self.language_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .unwrap_or(UNDETERMINED_LANGUAGE)
    }

    fn display_name(&self) -> Option<&str> {
        self.extended_display_title
            .as_deref()
            .or(self.display_title.as_deref())
    }

    /// Most specific title available, lowercased.
    fn match_title(&self) -> String {
        self.display_name()
            .or(self.title.as_deref())
            .unwrap_or_default()
            .to_lowercase()
    }

    fn is_descriptive(&self) -> bool {
        mentions_description(&self.match_title())
    }

    pub fn descriptor(&self) -> TrackId {
        TrackId {
            codec: self.codec.clone(),
            channel_layout: self.audio_channel_layout.clone(),
            channels: self.channels,
            title: self.title.clone(),
            display_title: self.display_name().map(str::to_string),
            forced: self.forced,
            hearing_impaired: self.hearing_impaired,
            descriptive: self.stream_type == STREAM_TYPE_AUDIO && self.is_descriptive(),
            ..TrackId::new(self.language())
        }
    }
}

fn mentions_description(title: &str) -> bool {
    DESCRIPTIVE_TERMS.iter().any(|term| title.contains(term))
}

/// Highest scoring stream, the earliest one on ties.
fn best_match<'a>(streams: Vec<&'a Stream>, score: impl Fn(&Stream) -> u32) -> Option<&'a Stream> {
    let mut best: Option<(&Stream, u32)> = None;
    for stream in streams {
        let value = score(stream);
        if best.is_none_or(|(_, top)| value > top) {
            best = Some((stream, value));
        }
    }
    best.map(|(stream, _)| stream)
}

/// Streams to select on one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartStreams {
    pub audio: u64,
    /// `0` turns subtitles off.
    pub subtitle: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContainer {
    pub machine_identifier: String,
    #[serde(default)]
    pub version: String,
}

impl MetadataItem {
    fn rating_key(&self) -> Option<String> {
        self.rating_key
            .as_ref()
            .map(Key::to_string)
            .filter(|key| !key.is_empty())
    }

    fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    pub fn into_show(self) -> Option<ShowListing> {
        if !self.is_kind("show") {
            return None;
        }
        let id = self.rating_key()?;
        Some(ShowListing {
            id: ShowId::new(id),
            title: self.title.unwrap_or_default(),
            labels: self
                .labels
                .into_iter()
                .map(|label| label.tag)
                .collect::<BTreeSet<_>>(),
        })
    }

    /// The "All episodes" pseudo entry carries no index and is skipped.
    pub fn into_season(self) -> Option<SeasonListing> {
        if !self.is_kind("season") {
            return None;
        }
        Some(SeasonListing {
            id: SeasonId::new(self.rating_key()?),
            index: self.index?,
        })
    }

    pub fn into_episode(self) -> Option<EpisodeListing> {
        if !self.is_kind("episode") {
            return None;
        }
        let id = self.rating_key()?;
        let position = SequencePosition::new(self.parent_index?, self.index?);
        let parts = self
            .media
            .iter()
            .flat_map(|media| &media.parts)
            .map(|part| PartId::new(part.id.to_string()))
            .collect();
        Some(EpisodeListing {
            id: EpisodeId::new(id),
            title: self.title.unwrap_or_default(),
            position,
            parts,
        })
    }

    pub fn into_history_entry(self) -> Option<HistoryEntry> {
        if !self.is_kind("episode") {
            return None;
        }
        let episode_id = EpisodeId::new(self.rating_key()?);
        let user_id = UserId::new(self.account_id.as_ref()?.to_string());
        let viewed_at = DateTime::<Utc>::from_timestamp(self.viewed_at?, 0)?;
        let show_id = self
            .grandparent_rating_key
            .as_ref()
            .map(Key::to_string)
            .or_else(|| {
                self.grandparent_key
                    .as_deref()
                    .and_then(|key| key.rsplit('/').next())
                    .map(str::to_string)
            })
            .filter(|key| !key.is_empty())
            .map(ShowId::new);
        Some(HistoryEntry {
            user_id,
            episode_id,
            show_id,
            viewed_at,
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.media.iter().flat_map(|media| &media.parts)
    }

    /// Tracks currently selected on the first part. Plex plays the first
    /// audio stream when none is flagged as selected.
    pub fn selected_tracks(&self) -> SelectedTracks {
        let Some(part) = self.parts().next() else {
            return SelectedTracks {
                audio: None,
                subtitle: None,
            };
        };
        SelectedTracks {
            audio: part.selected_audio().map(Stream::descriptor),
            subtitle: part.selected_subtitle().map(Stream::descriptor),
        }
    }
}

impl Part {
    pub fn streams_of(&self, stream_type: u8) -> impl Iterator<Item = &Stream> {
        self.streams
            .iter()
            .filter(move |stream| stream.stream_type == stream_type)
    }

    pub fn selected_audio(&self) -> Option<&Stream> {
        self.streams_of(STREAM_TYPE_AUDIO)
            .find(|stream| stream.selected)
            .or_else(|| self.streams_of(STREAM_TYPE_AUDIO).next())
    }

    pub fn selected_subtitle(&self) -> Option<&Stream> {
        self.streams_of(STREAM_TYPE_SUBTITLE)
            .find(|stream| stream.selected)
    }

    /// Audio stream equivalent to `reference`.
    ///
    /// Candidates share the reference language and are descriptive exactly
    /// when the reference is. Among several, codec (+5), channel layout (+3)
    /// and title (+5) matches decide. When every audio stream on the part
    /// carries the same title the channel count breaks ties: a stereo or
    /// mono reference prefers streams with more channels (+8), a surround
    /// reference streams with at least as many (+1).
    pub fn match_audio(&self, reference: &TrackId) -> Option<&Stream> {
        let streams: Vec<&Stream> = self.streams_of(STREAM_TYPE_AUDIO).collect();
        let ambiguous = streams
            .first()
            .is_some_and(|first| streams.iter().all(|stream| stream.title == first.title));
        let candidates: Vec<&Stream> = streams
            .iter()
            .copied()
            .filter(|stream| stream.language() == reference.language)
            .filter(|stream| stream.is_descriptive() == reference.descriptive)
            .collect();

        let reference_title = reference
            .display_title
            .as_deref()
            .or(reference.title.as_deref())
            .unwrap_or_default()
            .to_lowercase();

        best_match(candidates, |stream| {
            let mut score = 0;
            if reference.codec == stream.codec {
                score += 5;
            }
            if reference.channel_layout == stream.audio_channel_layout {
                score += 3;
            }
            if ambiguous && let (Some(wanted), Some(offered)) = (reference.channels, stream.channels) {
                if wanted < 3 {
                    if wanted < offered {
                        score += 8;
                    }
                } else if wanted <= offered {
                    score += 1;
                }
            }
            if reference_title == stream.match_title() {
                score += 5;
            }
            score
        })
    }

    /// Subtitle stream equivalent to `reference`.
    ///
    /// A forced or SDH reference only matches streams with the same flag.
    /// With subtitles off the forced subtitle in the audio language is the
    /// match, so foreign dialogue stays readable. Ties are broken by the
    /// forced (+3) and SDH (+3) flags, codec (+1) and title (+5).
    pub fn match_subtitle(&self, reference: Option<&TrackId>, audio: &TrackId) -> Option<&Stream> {
        let (language, forced, hearing_impaired) = match reference {
            Some(track) => (track.language(), track.forced, track.hearing_impaired),
            None => (audio.language(), true, false),
        };
        let candidates: Vec<&Stream> = self
            .streams_of(STREAM_TYPE_SUBTITLE)
            .filter(|stream| stream.language() == language)
            .filter(|stream| !forced || stream.forced)
            .filter(|stream| !hearing_impaired || stream.hearing_impaired)
            .collect();

        best_match(candidates, |stream| {
            let mut score = 0;
            if stream.forced == forced {
                score += 3;
            }
            if stream.hearing_impaired == hearing_impaired {
                score += 3;
            }
            if let Some(track) = reference {
                if track.codec.is_some() && track.codec == stream.codec {
                    score += 1;
                }
                if track.title.is_some() && track.title == stream.title {
                    score += 5;
                }
            }
            score
        })
    }

    /// Streams to select so this part plays `audio` and `subtitle`, or
    /// `None` when it already does.
    ///
    /// A missing audio track or a missing regular subtitle is an error. A
    /// forced subtitle without a counterpart turns subtitles off.
    pub fn plan(&self, audio: &TrackId, subtitle: Option<&TrackId>) -> Result<Option<PartStreams>> {
        let audio_stream = self.match_audio(audio).ok_or_else(|| {
            SyncError::TrackUnavailable(format!("part {} has no {audio} audio", self.id))
        })?;
        let subtitle_stream = match (subtitle, self.match_subtitle(subtitle, audio)) {
            (_, Some(stream)) => Some(stream),
            (None, None) => None,
            (Some(track), None) if track.forced => None,
            (Some(track), None) => {
                return Err(SyncError::TrackUnavailable(format!(
                    "part {} has no {track} subtitles",
                    self.id
                )));
            }
        };

        let current = (
            self.selected_audio().map(|stream| stream.id),
            self.selected_subtitle().map(|stream| stream.id),
        );
        let wanted = (Some(audio_stream.id), subtitle_stream.map(|stream| stream.id));
        if current == wanted {
            return Ok(None);
        }
        Ok(Some(PartStreams {
            audio: audio_stream.id,
            subtitle: subtitle_stream.map_or(0, |stream| stream.id),
        }))
    }
}

/// Body of the `payload` field of a Plex webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    #[serde(rename = "Account")]
    pub account: Option<WebhookAccount>,
    #[serde(rename = "Metadata")]
    pub metadata: Option<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAccount {
    pub id: Key,
    pub title: Option<String>,
}

impl WebhookPayload {
    /// Maps the webhook onto an inbound event. Non-episode media and events
    /// tracksync does not react to yield `None`.
    pub fn into_event(self) -> Option<InboundEvent> {
        let metadata = self.metadata?;
        let library_id = metadata
            .library_section_id
            .as_ref()
            .map(|key| LibraryId::new(key.to_string()));
        match self.event.as_str() {
            "media.play" | "media.resume" => {
                if !metadata.is_kind("episode") {
                    return None;
                }
                let account = self.account?;
                Some(InboundEvent::Played(PlaybackEvent {
                    user_id: UserId::new(account.id.to_string()),
                    episode_id: EpisodeId::new(metadata.rating_key()?),
                    show_id: metadata
                        .grandparent_rating_key
                        .as_ref()
                        .map(|key| ShowId::new(key.to_string())),
                    library_id,
                    tracks: None,
                }))
            }
            "library.new" => {
                let show_id = match metadata.kind.as_deref() {
                    Some("show") => metadata.rating_key(),
                    Some("season") => metadata.parent_rating_key.as_ref().map(Key::to_string),
                    Some("episode") => metadata
                        .grandparent_rating_key
                        .as_ref()
                        .map(Key::to_string),
                    _ => return None,
                };
                Some(InboundEvent::Scanned(ScanEvent {
                    library_id,
                    show_id: show_id.map(ShowId::new),
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode_detail() -> MetadataItem {
        let body = r#"{"MediaContainer":{"Metadata":[{
            "ratingKey":"102","type":"episode","title":"Pilot","index":2,"parentIndex":1,
            "grandparentRatingKey":"100",
            "Media":[{"Part":[{"id":555,"Stream":[
                {"id":1,"streamType":1},
                {"id":2,"streamType":2,"languageCode":"eng","codec":"ac3","audioChannelLayout":"5.1(side)","channels":6,"selected":true,"displayTitle":"English (AC3 5.1)"},
                {"id":3,"streamType":2,"languageCode":"kor","codec":"aac","audioChannelLayout":"stereo","channels":2,"title":"Commentary","displayTitle":"Korean (AAC Stereo)","extendedDisplayTitle":"Commentary (Korean AAC Stereo)"},
                {"id":4,"streamType":2,"languageCode":"kor","codec":"aac","audioChannelLayout":"stereo","channels":2,"displayTitle":"Korean (AAC Stereo)"},
                {"id":5,"streamType":3,"languageCode":"eng","codec":"srt","forced":true,"title":"Forced","displayTitle":"English Forced (SRT)"},
                {"id":6,"streamType":3,"languageCode":"eng","codec":"srt","selected":true,"displayTitle":"English (SRT)"},
                {"id":7,"streamType":3,"languageCode":"eng","codec":"srt","hearingImpaired":true,"title":"SDH","displayTitle":"English SDH (SRT)"}
            ]}]}]
        }]}}"#;
        let envelope: Envelope<MetadataContainer> = serde_json::from_str(body).unwrap();
        envelope.container.metadata.into_iter().next().unwrap()
    }

    fn stream<'a>(part: &'a Part, id: u64) -> &'a Stream {
        part.streams.iter().find(|stream| stream.id == id).unwrap()
    }

    fn select(item: &mut MetadataItem, audio: u64, subtitle: Option<u64>) {
        for stream in &mut item.media[0].parts[0].streams {
            stream.selected = stream.id == audio || Some(stream.id) == subtitle;
        }
    }

    #[test]
    fn episode_listing_and_selection_are_read() {
        let item = episode_detail();
        let selected = item.selected_tracks();
        let audio = selected.audio.unwrap();
        assert_eq!(audio.language(), "eng");
        assert_eq!(audio.codec.as_deref(), Some("ac3"));
        assert_eq!(audio.channels, Some(6));
        assert_eq!(audio.to_string(), "English (AC3 5.1)");
        let subtitle = selected.subtitle.unwrap();
        assert!(!subtitle.forced);
        assert!(!subtitle.hearing_impaired);

        let listing = item.into_episode().unwrap();
        assert_eq!(listing.position, SequencePosition::new(1, 2));
        assert_eq!(listing.parts, vec![PartId::new("555")]);
    }

    #[test]
    fn commentary_and_forced_selections_survive_a_round_trip() {
        let mut item = episode_detail();
        select(&mut item, 3, Some(5));
        let selected = item.selected_tracks();
        let audio = selected.audio.unwrap();
        let subtitle = selected.subtitle.unwrap();
        assert!(audio.descriptive);
        assert!(subtitle.forced);

        let part = item.parts().next().unwrap();
        assert_eq!(part.match_audio(&audio).unwrap().id, 3);
        assert_eq!(part.match_subtitle(Some(&subtitle), &audio).unwrap().id, 5);
        assert_eq!(part.plan(&audio, Some(&subtitle)).unwrap(), None);
    }

    #[test]
    fn main_audio_never_picks_commentary() {
        let item = episode_detail();
        let part = item.parts().next().unwrap();
        assert_eq!(part.match_audio(&"kor".into()).unwrap().id, 4);

        let commentary = stream(part, 3).descriptor();
        assert_eq!(part.match_audio(&commentary).unwrap().id, 3);
        assert!(part.match_audio(&"jpn".into()).is_none());
    }

    #[test]
    fn subtitle_flags_narrow_the_match() {
        let item = episode_detail();
        let part = item.parts().next().unwrap();
        let audio = TrackId::new("eng");

        assert_eq!(part.match_subtitle(Some(&"eng".into()), &audio).unwrap().id, 6);
        let sdh = stream(part, 7).descriptor();
        assert_eq!(part.match_subtitle(Some(&sdh), &audio).unwrap().id, 7);
        let forced = TrackId::new("eng").with_forced(true);
        assert_eq!(part.match_subtitle(Some(&forced), &audio).unwrap().id, 5);
    }

    #[test]
    fn subtitles_off_keeps_forced_subtitles_of_the_audio_language() {
        let item = episode_detail();
        let part = item.parts().next().unwrap();

        assert_eq!(
            part.plan(&"eng".into(), None).unwrap(),
            Some(PartStreams {
                audio: 2,
                subtitle: 5,
            })
        );
        assert_eq!(
            part.plan(&"kor".into(), None).unwrap(),
            Some(PartStreams {
                audio: 4,
                subtitle: 0,
            })
        );
    }

    #[test]
    fn missing_tracks_are_reported() {
        let item = episode_detail();
        let part = item.parts().next().unwrap();

        let err = part.plan(&"jpn".into(), None).unwrap_err();
        assert!(matches!(err, SyncError::TrackUnavailable(_)));
        let err = part.plan(&"eng".into(), Some(&"fre".into())).unwrap_err();
        assert!(matches!(err, SyncError::TrackUnavailable(_)));

        let forced_french = TrackId::new("fre").with_forced(true);
        assert_eq!(
            part.plan(&"kor".into(), Some(&forced_french)).unwrap(),
            Some(PartStreams {
                audio: 4,
                subtitle: 0,
            })
        );
    }

    #[test]
    fn identical_audio_titles_prefer_more_channels_for_stereo() {
        let body = r#"{"id":9,"Stream":[
            {"id":11,"streamType":2,"languageCode":"jpn","codec":"aac","channels":2,"audioChannelLayout":"stereo"},
            {"id":12,"streamType":2,"languageCode":"jpn","codec":"aac","channels":6,"audioChannelLayout":"5.1"}
        ]}"#;
        let part: Part = serde_json::from_str(body).unwrap();
        let surround = TrackId::new("jpn").with_codec("aac").with_channels("5.1", 6);
        assert_eq!(part.match_audio(&surround).unwrap().id, 12);

        // The layout matches stream 11, yet untitled twins favour more channels.
        let stereo = TrackId::new("jpn").with_codec("aac").with_channels("stereo", 2);
        assert_eq!(part.match_audio(&stereo).unwrap().id, 12);
    }

    #[test]
    fn only_show_sections_are_listed() {
        let body = r#"{"MediaContainer":{"Directory":[
            {"key":"1","type":"movie","title":"Movies"},
            {"key":2,"type":"show","title":"TV Shows"}
        ]}}"#;
        let envelope: Envelope<SectionsContainer> = serde_json::from_str(body).unwrap();
        let listings: Vec<_> = envelope
            .container
            .directories
            .into_iter()
            .filter_map(SectionDirectory::into_listing)
            .collect();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, LibraryId::new("2"));
    }

    #[test]
    fn seasons_skip_the_all_episodes_entry() {
        let body = r#"{"MediaContainer":{"Metadata":[
            {"ratingKey":"101","type":"season","index":1},
            {"key":"/library/metadata/100/allLeaves","type":"season","title":"All episodes"}
        ]}}"#;
        let envelope: Envelope<MetadataContainer> = serde_json::from_str(body).unwrap();
        let seasons: Vec<_> = envelope
            .container
            .metadata
            .into_iter()
            .filter_map(MetadataItem::into_season)
            .collect();
        assert_eq!(seasons.len(), 1);
        assert_eq!(seasons[0].index, 1);
    }

    #[test]
    fn history_entries_resolve_the_show_from_its_key() {
        let body = r#"{"MediaContainer":{"Metadata":[
            {"ratingKey":"102","type":"episode","grandparentKey":"/library/metadata/100","viewedAt":1700000000,"accountID":7},
            {"ratingKey":"900","type":"movie","viewedAt":1700000000,"accountID":7}
        ]}}"#;
        let envelope: Envelope<MetadataContainer> = serde_json::from_str(body).unwrap();
        let entries: Vec<_> = envelope
            .container
            .metadata
            .into_iter()
            .filter_map(MetadataItem::into_history_entry)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, UserId::new("7"));
        assert_eq!(entries[0].show_id, Some(ShowId::new("100")));
    }

    #[test]
    fn webhook_events_map_onto_inbound_events() {
        let play: WebhookPayload = serde_json::from_str(
            r#"{"event":"media.play","Account":{"id":1,"title":"owner"},
                "Metadata":{"ratingKey":"102","type":"episode","grandparentRatingKey":"100","librarySectionID":2}}"#,
        )
        .unwrap();
        let Some(InboundEvent::Played(event)) = play.into_event() else {
            panic!("expected a played event");
        };
        assert_eq!(event.user_id, UserId::new("1"));
        assert_eq!(event.show_id, Some(ShowId::new("100")));
        assert_eq!(event.library_id, Some(LibraryId::new("2")));

        let added: WebhookPayload = serde_json::from_str(
            r#"{"event":"library.new","Metadata":{"ratingKey":"103","type":"episode","grandparentRatingKey":"100","librarySectionID":"2"}}"#,
        )
        .unwrap();
        assert_eq!(
            added.into_event(),
            Some(InboundEvent::Scanned(ScanEvent {
                library_id: Some(LibraryId::new("2")),
                show_id: Some(ShowId::new("100")),
            }))
        );

        let movie: WebhookPayload = serde_json::from_str(
            r#"{"event":"media.play","Account":{"id":1},"Metadata":{"ratingKey":"9","type":"movie"}}"#,
        )
        .unwrap();
        assert!(movie.into_event().is_none());

        let pause: WebhookPayload = serde_json::from_str(
            r#"{"event":"media.pause","Account":{"id":1},"Metadata":{"ratingKey":"102","type":"episode"}}"#,
        )
        .unwrap();
        assert!(pause.into_event().is_none());
    }
}
