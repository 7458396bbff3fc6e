use std::fmt;

use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ids::EpisodeId;

/// One audio or subtitle stream, described well enough to find its
/// counterpart on another episode.
///
/// Equality covers every attribute, so a forced English subtitle and a full
/// English subtitle are different tracks, as are a main audio track and a
/// commentary in the same language. `TrackId::new("eng")` is a bare
/// language with no further attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "TrackIdRepr"))]
pub struct TrackId {
    /// Language code as reported by the server, `und` when untagged.
    pub language: String,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub codec: Option<String>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub channel_layout: Option<String>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub channels: Option<u32>,
    /// Title given to the stream in the file.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub title: Option<String>,
    /// Most specific human readable name, e.g. `English (AC3 5.1)`.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub display_title: Option<String>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "is_false"))]
    pub forced: bool,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "is_false"))]
    pub hearing_impaired: bool,
    /// Commentary, narration or audio description.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "is_false"))]
    pub descriptive: bool,
}

pub const UNDETERMINED_LANGUAGE: &str = "und";

impl TrackId {
    pub fn new(language: impl Into<String>) -> Self {
        let language = language.into();
        let language = if language.trim().is_empty() {
            UNDETERMINED_LANGUAGE.to_string()
        } else {
            language
        };
        Self {
            language,
            ..Self::default()
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_channels(mut self, layout: impl Into<String>, channels: u32) -> Self {
        self.channel_layout = Some(layout.into());
        self.channels = Some(channels);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_display_title(mut self, title: impl Into<String>) -> Self {
        self.display_title = Some(title.into());
        self
    }

    pub fn with_forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn with_hearing_impaired(mut self, hearing_impaired: bool) -> Self {
        self.hearing_impaired = hearing_impaired;
        self
    }

    pub fn with_descriptive(mut self, descriptive: bool) -> Self {
        self.descriptive = descriptive;
        self
    }
}

/// The display title when known, otherwise the language with its flags,
/// e.g. `eng (forced)`.
impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(title) = &self.display_title {
            return f.write_str(title);
        }
        f.write_str(&self.language)?;
        let flags: Vec<&str> = [
            (self.forced, "forced"),
            (self.hearing_impaired, "SDH"),
            (self.descriptive, "descriptive"),
        ]
        .into_iter()
        .filter_map(|(set, flag)| set.then_some(flag))
        .collect();
        if !flags.is_empty() {
            write!(f, " ({})", flags.join(", "))?;
        }
        Ok(())
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(feature = "serde")]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Accepts a bare language code as well as a full descriptor.
#[cfg(feature = "serde")]
#[derive(Deserialize)]
#[serde(untagged)]
enum TrackIdRepr {
    Language(String),
    Descriptor {
        language: String,
        #[serde(default)]
        codec: Option<String>,
        #[serde(default)]
        channel_layout: Option<String>,
        #[serde(default)]
        channels: Option<u32>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        display_title: Option<String>,
        #[serde(default)]
        forced: bool,
        #[serde(default)]
        hearing_impaired: bool,
        #[serde(default)]
        descriptive: bool,
    },
}

#[cfg(feature = "serde")]
impl From<TrackIdRepr> for TrackId {
    fn from(repr: TrackIdRepr) -> Self {
        match repr {
            TrackIdRepr::Language(language) => TrackId::new(language),
            TrackIdRepr::Descriptor {
                language,
                codec,
                channel_layout,
                channels,
                title,
                display_title,
                forced,
                hearing_impaired,
                descriptive,
            } => TrackId {
                codec,
                channel_layout,
                channels,
                title,
                display_title,
                forced,
                hearing_impaired,
                descriptive,
                ..TrackId::new(language)
            },
        }
    }
}

/// Where a cached selection came from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum SelectionOrigin {
    /// The user picked these tracks on this episode.
    Observed,
    /// Copied by propagation from another episode of the same show.
    Propagated { from: EpisodeId },
}

/// Audio + subtitle choice of one user on one episode.
///
/// `subtitle: None` is the explicit "subtitles off" choice. An episode for
/// which nothing is known simply has no `TrackSelection` at all.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackSelection {
    pub audio: TrackId,
    pub subtitle: Option<TrackId>,
    /// Time of the user intent this selection reflects. Propagated copies
    /// keep the timestamp of the selection they were copied from.
    pub observed_at: DateTime<Utc>,
    pub origin: SelectionOrigin,
}

impl TrackSelection {
    pub fn observed(
        audio: impl Into<TrackId>,
        subtitle: Option<TrackId>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            audio: audio.into(),
            subtitle,
            observed_at,
            origin: SelectionOrigin::Observed,
        }
    }

    /// Copy of this selection attributed to `source`, ready to be attached
    /// to another episode.
    pub fn propagated_from(&self, source: &EpisodeId) -> Self {
        Self {
            audio: self.audio.clone(),
            subtitle: self.subtitle.clone(),
            observed_at: self.observed_at,
            origin: SelectionOrigin::Propagated {
                from: source.clone(),
            },
        }
    }

    /// True when both selections pick the same audio and subtitle tracks,
    /// compared attribute by attribute. Timestamps and origin are ignored.
    pub fn same_tracks(&self, other: &TrackSelection) -> bool {
        self.audio == other.audio && self.subtitle == other.subtitle
    }

    pub fn is_observed(&self) -> bool {
        matches!(self.origin, SelectionOrigin::Observed)
    }

    /// Short human readable form, e.g. `kor / eng` or `jpn / none`.
    pub fn describe(&self) -> String {
        match &self.subtitle {
            Some(subtitle) => format!("{} / {}", self.audio, subtitle),
            None => format!("{} / none", self.audio),
        }
    }
}
