//! Picks the episodes a selection propagates to.
//!
//! Both functions are pure over a show snapshot taken after the (show, user)
//! lock was acquired.

use tracksync_model::{
    Episode, EpisodeId, SequencePosition, Show, TrackSelection, UpdateLevel, UpdateStrategy,
    UserId,
};

/// Target episodes for a selection made on `source`, in ascending position.
///
/// Returns nothing when `source` is not part of `show`.
pub fn resolve(
    show: &Show,
    source: &EpisodeId,
    level: UpdateLevel,
    strategy: UpdateStrategy,
) -> Vec<EpisodeId> {
    let Some(source_episode) = show.episode(source) else {
        return Vec::new();
    };
    let origin = source_episode.position;

    let candidates: Box<dyn Iterator<Item = &Episode>> = match level {
        UpdateLevel::Show => Box::new(show.episodes()),
        UpdateLevel::Season => match show.season_of(source) {
            Some(season) => Box::new(season.episodes.iter()),
            None => return Vec::new(),
        },
    };

    let mut targets: Vec<(SequencePosition, EpisodeId)> = candidates
        .filter(|episode| &episode.id != source)
        .filter(|episode| match strategy {
            UpdateStrategy::All => true,
            UpdateStrategy::Next => episode.position > origin,
        })
        .map(|episode| (episode.position, episode.id.clone()))
        .collect();

    targets.sort();
    targets.into_iter().map(|(_, id)| id).collect()
}

/// The user's most recent selection in the show, with the episode it sits on.
///
/// "Most recent" is the largest `observed_at`. Ties prefer a selection the
/// user made over a propagated copy, then the later position. Episodes in
/// `exclude` (typically the new episodes being filled in) are skipped.
pub fn baseline<'a>(
    show: &'a Show,
    user: &UserId,
    exclude: &[EpisodeId],
) -> Option<(&'a Episode, &'a TrackSelection)> {
    show.episodes()
        .filter(|episode| !exclude.contains(&episode.id))
        .filter_map(|episode| {
            episode
                .selection_for(user)
                .map(|selection| (episode, selection))
        })
        .max_by_key(|(episode, selection)| {
            (selection.observed_at, selection.is_observed(), episode.position)
        })
}
