//! Audibility selector: derives the currently-playing track from deck state.

use crate::codec::{State, StateValue};
use std::collections::HashMap;
use std::time::Instant;

/// Selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixMode {
    Newest,
    Oldest,
}

/// A currently-selected track, as exposed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayingTrack {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub bpm: Option<String>,
    pub genre: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Deck {
    artist: Option<String>,
    title: Option<String>,
    album: Option<String>,
    bpm: Option<f64>,
    genre: Option<String>,
    play: bool,
    fader_position: f64,
    first_played_at: Option<Instant>,
}

impl Deck {
    fn effective_volume(&self, crossfader_pos: f64, deck_index: u8) -> f64 {
        self.fader_position * crossfader_factor(deck_index, crossfader_pos)
    }
}

/// Crossfader attenuation for a given deck side, for one side of the mix.
pub fn crossfader_factor(deck_index: u8, x: f64) -> f64 {
    let is_left = deck_index == 1 || deck_index == 3;
    if is_left {
        if x > 0.8 {
            0.0
        } else if x <= 0.5 {
            1.0
        } else {
            1.0 - (x - 0.5) / 0.3
        }
    } else if x < 0.2 {
        0.0
    } else if x >= 0.5 {
        1.0
    } else {
        (x - 0.2) / 0.3
    }
}

/// Accumulates per-deck state and selects the currently-audible track.
pub struct AudibilitySelector {
    decks: HashMap<u8, Deck>,
    crossfader_position: f64,
    mixmode: MixMode,
    skip: Vec<u8>,
    threshold: f64,
}

impl AudibilitySelector {
    pub fn new(mixmode: MixMode, skip: Vec<u8>, threshold: f64) -> Self {
        AudibilitySelector {
            decks: HashMap::new(),
            crossfader_position: 0.5,
            mixmode,
            skip,
            threshold,
        }
    }

    pub fn set_mixmode(&mut self, mixmode: MixMode) {
        self.mixmode = mixmode;
    }

    /// Updates the accumulator from one decoded state record. `Play=true`
    /// alone is never sufficient to select a track -- effective volume also
    /// has to clear the threshold.
    pub fn update_state(&mut self, state: &State) {
        if state.name == "Mixer/CrossfaderPosition" {
            if let StateValue::Float(v) = &state.value {
                self.crossfader_position = *v;
                self.recompute_first_played_edges();
            }
            return;
        }

        let Some((deck_index, field)) = parse_deck_path(&state.name) else {
            return;
        };
        let deck = self.decks.entry(deck_index).or_default();
        match field {
            DeckField::Play => {
                if let StateValue::Bool(v) = &state.value {
                    deck.play = *v;
                }
            }
            DeckField::Artist => {
                if let StateValue::Text(v) = &state.value {
                    deck.artist = Some(v.clone());
                }
            }
            DeckField::Title => {
                if let StateValue::Text(v) = &state.value {
                    deck.title = Some(v.clone());
                }
            }
            DeckField::Album => {
                if let StateValue::Text(v) = &state.value {
                    deck.album = Some(v.clone());
                }
            }
            DeckField::Bpm => {
                if let StateValue::Float(v) = &state.value {
                    deck.bpm = Some(*v);
                } else if let StateValue::Int(v) = &state.value {
                    deck.bpm = Some(*v as f64);
                }
            }
            DeckField::Genre => {
                if let StateValue::Text(v) = &state.value {
                    deck.genre = Some(v.clone());
                }
            }
            DeckField::FaderPosition => {
                if let StateValue::Float(v) = &state.value {
                    deck.fader_position = *v;
                }
            }
        }
        self.recompute_first_played_edge(deck_index);
    }

    fn recompute_first_played_edges(&mut self) {
        let indices: Vec<u8> = self.decks.keys().copied().collect();
        for i in indices {
            self.recompute_first_played_edge(i);
        }
    }

    fn recompute_first_played_edge(&mut self, deck_index: u8) {
        let crossfader_position = self.crossfader_position;
        let Some(deck) = self.decks.get_mut(&deck_index) else {
            return;
        };
        let audible = deck.effective_volume(crossfader_position, deck_index) > self.threshold;
        let playing_and_audible = deck.play && audible;
        match (playing_and_audible, deck.first_played_at) {
            (true, None) => deck.first_played_at = Some(Instant::now()),
            (false, Some(_)) => deck.first_played_at = None,
            _ => {}
        }
    }

    /// Returns the currently-selected track, or `None` if no deck qualifies.
    pub fn get_playing_track(&self) -> Option<PlayingTrack> {
        let mut candidates: Vec<(u8, &Deck, f64)> = self
            .decks
            .iter()
            .filter(|(idx, _)| !self.skip.contains(idx))
            .filter_map(|(idx, deck)| {
                let volume = deck.effective_volume(self.crossfader_position, *idx);
                if deck.play && volume > self.threshold && deck.first_played_at.is_some() {
                    Some((*idx, deck, volume))
                } else {
                    None
                }
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let max_volume = candidates
            .iter()
            .map(|(_, _, v)| *v)
            .fold(f64::MIN, f64::max);
        candidates.retain(|(_, _, v)| *v >= max_volume * 0.8);

        candidates.sort_by(|a, b| {
            let time_cmp = match self.mixmode {
                MixMode::Newest => b.1.first_played_at.cmp(&a.1.first_played_at),
                MixMode::Oldest => a.1.first_played_at.cmp(&b.1.first_played_at),
            };
            time_cmp.then(a.0.cmp(&b.0))
        });

        let (_, deck, _) = candidates.first()?;
        let artist = deck.artist.clone()?;
        let title = deck.title.clone()?;
        Some(PlayingTrack {
            artist,
            title,
            album: deck.album.clone(),
            bpm: deck.bpm.map(|b| format_bpm(b)),
            genre: deck.genre.clone(),
        })
    }
}

fn format_bpm(bpm: f64) -> String {
    format!("{bpm:.2}")
}

enum DeckField {
    Play,
    Artist,
    Title,
    Album,
    Bpm,
    Genre,
    FaderPosition,
}

/// Parses `Engine/Deck<N>/...` and `Mixer/CH<N>faderPosition` paths into a
/// deck index and recognized field. Unknown paths return `None` and are
/// stored nowhere -- the selector only tracks what it needs.
fn parse_deck_path(path: &str) -> Option<(u8, DeckField)> {
    if let Some(rest) = path.strip_prefix("Mixer/CH") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if rest[digits.len()..] == *"faderPosition" {
            return Some((digits.parse().ok()?, DeckField::FaderPosition));
        }
        return None;
    }
    let rest = path.strip_prefix("Engine/Deck")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let deck_index: u8 = digits.parse().ok()?;
    let remainder = &rest[digits.len()..];
    let field = match remainder {
        "/Play" => DeckField::Play,
        "/Track/ArtistName" => DeckField::Artist,
        "/Track/SongName" => DeckField::Title,
        "/Track/AlbumName" => DeckField::Album,
        "/Track/BPM" => DeckField::Bpm,
        "/Track/Genre" => DeckField::Genre,
        _ => return None,
    };
    Some((deck_index, field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str, value: StateValue) -> State {
        State {
            name: name.to_string(),
            value,
            type_hint: 0,
        }
    }

    #[test]
    fn crossfader_factor_table() {
        assert_eq!(crossfader_factor(1, 0.0), 1.0);
        assert_eq!(crossfader_factor(1, 0.9), 0.0);
        assert!((crossfader_factor(1, 0.65) - 0.5).abs() < 1e-9);
        assert_eq!(crossfader_factor(2, 1.0), 1.0);
        assert_eq!(crossfader_factor(2, 0.1), 0.0);
        assert!((crossfader_factor(2, 0.35) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn single_deck_playing_is_selected_and_crossfader_cuts_it() {
        let mut selector = AudibilitySelector::new(MixMode::Newest, vec![], 0.1);
        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(0.5)));
        selector.update_state(&state("Mixer/CH2faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck2/Play", StateValue::Bool(true)));
        selector.update_state(&state("Engine/Deck2/Track/ArtistName", StateValue::Text("A".into())));
        selector.update_state(&state("Engine/Deck2/Track/SongName", StateValue::Text("X".into())));
        assert!(selector.get_playing_track().is_some());

        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(0.1)));
        assert!(selector.get_playing_track().is_none());
    }

    #[test]
    fn newest_mode_picks_the_later_started_deck() {
        let mut selector = AudibilitySelector::new(MixMode::Newest, vec![], 0.1);
        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(0.5)));
        selector.update_state(&state("Mixer/CH1faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck1/Play", StateValue::Bool(true)));
        selector.update_state(&state("Engine/Deck1/Track/ArtistName", StateValue::Text("A".into())));
        selector.update_state(&state("Engine/Deck1/Track/SongName", StateValue::Text("X".into())));

        std::thread::sleep(std::time::Duration::from_millis(5));

        selector.update_state(&state("Mixer/CH2faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck2/Play", StateValue::Bool(true)));
        selector.update_state(&state("Engine/Deck2/Track/ArtistName", StateValue::Text("B".into())));
        selector.update_state(&state("Engine/Deck2/Track/SongName", StateValue::Text("Y".into())));

        let track = selector.get_playing_track().unwrap();
        assert_eq!(track.artist, "B");
        assert_eq!(track.title, "Y");
    }

    #[test]
    fn crossfader_extremes_select_one_side() {
        let mut selector = AudibilitySelector::new(MixMode::Newest, vec![], 0.1);
        selector.update_state(&state("Mixer/CH1faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck1/Play", StateValue::Bool(true)));
        selector.update_state(&state("Engine/Deck1/Track/ArtistName", StateValue::Text("A".into())));
        selector.update_state(&state("Engine/Deck1/Track/SongName", StateValue::Text("X".into())));
        selector.update_state(&state("Mixer/CH2faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck2/Play", StateValue::Bool(true)));
        selector.update_state(&state("Engine/Deck2/Track/ArtistName", StateValue::Text("B".into())));
        selector.update_state(&state("Engine/Deck2/Track/SongName", StateValue::Text("Y".into())));

        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(0.0)));
        assert_eq!(selector.get_playing_track().unwrap().artist, "A");

        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(1.0)));
        assert_eq!(selector.get_playing_track().unwrap().artist, "B");
    }

    #[test]
    fn missing_artist_or_title_skips_the_deck() {
        let mut selector = AudibilitySelector::new(MixMode::Newest, vec![], 0.1);
        selector.update_state(&state("Mixer/CrossfaderPosition", StateValue::Float(0.5)));
        selector.update_state(&state("Mixer/CH1faderPosition", StateValue::Float(1.0)));
        selector.update_state(&state("Engine/Deck1/Play", StateValue::Bool(true)));
        assert!(selector.get_playing_track().is_none());
    }
}
