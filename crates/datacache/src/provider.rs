//! Thin URL-building facade over the fetcher. Contains no caching logic of
//! its own -- every method composes a URL/identifier and delegates.

use crate::error::Result;
use crate::fetch::{FetchOutcome, Fetcher};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRIES: u32 = 2;

/// Well-known provider URL composition, delegating every call to `Fetcher`.
pub struct ProviderFacade<'a> {
    fetcher: &'a Fetcher,
}

impl<'a> ProviderFacade<'a> {
    pub fn new(fetcher: &'a Fetcher) -> Self {
        ProviderFacade { fetcher }
    }

    pub async fn musicbrainz_artist_search(&self, artist: &str, immediate: bool) -> Result<FetchOutcome> {
        let url = format!(
            "https://musicbrainz.org/ws/2/artist/?query={}&fmt=json",
            urlencode(artist)
        );
        self.fetcher
            .get_or_fetch(
                &url,
                artist,
                "artist_search",
                "musicbrainz",
                DEFAULT_TIMEOUT,
                DEFAULT_RETRIES,
                None,
                immediate,
                None,
            )
            .await
    }

    pub async fn musicbrainz_artist_lookup(&self, mbid: &str, immediate: bool) -> Result<FetchOutcome> {
        let url = format!("https://musicbrainz.org/ws/2/artist/{mbid}?fmt=json");
        self.fetcher
            .get_or_fetch(
                &url,
                mbid,
                "artist_details",
                "musicbrainz",
                DEFAULT_TIMEOUT,
                DEFAULT_RETRIES,
                None,
                immediate,
                None,
            )
            .await
    }

    pub async fn musicbrainz_recording_search(&self, artist: &str, title: &str, immediate: bool) -> Result<FetchOutcome> {
        let query = format!("artist:{artist} AND recording:{title}");
        let url = format!(
            "https://musicbrainz.org/ws/2/recording/?query={}&fmt=json",
            urlencode(&query)
        );
        self.fetcher
            .get_or_fetch(
                &url,
                artist,
                "recording_search",
                "musicbrainz",
                DEFAULT_TIMEOUT,
                DEFAULT_RETRIES,
                None,
                immediate,
                None,
            )
            .await
    }

    /// Generic image fetch, tagged with whichever `data_type` the caller
    /// supplies (`thumbnail`, `logo`, `banner`, `fanart`, ...).
    pub async fn image(&self, url: &str, identifier: &str, data_type: &str, provider: &str, immediate: bool) -> Result<FetchOutcome> {
        self.fetcher
            .get_or_fetch(
                url,
                identifier,
                data_type,
                provider,
                DEFAULT_TIMEOUT,
                DEFAULT_RETRIES,
                None,
                immediate,
                None,
            )
            .await
    }

    /// Fetches a biography for `identifier` in `lang`, tagged `bio_<lang>`.
    pub async fn bio(&self, url: &str, identifier: &str, provider: &str, lang: &str, immediate: bool) -> Result<FetchOutcome> {
        let data_type = format!("bio_{lang}");
        self.fetcher
            .get_or_fetch(
                url,
                identifier,
                &data_type,
                provider,
                DEFAULT_TIMEOUT,
                DEFAULT_RETRIES,
                None,
                immediate,
                None,
            )
            .await
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_spaces_and_special_chars() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("artist:Daft Punk"), "artist%3ADaft%20Punk");
    }
}
