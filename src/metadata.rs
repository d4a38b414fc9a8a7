//! Track metadata: the now-playing oracle, template rendering and charset
//! handling for server-bound strings.

use serde::{Deserialize, Serialize};

/// A snapshot of the track a deck is currently playing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackInfo {
    /// Library identifier, if the track has one.
    pub id: Option<u64>,
    /// Track artist.
    pub artist: String,
    /// Track title.
    pub title: String,
    /// Track album.
    pub album: String,
}

/// Oracle answering "what is playing right now?".
///
/// Workers poll this on a heartbeat; an implementation typically fronts the
/// application's player state. Returning `None` means nothing is playing
/// and leaves the stream metadata untouched.
pub trait NowPlaying: Send + Sync {
    /// The currently audible track, if any.
    fn current_track(&self) -> Option<TrackInfo>;
}

/// Character set used when encoding metadata strings for the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataCharset {
    /// ISO-8859-1, the protocol default.
    #[default]
    Latin1,
    /// UTF-8, the common modern choice.
    Utf8,
}

/// Renders a metadata template by substituting `$artist` and `$title` in a
/// single left-to-right pass.
///
/// Replacement text is never rescanned, so adjacent tokens cannot cascade:
/// `"$artist$title"` always becomes `"<artist><title>"`.
pub fn render_template(template: &str, artist: &str, title: &str) -> String {
    const ARTIST_TOKEN: &str = "$artist";
    const TITLE_TOKEN: &str = "$title";

    let mut out = String::with_capacity(template.len() + artist.len() + title.len());
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        if tail.starts_with(ARTIST_TOKEN) {
            out.push_str(artist);
            rest = &tail[ARTIST_TOKEN.len()..];
        } else if tail.starts_with(TITLE_TOKEN) {
            out.push_str(title);
            rest = &tail[TITLE_TOKEN.len()..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Encodes `text` in the given charset.
///
/// Latin-1 maps characters outside U+00FF to `?`, mirroring the lossy
/// conversion servers have historically received.
pub fn encode_text(text: &str, charset: MetadataCharset) -> Vec<u8> {
    match charset {
        MetadataCharset::Utf8 => text.as_bytes().to_vec(),
        MetadataCharset::Latin1 => text
            .chars()
            .map(|c| if (c as u32) <= 0xFF { c as u32 as u8 } else { b'?' })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_replaces_every_token() {
        let out = render_template("Now: $artist — $title ($artist)", "DJ A", "Song");
        assert_eq!(out, "Now: DJ A — Song (DJ A)");
    }

    #[test]
    fn adjacent_tokens_do_not_cascade() {
        assert_eq!(render_template("$artist$title", "$title", "T"), "$titleT");
    }

    #[test]
    fn bare_dollar_is_kept() {
        assert_eq!(render_template("$5 — $titles", "A", "T"), "$5 — Ts");
    }

    #[test]
    fn tokenless_template_is_unchanged() {
        assert_eq!(render_template("static name", "A", "T"), "static name");
    }

    #[test]
    fn latin1_replaces_unmappable_characters() {
        assert_eq!(encode_text("Café", MetadataCharset::Latin1), b"Caf\xe9");
        assert_eq!(encode_text("火", MetadataCharset::Latin1), b"?");
        assert_eq!(encode_text("Café", MetadataCharset::Utf8), "Café".as_bytes());
    }
}
