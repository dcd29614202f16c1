// Platform detection - maps a URL to the service it points at
//
// Patterns are checked in declaration order, so more specific hosts
// (music.youtube.com) must come before their parent domain.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    YoutubeMusic,
    Youtube,
    Tiktok,
    Instagram,
    Facebook,
    Twitter,
    Linkedin,
    Pinterest,
    Spotify,
    Soundcloud,
    Vimeo,
    Podcast,
    Unsupported,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YoutubeMusic => "youtube-music",
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Twitter => "twitter",
            Self::Linkedin => "linkedin",
            Self::Pinterest => "pinterest",
            Self::Spotify => "spotify",
            Self::Soundcloud => "soundcloud",
            Self::Vimeo => "vimeo",
            Self::Podcast => "podcast",
            Self::Unsupported => "unsupported",
        }
    }

    /// Every real platform, in detection order
    pub fn supported() -> &'static [Platform] {
        &[
            Self::YoutubeMusic,
            Self::Youtube,
            Self::Tiktok,
            Self::Instagram,
            Self::Facebook,
            Self::Twitter,
            Self::Linkedin,
            Self::Pinterest,
            Self::Spotify,
            Self::Soundcloud,
            Self::Vimeo,
            Self::Podcast,
        ]
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }

    /// Human-readable hint listing the hosts a platform accepts
    pub fn hosts_hint(&self) -> &'static str {
        match self {
            Self::YoutubeMusic => "YouTube Music (music.youtube.com)",
            Self::Youtube => "YouTube (youtube.com, youtu.be)",
            Self::Tiktok => "TikTok (tiktok.com)",
            Self::Instagram => "Instagram (instagram.com)",
            Self::Facebook => "Facebook (facebook.com, fb.watch)",
            Self::Twitter => "Twitter/X (twitter.com, x.com)",
            Self::Linkedin => "LinkedIn (linkedin.com)",
            Self::Pinterest => "Pinterest (pinterest.com, pin.it)",
            Self::Spotify => "Spotify (spotify.com)",
            Self::Soundcloud => "SoundCloud (soundcloud.com)",
            Self::Vimeo => "Vimeo (vimeo.com)",
            Self::Podcast => "Podcasts (podcasts.apple.com, RSS feeds)",
            Self::Unsupported => "",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::supported()
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| format!("Unknown platform: {}", s))
    }
}

/// Host prefix: optional scheme, then any number of subdomain labels
const HOST: &str = r"^(?:[a-z][a-z0-9+.-]*://)?(?:[^/@]*@)?(?:[a-z0-9-]+\.)*";
/// Host suffix: port, path, or end of string
const END: &str = r"(?::\d+)?(?:/|$)";

fn host_pattern(domains: &str) -> Regex {
    Regex::new(&format!("{HOST}(?:{domains}){END}")).expect("valid platform pattern")
}

lazy_static::lazy_static! {
    static ref PATTERNS: Vec<(Regex, Platform)> = vec![
        (
            Regex::new(&format!(r"^(?:[a-z][a-z0-9+.-]*://)?music\.youtube\.com{END}"))
                .expect("valid platform pattern"),
            Platform::YoutubeMusic,
        ),
        (host_pattern(r"youtube\.com|youtu\.be|youtube-nocookie\.com"), Platform::Youtube),
        (host_pattern(r"tiktok\.com"), Platform::Tiktok),
        (host_pattern(r"instagram\.com|instagr\.am"), Platform::Instagram),
        (host_pattern(r"facebook\.com|fb\.watch|fb\.com"), Platform::Facebook),
        (host_pattern(r"twitter\.com|x\.com"), Platform::Twitter),
        (host_pattern(r"linkedin\.com"), Platform::Linkedin),
        (host_pattern(r"pinterest\.[a-z.]+|pin\.it"), Platform::Pinterest),
        (host_pattern(r"spotify\.com"), Platform::Spotify),
        (host_pattern(r"soundcloud\.com"), Platform::Soundcloud),
        (host_pattern(r"vimeo\.com"), Platform::Vimeo),
        (host_pattern(r"podcasts\.apple\.com"), Platform::Podcast),
        // RSS feeds live on arbitrary hosts
        (
            Regex::new(r"^(?:[a-z][a-z0-9+.-]*://)?(?:feeds?\.[^/]+/|[^/]+/.*(?:\.xml$|\.rss$|/rss(?:/|$)|/feed(?:/|$)))")
                .expect("valid platform pattern"),
            Platform::Podcast,
        ),
    ];
}

/// Detect the platform for a URL. Never fails; unknown input is `Unsupported`.
pub fn detect(url: &str) -> Platform {
    let trimmed = url.trim();
    // Tracking parameters and fragments never change the platform
    let without_query = trimmed
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();

    if without_query.is_empty() {
        return Platform::Unsupported;
    }

    PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&without_query))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_urls() {
        let cases = [
            ("https://music.youtube.com/watch?v=abc", Platform::YoutubeMusic),
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", Platform::Youtube),
            ("https://youtu.be/dQw4w9WgXcQ", Platform::Youtube),
            ("https://m.youtube.com/shorts/xyz", Platform::Youtube),
            ("https://www.tiktok.com/@user/video/123", Platform::Tiktok),
            ("https://vm.tiktok.com/ZMabc/", Platform::Tiktok),
            ("https://www.instagram.com/p/Cxyz/", Platform::Instagram),
            ("https://fb.watch/abc/", Platform::Facebook),
            ("https://www.facebook.com/watch/?v=1", Platform::Facebook),
            ("https://x.com/user/status/1", Platform::Twitter),
            ("https://twitter.com/user/status/1", Platform::Twitter),
            ("https://www.linkedin.com/posts/abc", Platform::Linkedin),
            ("https://pin.it/abc", Platform::Pinterest),
            ("https://open.spotify.com/track/abc", Platform::Spotify),
            ("https://soundcloud.com/artist/track", Platform::Soundcloud),
            ("https://vimeo.com/123456", Platform::Vimeo),
            ("https://podcasts.apple.com/us/podcast/id1", Platform::Podcast),
            ("https://feeds.example.org/show", Platform::Podcast),
            ("https://example.org/show/feed.xml", Platform::Podcast),
        ];

        for (url, expected) in cases {
            assert_eq!(detect(url), expected, "url: {}", url);
        }
    }

    #[test]
    fn test_unsupported_urls() {
        for url in [
            "",
            "   ",
            "not a url",
            "https://example.com/video",
            "https://box.com/file",
            "https://notyoutube.com.evil.net/watch",
            "https://dropbox.com/s/x",
        ] {
            assert_eq!(detect(url), Platform::Unsupported, "url: {}", url);
        }
    }

    #[test]
    fn test_music_subdomain_wins_over_parent() {
        assert_eq!(detect("https://music.youtube.com/playlist?list=1"), Platform::YoutubeMusic);
        assert_eq!(detect("https://www.youtube.com/playlist?list=1"), Platform::Youtube);
    }

    #[test]
    fn test_query_string_ignored() {
        // `?src=x.com` must not turn a random host into Twitter
        assert_eq!(detect("https://example.com/a?ref=x.com"), Platform::Unsupported);
        assert_eq!(
            detect("https://www.instagram.com/reel/abc/?utm_source=ig_web"),
            Platform::Instagram
        );
    }

    #[test]
    fn test_detection_is_deterministic() {
        let url = "https://music.youtube.com/watch?v=1";
        let first = detect(url);
        for _ in 0..100 {
            assert_eq!(detect(url), first);
        }
    }

    #[test]
    fn test_tag_round_trip() {
        for platform in Platform::supported() {
            assert_eq!(platform.as_str().parse::<Platform>(), Ok(*platform));
        }
        assert!("unsupported".parse::<Platform>().is_err());
    }
}
