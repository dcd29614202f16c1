// FormatSelector - maps the requested format/quality onto yt-dlp arguments
//
// Audio prefers m4a so the result plays everywhere without a remux; video
// caps height when a resolution is requested and always falls back to the
// best single file.

use super::models::MediaFormat;

pub struct FormatSelector;

impl FormatSelector {
    /// Get format spec for yt-dlp based on format and quality value
    pub fn get_format_spec(format: MediaFormat, quality: &str) -> String {
        match format {
            MediaFormat::Audio => match Self::audio_bitrate(quality) {
                Some(abr) => format!("ba[ext=m4a][abr<={abr}]/ba[abr<={abr}]/ba[ext=m4a]/ba/b"),
                None => "ba[ext=m4a]/ba/b".to_string(),
            },
            MediaFormat::Video => match Self::video_height(quality) {
                Some(h) => format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/best"),
                None => "bv*+ba/best".to_string(),
            },
        }
    }

    /// Container the tool should merge or remux into
    pub fn container_args(format: MediaFormat) -> Vec<String> {
        match format {
            MediaFormat::Audio => Vec::new(),
            MediaFormat::Video => vec!["--merge-output-format".to_string(), "mp4".to_string()],
        }
    }

    /// "1080p", "720", "hd" ... to a max height; "best" and unknown values
    /// mean no cap
    fn video_height(quality: &str) -> Option<u32> {
        let q = quality.trim().to_ascii_lowercase();
        match q.as_str() {
            "best" | "highest" | "" => None,
            "worst" | "lowest" => Some(360),
            "hd" => Some(720),
            "fullhd" | "fhd" => Some(1080),
            other => other
                .trim_end_matches('p')
                .parse::<u32>()
                .ok()
                .filter(|h| (144..=4320).contains(h)),
        }
    }

    /// "128k", "192kbps" ... to a max audio bitrate
    fn audio_bitrate(quality: &str) -> Option<u32> {
        let q = quality.trim().to_ascii_lowercase();
        let digits = q.trim_end_matches("kbps").trim_end_matches('k');
        digits.parse::<u32>().ok().filter(|b| (32..=512).contains(b))
    }
}
