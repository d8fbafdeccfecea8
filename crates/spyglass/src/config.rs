/// Capture session configuration.
///
/// Counts of zero mean "no limit" for `capture_frames` and
/// `num_draws_per_frame`, and "never" for the two observation frequencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Total frames to record before the session finishes. 0 = unlimited.
    pub capture_frames: u32,
    /// Frame boundaries to let pass before capture activates.
    pub suspend_capture_frames: u32,
    /// Draw records allowed per frame. 0 = unlimited.
    pub num_draws_per_frame: u32,
    /// Snapshot the framebuffer every N captured frames. 0 = never.
    pub observe_frame_frequency: u32,
    /// Snapshot the framebuffer every N draws within a frame. 0 = never.
    pub observe_draw_frequency: u32,
    /// Pretend the driver has no precompiled-shader support.
    pub disable_precompiled_shaders: bool,
    /// Record synthetic GL error state in the trace.
    pub record_gl_error_state: bool,
    /// Address of the analysis tool to stream to, `host:port`.
    pub stream_addr: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_frames: 0,
            suspend_capture_frames: 0,
            num_draws_per_frame: 0,
            observe_frame_frequency: 0,
            observe_draw_frequency: 0,
            disable_precompiled_shaders: false,
            record_gl_error_state: false,
            stream_addr: None,
        }
    }
}

impl CaptureConfig {
    /// Reads configuration from `SPYGLASS_*` environment variables.
    /// Unparsable values keep the default and log a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capture_frames: env_u32("SPYGLASS_CAPTURE_FRAMES", defaults.capture_frames),
            suspend_capture_frames: env_u32(
                "SPYGLASS_SUSPEND_FRAMES",
                defaults.suspend_capture_frames,
            ),
            num_draws_per_frame: env_u32("SPYGLASS_DRAWS_PER_FRAME", defaults.num_draws_per_frame),
            observe_frame_frequency: env_u32(
                "SPYGLASS_OBSERVE_FRAME_FREQUENCY",
                defaults.observe_frame_frequency,
            ),
            observe_draw_frequency: env_u32(
                "SPYGLASS_OBSERVE_DRAW_FREQUENCY",
                defaults.observe_draw_frequency,
            ),
            disable_precompiled_shaders: env_bool(
                "SPYGLASS_DISABLE_PRECOMPILED_SHADERS",
                defaults.disable_precompiled_shaders,
            ),
            record_gl_error_state: env_bool(
                "SPYGLASS_RECORD_GL_ERROR_STATE",
                defaults.record_gl_error_state,
            ),
            stream_addr: std::env::var("SPYGLASS_STREAM")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match parse_u32(&raw) {
        Some(value) => value,
        None => {
            tracing::warn!(%name, %raw, "ignoring unparsable capture option");
            default
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match parse_bool(&raw) {
        Some(value) => value,
        None => {
            tracing::warn!(%name, %raw, "ignoring unparsable capture option");
            default
        }
    }
}

pub(crate) fn parse_u32(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok()
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_inert() {
        let config = CaptureConfig::default();
        assert_eq!(config.capture_frames, 0);
        assert_eq!(config.suspend_capture_frames, 0);
        assert!(!config.disable_precompiled_shaders);
        assert!(config.stream_addr.is_none());
    }

    #[test]
    fn parses_counts() {
        assert_eq!(parse_u32("3"), Some(3));
        assert_eq!(parse_u32(" 10 "), Some(10));
        assert_eq!(parse_u32("-1"), None);
        assert_eq!(parse_u32("three"), None);
    }

    #[test]
    fn parses_flags() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
