use std::num::NonZeroU16;
use std::time::Duration;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    // Gemini 服务配置
    pub api_key: String,
    pub base_url: &'static str,
    pub chat_model: &'static str,
    pub tts_model: &'static str,
    pub tts_voice: &'static str,
    pub request_timeout: Duration,

    // 会话文本配置
    pub system_instruction: String,
    pub welcome_text: String,
    pub reset_text: String,
    pub error_text: String,
    pub attachment_prompt: String,
    pub attachment_placeholder: String,
    pub autoplay: bool,

    // 音频配置
    pub sample_rate: u32,
    pub channels: NonZeroU16,
    pub playback_device: &'static str,
    pub playback_period_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let channels: u16 = parse("AUDIO_CHANNELS", env!("AUDIO_CHANNELS"))?;
        Ok(Self {
            api_key: unescape(env!("GEMINI_API_KEY_DEFAULT")),
            base_url: env!("GEMINI_BASE_URL"),
            chat_model: env!("GEMINI_CHAT_MODEL"),
            tts_model: env!("GEMINI_TTS_MODEL"),
            tts_voice: env!("GEMINI_TTS_VOICE"),
            request_timeout: Duration::from_secs(parse(
                "GEMINI_REQUEST_TIMEOUT_SECS",
                env!("GEMINI_REQUEST_TIMEOUT_SECS"),
            )?),

            system_instruction: unescape(env!("SESSION_SYSTEM_INSTRUCTION")),
            welcome_text: unescape(env!("SESSION_WELCOME_TEXT")),
            reset_text: unescape(env!("SESSION_RESET_TEXT")),
            error_text: unescape(env!("SESSION_ERROR_TEXT")),
            attachment_prompt: unescape(env!("SESSION_ATTACHMENT_PROMPT")),
            attachment_placeholder: unescape(env!("SESSION_ATTACHMENT_PLACEHOLDER")),
            autoplay: parse("SESSION_AUTOPLAY", env!("SESSION_AUTOPLAY"))?,

            sample_rate: parse("AUDIO_SAMPLE_RATE", env!("AUDIO_SAMPLE_RATE"))?,
            channels: NonZeroU16::new(channels)
                .ok_or_else(|| ChatError::Config("AUDIO_CHANNELS must be at least 1".into()))?,
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            playback_period_size: parse(
                "AUDIO_PLAYBACK_PERIOD_SIZE",
                env!("AUDIO_PLAYBACK_PERIOD_SIZE"),
            )?,
        })
    }

    /// Applies runtime overrides on top of the compiled-in values.
    ///
    /// Only the API key can be overridden, through `GEMINI_API_KEY`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = key.trim().to_string();
            }
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ChatError::Config(format!("Failed to parse {}", key)))
}

/// Reverses the escaping build.rs applies to multi-line values.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_restores_newlines_and_backslashes() {
        assert_eq!(unescape("a\\nb"), "a\nb");
        assert_eq!(unescape("c:\\\\tmp"), "c:\\tmp");
        assert_eq!(unescape("plain"), "plain");
    }

    #[test]
    fn parse_reports_the_offending_key() {
        let err = parse::<u32>("AUDIO_SAMPLE_RATE", "fast").unwrap_err();
        assert!(err.to_string().contains("AUDIO_SAMPLE_RATE"));
    }

    #[test]
    fn compiled_config_is_usable() {
        let config = Config::new().unwrap();
        assert!(config.sample_rate > 0);
        assert!(!config.welcome_text.is_empty());
        assert!(config.attachment_placeholder.contains("{name}"));
    }
}
