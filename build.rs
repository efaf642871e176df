use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    gemini: Gemini,
    session: Session,
    audio: Audio,
}

#[derive(Deserialize)]
struct Gemini {
    api_key: String,
    base_url: String,
    chat_model: String,
    tts_model: String,
    tts_voice: String,
    request_timeout_secs: u64,
}

#[derive(Deserialize)]
struct Session {
    system_instruction: String,
    welcome_text: String,
    reset_text: String,
    error_text: String,
    attachment_prompt: String,
    attachment_placeholder: String,
    autoplay: bool,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    channels: u16,
    playback_device: String,
    playback_period_size: usize,
}

// rustc-env values are single-line; Config::new() undoes this escaping
fn emit(key: &str, value: impl ToString) {
    let value = value.to_string().replace('\\', "\\\\").replace('\n', "\\n");
    println!("cargo:rustc-env={}={}", key, value);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // Gemini 服务
    emit("GEMINI_API_KEY_DEFAULT", &config.gemini.api_key);
    emit("GEMINI_BASE_URL", &config.gemini.base_url);
    emit("GEMINI_CHAT_MODEL", &config.gemini.chat_model);
    emit("GEMINI_TTS_MODEL", &config.gemini.tts_model);
    emit("GEMINI_TTS_VOICE", &config.gemini.tts_voice);
    emit("GEMINI_REQUEST_TIMEOUT_SECS", config.gemini.request_timeout_secs);

    // 会话文本
    emit("SESSION_SYSTEM_INSTRUCTION", &config.session.system_instruction);
    emit("SESSION_WELCOME_TEXT", &config.session.welcome_text);
    emit("SESSION_RESET_TEXT", &config.session.reset_text);
    emit("SESSION_ERROR_TEXT", &config.session.error_text);
    emit("SESSION_ATTACHMENT_PROMPT", &config.session.attachment_prompt);
    emit("SESSION_ATTACHMENT_PLACEHOLDER", &config.session.attachment_placeholder);
    emit("SESSION_AUTOPLAY", config.session.autoplay);

    // 音频配置
    emit("AUDIO_SAMPLE_RATE", config.audio.sample_rate);
    emit("AUDIO_CHANNELS", config.audio.channels);
    emit("AUDIO_PLAYBACK_DEVICE", &config.audio.playback_device);
    emit("AUDIO_PLAYBACK_PERIOD_SIZE", config.audio.playback_period_size);
}
