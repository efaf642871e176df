//! Text-to-speech through Gemini's audio-output models.

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use super::SynthesisGateway;
use super::gemini_chat::check_status;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::protocol::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part};

/// Returns 16-bit little-endian mono PCM (24 kHz for the preview TTS models).
pub struct GeminiSpeech {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl GeminiSpeech {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let mut speech = Self::new(
            config.api_key.clone(),
            config.base_url,
            config.tts_model,
            config.tts_voice,
        );
        speech.client = client;
        Ok(speech)
    }

    fn endpoint(&self) -> Result<Url> {
        let raw = format!(
            "{}/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        Url::parse_with_params(&raw, &[("key", self.api_key.as_str())])
            .map_err(|e| ChatError::Config(format!("invalid Gemini URL {}: {}", raw, e)))
    }

    fn request(&self, text: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content::user(vec![Part::text(text)])],
            system_instruction: None,
            generation_config: Some(GenerationConfig::audio(self.voice.clone())),
        }
    }
}

#[async_trait]
impl SynthesisGateway for GeminiSpeech {
    async fn synthesize(&self, text: &str) -> Result<String> {
        log::debug!("Synthesizing {} chars with voice {}", text.len(), self.voice);
        let response = self
            .client
            .post(self.endpoint()?)
            .json(&self.request(text))
            .send()
            .await?;
        let body: GenerateContentResponse = check_status(response).await?.json().await?;
        extract_audio(body)
    }
}

fn extract_audio(body: GenerateContentResponse) -> Result<String> {
    if let Some(error) = &body.error {
        return Err(ChatError::Transport(error.describe()));
    }
    body.inline_data()
        .map(|inline| inline.data.clone())
        .filter(|data| !data.is_empty())
        .ok_or_else(|| ChatError::MalformedPayload("speech response carried no audio".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_targets_generate_content_with_voice() {
        let speech = GeminiSpeech::new("k", "https://example.test/models", "tts-model", "Kore");
        assert_eq!(speech.endpoint().unwrap().path(), "/models/tts-model:generateContent");
        let json = serde_json::to_value(speech.request("Ciao")).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Ciao");
        assert_eq!(json["generationConfig"]["responseModalities"][0], "AUDIO");
    }

    #[test]
    fn audio_is_taken_from_the_first_inline_part() {
        let body: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"audio/L16","data":"AQID"}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_audio(body).unwrap(), "AQID");
    }

    #[test]
    fn missing_audio_is_a_malformed_payload() {
        let body: GenerateContentResponse =
            serde_json::from_str(r#"{"candidates":[{"content":{"parts":[{"text":"no"}]}}]}"#).unwrap();
        assert!(matches!(extract_audio(body), Err(ChatError::MalformedPayload(_))));
    }
}
