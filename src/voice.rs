//! Speech in and speech out for voice turns
//!
//! The chat front end records 16-bit mono PCM at 24 kHz, sends it in
//! base64 chunks and plays back the same format. A [`VoicePipeline`] turns a
//! committed buffer into a user message and the agent's reply back into PCM.

use std::sync::{Arc, Mutex};

use async_openai::{
    config::OpenAIConfig,
    types::{
        AudioInput, CreateSpeechRequest, CreateTranscriptionRequest, SpeechModel,
        SpeechResponseFormat, Voice,
    },
    Client,
};
use futures::future::BoxFuture;
use tower::BoxError;
use tracing::debug;

/// Sample rate of PCM audio in both directions
pub const SAMPLE_RATE: u32 = 24_000;

/// Bytes of PCM per `response.audio.delta` event (100 ms)
pub const AUDIO_CHUNK_BYTES: usize = (SAMPLE_RATE as usize / 10) * 2;

pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Speech-to-text and text-to-speech used by voice turns.
pub trait VoicePipeline: Send + Sync + 'static {
    /// Transcribe raw 16-bit little-endian mono PCM at [`SAMPLE_RATE`].
    fn transcribe(&self, pcm: Vec<u8>) -> BoxFuture<'static, Result<String, BoxError>>;

    /// Speak `text` as raw PCM in the same format.
    fn synthesize(&self, text: String) -> BoxFuture<'static, Result<Vec<u8>, BoxError>>;
}

/// Wrap raw PCM in a WAV header so transcription endpoints accept it.
pub fn pcm_to_wav(pcm: &[u8]) -> Vec<u8> {
    const CHANNELS: u16 = 1;
    const BITS: u16 = 16;
    let byte_rate = SAMPLE_RATE * u32::from(CHANNELS) * u32::from(BITS / 8);
    let block_align = CHANNELS * (BITS / 8);
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Voice pipeline over the OpenAI audio endpoints
#[derive(Clone)]
pub struct OpenAIVoice {
    client: Arc<Client<OpenAIConfig>>,
    transcription_model: String,
    speech_model: SpeechModel,
    voice: Voice,
}

impl OpenAIVoice {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self {
            client,
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            speech_model: SpeechModel::Tts1,
            voice: Voice::Alloy,
        }
    }

    pub fn transcription_model(mut self, model: impl Into<String>) -> Self {
        self.transcription_model = model.into();
        self
    }

    pub fn voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }
}

impl VoicePipeline for OpenAIVoice {
    fn transcribe(&self, pcm: Vec<u8>) -> BoxFuture<'static, Result<String, BoxError>> {
        let client = self.client.clone();
        let request = CreateTranscriptionRequest {
            file: AudioInput::from_vec_u8("input.wav".to_string(), pcm_to_wav(&pcm)),
            model: self.transcription_model.clone(),
            ..Default::default()
        };
        Box::pin(async move {
            let response = client.audio().transcribe(request).await?;
            debug!(chars = response.text.len(), "transcribed audio");
            Ok(response.text)
        })
    }

    fn synthesize(&self, text: String) -> BoxFuture<'static, Result<Vec<u8>, BoxError>> {
        let client = self.client.clone();
        let request = CreateSpeechRequest {
            input: text,
            model: self.speech_model.clone(),
            voice: self.voice.clone(),
            response_format: Some(SpeechResponseFormat::Pcm),
            ..Default::default()
        };
        Box::pin(async move {
            let response = client.audio().speech(request).await?;
            debug!(bytes = response.bytes.len(), "synthesized speech");
            Ok(response.bytes.to_vec())
        })
    }
}

/// Pipeline with a canned transcript and canned speech.
///
/// Records every buffer it was asked to transcribe and every text it spoke.
#[derive(Clone, Default)]
pub struct FixedVoice {
    transcript: String,
    speech: Vec<u8>,
    heard: Arc<Mutex<Vec<Vec<u8>>>>,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl FixedVoice {
    pub fn new(transcript: impl Into<String>, speech: Vec<u8>) -> Self {
        Self {
            transcript: transcript.into(),
            speech,
            ..Default::default()
        }
    }

    pub fn heard(&self) -> Vec<Vec<u8>> {
        self.heard.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl VoicePipeline for FixedVoice {
    fn transcribe(&self, pcm: Vec<u8>) -> BoxFuture<'static, Result<String, BoxError>> {
        if let Ok(mut heard) = self.heard.lock() {
            heard.push(pcm);
        }
        let transcript = self.transcript.clone();
        Box::pin(async move { Ok(transcript) })
    }

    fn synthesize(&self, text: String) -> BoxFuture<'static, Result<Vec<u8>, BoxError>> {
        if let Ok(mut spoken) = self.spoken.lock() {
            spoken.push(text);
        }
        let speech = self.speech.clone();
        Box::pin(async move { Ok(speech) })
    }
}
