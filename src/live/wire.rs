use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use super::{LIVE_MODEL, LIVE_VOICE, SYSTEM_INSTRUCTION, TOOL_STOP_NAVIGATION};

/// One demultiplexed inbound event. A single server message may expand to
/// several of these, in the order the dispatcher evaluates them.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Recognized stop-navigation tool call. Short-circuits the rest of the
    /// message it arrived in.
    ToolStop { id: String, name: String },
    InputTranscription(String),
    OutputTranscription(String),
    /// Decoded PCM payload ready for the playback scheduler.
    AudioChunk(Vec<u8>),
    Interrupted,
}

/// Configuration sent once at connect: audio-only responses, fixed voice,
/// fixed system instruction, the one declared tool, transcription enabled
/// both directions.
pub fn setup_message() -> Value {
    json!({
        "setup": {
            "model": LIVE_MODEL,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": LIVE_VOICE }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }]
            },
            "tools": [{
                "functionDeclarations": [{
                    "name": TOOL_STOP_NAVIGATION,
                    "description": "Stop the current navigation session."
                }]
            }],
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    })
}

pub fn audio_frame_message(pcm: &[u8]) -> Value {
    json!({
        "media": {
            "data": BASE64.encode(pcm),
            "mimeType": "audio/pcm;rate=16000"
        }
    })
}

pub fn video_frame_message(jpeg: &[u8]) -> Value {
    json!({
        "media": {
            "data": BASE64.encode(jpeg),
            "mimeType": "image/jpeg"
        }
    })
}

pub fn tool_response_message(id: &str, name: &str) -> Value {
    json!({
        "functionResponses": {
            "id": id,
            "name": name,
            "response": { "status": "stopped" }
        }
    })
}

/// Routes one inbound message into events.
///
/// Evaluation order: a recognized tool call short-circuits the whole
/// message; otherwise transcription fragments, audio payloads and the
/// interruption flag are all extracted independently — they are not
/// mutually exclusive within one message. A message carrying a tool-call
/// envelope never falls through to the content fields, even when no call
/// in it is recognized.
pub fn dispatch(msg: &Value) -> Vec<ServerEvent> {
    if let Some(calls) = msg
        .get("toolCall")
        .and_then(|t| t.get("functionCalls"))
        .and_then(|c| c.as_array())
    {
        for call in calls {
            let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("");
            if name == TOOL_STOP_NAVIGATION {
                let id = call.get("id").and_then(|i| i.as_str()).unwrap_or("");
                return vec![ServerEvent::ToolStop {
                    id: id.to_string(),
                    name: name.to_string(),
                }];
            }
            log::debug!("[wire] ignoring unrecognized tool call: {}", name);
        }
        return Vec::new();
    }

    let mut events = Vec::new();
    let content = match msg.get("serverContent") {
        Some(c) => c,
        None => return events,
    };

    if let Some(text) = content
        .get("inputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(ServerEvent::InputTranscription(text.to_string()));
        }
    }

    if let Some(text) = content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(ServerEvent::OutputTranscription(text.to_string()));
        }
    }

    if let Some(parts) = content
        .get("modelTurn")
        .and_then(|t| t.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            let data = part
                .get("inlineData")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
                .unwrap_or("");
            if data.is_empty() {
                continue;
            }
            match BASE64.decode(data.as_bytes()) {
                Ok(pcm) if !pcm.is_empty() => events.push(ServerEvent::AudioChunk(pcm)),
                Ok(_) => {}
                Err(e) => log::warn!("[wire] dropping undecodable audio chunk: {}", e),
            }
        }
    }

    if content
        .get("interrupted")
        .and_then(|i| i.as_bool())
        .unwrap_or(false)
    {
        events.push(ServerEvent::Interrupted);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_declares_fixed_configuration() {
        let setup = setup_message();
        let s = &setup["setup"];
        assert_eq!(s["model"], LIVE_MODEL);
        assert_eq!(s["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            s["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            LIVE_VOICE
        );
        assert_eq!(
            s["tools"][0]["functionDeclarations"][0]["name"],
            TOOL_STOP_NAVIGATION
        );
        assert!(s["inputAudioTranscription"].is_object());
        assert!(s["outputAudioTranscription"].is_object());
    }

    #[test]
    fn audio_frame_carries_pcm_mime_and_base64_payload() {
        let msg = audio_frame_message(&[1, 2, 3, 4]);
        assert_eq!(msg["media"]["mimeType"], "audio/pcm;rate=16000");
        let data = msg["media"]["data"].as_str().unwrap();
        assert_eq!(BASE64.decode(data).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn tool_response_reports_stopped() {
        let msg = tool_response_message("call-7", TOOL_STOP_NAVIGATION);
        assert_eq!(msg["functionResponses"]["id"], "call-7");
        assert_eq!(msg["functionResponses"]["name"], TOOL_STOP_NAVIGATION);
        assert_eq!(msg["functionResponses"]["response"]["status"], "stopped");
    }

    #[test]
    fn stop_navigation_short_circuits_remaining_fields() {
        let msg = serde_json::json!({
            "toolCall": {
                "functionCalls": [{ "id": "c1", "name": TOOL_STOP_NAVIGATION, "args": {} }]
            },
            "serverContent": {
                "inputTranscription": { "text": "stop please" },
                "interrupted": true
            }
        });
        let events = dispatch(&msg);
        assert_eq!(
            events,
            vec![ServerEvent::ToolStop {
                id: "c1".into(),
                name: TOOL_STOP_NAVIGATION.into()
            }]
        );
    }

    #[test]
    fn unrecognized_tool_calls_are_ignored_without_fallthrough() {
        let msg = serde_json::json!({
            "toolCall": {
                "functionCalls": [{ "id": "c2", "name": "openDoor", "args": {} }]
            },
            "serverContent": { "interrupted": true }
        });
        assert!(dispatch(&msg).is_empty());
    }

    #[test]
    fn transcriptions_audio_and_interruption_coexist() {
        let pcm = vec![0u8, 1, 2, 3];
        let msg = serde_json::json!({
            "serverContent": {
                "inputTranscription": { "text": "what is ahead" },
                "outputTranscription": { "text": "Clear path ahead" },
                "modelTurn": {
                    "parts": [{ "inlineData": { "data": BASE64.encode(&pcm) } }]
                },
                "interrupted": true
            }
        });
        let events = dispatch(&msg);
        assert_eq!(
            events,
            vec![
                ServerEvent::InputTranscription("what is ahead".into()),
                ServerEvent::OutputTranscription("Clear path ahead".into()),
                ServerEvent::AudioChunk(pcm),
                ServerEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn empty_or_irrelevant_messages_produce_nothing() {
        assert!(dispatch(&serde_json::json!({})).is_empty());
        assert!(dispatch(&serde_json::json!({ "serverContent": {} })).is_empty());
        assert!(dispatch(&serde_json::json!({ "usageMetadata": { "tokens": 3 } })).is_empty());
    }
}
