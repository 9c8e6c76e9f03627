mod error;
mod keys;
mod lifecycle;
mod live;
mod media;
mod playback;
mod state;
mod transcript;

use keys::KeyPool;
use lifecycle::{Control, SessionLifecycle};
use live::session::{validate_key, GeminiConnector};
use live::OUTPUT_SAMPLE_RATE;
use media::DeviceMedia;
use playback::{MixerOutput, PlaybackScheduler};
use state::{AppEvent, AppState};
use std::io::BufRead;
use std::sync::Arc;
use transcript::Role;

fn main() {
    env_logger::init();

    let keys = KeyPool::from_env();
    if keys.is_empty() {
        log::warn!("[wayfarer] no usable API key in WAYFARER_API_KEYS / GEMINI_API_KEY");
    } else {
        log::info!("[wayfarer] {} API key(s) loaded", keys.len());
    }

    let app_state = Arc::new(AppState::new());
    let (event_tx, event_rx) = std::sync::mpsc::channel::<AppEvent>();
    let ui_tx = event_tx.clone();
    let runtime = Arc::new(
        tokio::runtime::Runtime::new().expect("Failed to create tokio runtime"),
    );

    let output = match MixerOutput::spawn(OUTPUT_SAMPLE_RATE) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[wayfarer] cannot open audio output: {}", e);
            return;
        }
    };

    let (control_tx, control_rx) = tokio::sync::mpsc::channel::<Control>(16);
    let lifecycle = SessionLifecycle::new(
        app_state.clone(),
        event_tx,
        Arc::new(GeminiConnector),
        keys.clone(),
        Box::new(DeviceMedia::new()),
        PlaybackScheduler::new(output, OUTPUT_SAMPLE_RATE),
    );
    runtime.spawn(lifecycle.run(control_rx));

    // Display collaborator stand-in: status and transcript go to the log.
    std::thread::spawn(move || {
        for event in event_rx {
            match event {
                AppEvent::StatusUpdate { status, message } => {
                    log::info!("[status] {}: {}", status.as_str(), message);
                }
                AppEvent::Transcript(entry) => {
                    let who = match entry.role {
                        Role::User => "you",
                        Role::Model => "guide",
                    };
                    log::info!("[transcript] {} {}: {}", entry.timestamp, who, entry.text);
                }
                AppEvent::KeyValidated { index, ok, message } => {
                    if ok {
                        log::info!("[keys] key #{} ok", index);
                    } else {
                        log::warn!("[keys] key #{} failed: {}", index, message);
                    }
                }
            }
        }
    });

    println!("wayfarer ready. commands: start | stop | mute | unmute | status | keys | quit");

    // Control surface stand-in for the wake-phrase detector and the UI:
    // each line becomes one of the collaborator signals.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match line.trim() {
            "start" => {
                let _ = control_tx.blocking_send(Control::Start);
            }
            "stop" => {
                let _ = control_tx.blocking_send(Control::Stop);
            }
            "mute" => {
                let _ = control_tx.blocking_send(Control::SetMuted(true));
            }
            "unmute" => {
                let _ = control_tx.blocking_send(Control::SetMuted(false));
            }
            "status" => {
                let status = app_state.status();
                match app_state.last_error() {
                    Some(err) => println!("{} (last error: {})", status.as_str(), err),
                    None => println!("{}", status.as_str()),
                }
            }
            "keys" => {
                if keys.is_empty() {
                    println!("no usable keys configured");
                    continue;
                }
                for (index, key) in keys.iter().enumerate() {
                    let key = key.to_string();
                    let tx = ui_tx.clone();
                    runtime.spawn(async move {
                        let result = validate_key(&key).await;
                        let _ = tx.send(AppEvent::KeyValidated {
                            index,
                            ok: result.is_ok(),
                            message: result.err().unwrap_or_default(),
                        });
                    });
                }
            }
            "quit" | "exit" => {
                let _ = control_tx.blocking_send(Control::Shutdown);
                break;
            }
            "" => {}
            other => println!("unknown command: {}", other),
        }
    }

    log::info!("[wayfarer] shutting down");
}
