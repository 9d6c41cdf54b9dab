//! State and BeatInfo subscription streams layered on a `FramedChannel`.

use crate::codec::{BeatInfoMessage, State, StateMapMessage};
use crate::connection::FramedChannel;
use crate::error::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The canonical set of state paths the selector needs.
pub fn canonical_state_paths() -> Vec<String> {
    let mut paths = vec!["Mixer/CrossfaderPosition".to_string()];
    for deck in 1..=4u8 {
        paths.push(format!("Engine/Deck{deck}/Play"));
        paths.push(format!("Engine/Deck{deck}/PlayState"));
        paths.push(format!("Engine/Deck{deck}/Track/ArtistName"));
        paths.push(format!("Engine/Deck{deck}/Track/SongName"));
        paths.push(format!("Engine/Deck{deck}/Track/AlbumName"));
        paths.push(format!("Engine/Deck{deck}/Track/BPM"));
        paths.push(format!("Engine/Deck{deck}/Track/Genre"));
        paths.push(format!("Engine/Deck{deck}/Track/SongLoaded"));
        paths.push(format!("Mixer/CH{deck}faderPosition"));
    }
    paths
}

/// A subscribed StateMap stream. Dropping it (or calling `close`) cancels
/// the read loop and releases the socket; no message is delivered after
/// closure.
pub struct StateStream {
    reader: JoinHandle<()>,
    events: mpsc::Receiver<State>,
}

impl StateStream {
    /// Subscribes to every path in `paths` (change-driven, `interval=0`)
    /// and starts the read loop delivering decoded `State` records in
    /// arrival order.
    pub async fn open(mut channel: FramedChannel, paths: &[String]) -> Result<Self> {
        for name in paths {
            let subscribe = StateMapMessage::Subscribe {
                name: name.clone(),
                interval: 0,
            };
            channel.write_frame(&subscribe.encode()).await?;
        }

        let (tx, rx) = mpsc::channel(256);
        let reader = tokio::spawn(async move {
            loop {
                match channel.read_frame().await {
                    Ok(frame) => match StateMapMessage::decode(&frame) {
                        Ok(StateMapMessage::Emit(state)) => {
                            if tx.send(state).await.is_err() {
                                return;
                            }
                        }
                        Ok(StateMapMessage::Subscribe { .. }) => continue,
                        Err(e) => {
                            debug!(error = %e, "malformed StateMap frame dropped");
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "StateMap stream closed");
                        return;
                    }
                }
            }
        });

        Ok(StateStream { reader, events: rx })
    }

    pub async fn next(&mut self) -> Option<State> {
        self.events.recv().await
    }

    pub fn close(self) {
        self.reader.abort();
    }
}

/// A decoded beat-stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatRecord {
    pub clock: u64,
    pub players: Vec<(f64, f64, f64)>,
    pub timelines: Vec<f64>,
}

/// A subscribed BeatInfo stream. Opening implicitly sends `start-stream`;
/// dropping/closing sends `stop-stream` and cancels the read loop.
pub struct BeatStream {
    reader: JoinHandle<()>,
    events: mpsc::Receiver<BeatRecord>,
}

impl BeatStream {
    pub async fn open(mut channel: FramedChannel) -> Result<Self> {
        channel
            .write_frame(&BeatInfoMessage::StartStream.encode())
            .await?;

        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                match channel.read_frame().await {
                    Ok(frame) => match BeatInfoMessage::decode(&frame) {
                        Ok(BeatInfoMessage::Emit {
                            clock,
                            players,
                            timelines,
                        }) => {
                            let record = BeatRecord {
                                clock,
                                players,
                                timelines,
                            };
                            if tx.send(record).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "malformed BeatInfo frame dropped");
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "BeatInfo stream closed");
                        return;
                    }
                }
            }
        });

        Ok(BeatStream { reader, events: rx })
    }

    pub async fn next(&mut self) -> Option<BeatRecord> {
        self.events.recv().await
    }

    pub fn close(self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_cover_all_four_decks() {
        let paths = canonical_state_paths();
        for deck in 1..=4 {
            assert!(paths.contains(&format!("Engine/Deck{deck}/Play")));
            assert!(paths.contains(&format!("Mixer/CH{deck}faderPosition")));
        }
        assert!(paths.contains(&"Mixer/CrossfaderPosition".to_string()));
    }
}
