// ===============================
// src/recorder.rs
// ===============================
//
// JSONL trade journal:
// - one Event per line, appended to RECORD_FILE
// - BufWriter, flushed every second and every 1000 events
// - parent directory is created when missing
// - on a write failure the file is reopened and the line retried once
// - if the file cannot be opened at all, events are drained and dropped
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(%e, %path, "recorder: open failed, journal disabled");
            None
        }
    };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let Some(w) = writer.as_mut() else { continue };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(%e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(w, &line).await {
                    error!(%e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(mut fresh) => {
                            if let Err(e2) = write_line(&mut fresh, &line).await {
                                error!(%e2, "recorder: write failed again after reopen, drop event");
                            }
                            writer = Some(fresh);
                        }
                        Err(e2) => error!(%e2, "recorder: reopen failed, drop event"),
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::{OrderEvent, OrderStatus, Side};

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = std::env::temp_dir().join(format!("linc_bot_journal_{}", std::process::id()));
        let path = dir.join("nested").join("events.jsonl");
        let path_str = path.to_string_lossy().to_string();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path_str.clone()));
        tx.send(Event::Note("hello".into())).await.unwrap();
        tx.send(Event::Order(OrderEvent {
            ts: Utc::now(),
            strategy: "divergence".into(),
            symbol: "STOCK1".into(),
            side: Side::Buy,
            qty: 3,
            status: OrderStatus::Completed,
            fill_px: Some(10.5),
            reason: "entry".into(),
        }))
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"Note":"hello"}"#);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["Order"]["status"], "completed");
        assert_eq!(v["Order"]["qty"], 3);
        let _ = std::fs::remove_dir_all(dir);
    }
}
