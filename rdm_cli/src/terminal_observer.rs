use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use rdm_core::message::ProgressMessage;
use rdm_core::DownloadStatus;

/// Renders a `ProgressMessage` stream as indicatif terminal bars.
///
/// One `ProgressBar` per connection, plus a total bar, all under a shared
/// `MultiProgress` so they render cleanly.
pub struct TerminalProgressObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<u32, ProgressBar>>,
    total_bar: Mutex<Option<ProgressBar>>,
}

impl TerminalProgressObserver {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            total_bar: Mutex::new(None),
        }
    }

    fn ensure_bars(&self, progress: &ProgressMessage) {
        let mut bars = self.bars.lock().unwrap();
        let mut total_bar = self.total_bar.lock().unwrap();

        for conn in &progress.connection_progresses {
            if !bars.contains_key(&conn.connection_number) {
                let style = ProgressStyle::with_template("[{bar:30.cyan/blue}] {percent}% ({binary_bytes_per_sec}) — {msg}")
                    .unwrap()
                    .progress_chars("=>-");
                let pb = self.multi.add(ProgressBar::new(100));
                pb.set_style(style);
                pb.set_message(format!("conn {}", conn.connection_number));
                bars.insert(conn.connection_number, pb);
            }
        }

        if total_bar.is_none() {
            let style = ProgressStyle::with_template("Total [{bar:30.green/white}] {percent}% ({binary_bytes_per_sec}) ETA {msg}")
                .unwrap()
                .progress_chars("=>-");
            let pb = self.multi.add(ProgressBar::new(100));
            pb.set_style(style);
            *total_bar = Some(pb);
        }
    }

    /// Renders one update. Returns `true` once the download has reached a
    /// terminal status and the caller should stop reading the event stream.
    pub fn on_progress(&self, progress: &ProgressMessage) -> bool {
        self.ensure_bars(progress);

        let bars = self.bars.lock().unwrap();
        for conn in &progress.connection_progresses {
            if let Some(pb) = bars.get(&conn.connection_number) {
                pb.set_position((conn.total_download_progress.clamp(0.0, 1.0) * 100.0) as u64);
            }
        }
        drop(bars);

        let total_bar = self.total_bar.lock().unwrap();
        if let Some(pb) = total_bar.as_ref() {
            pb.set_position((progress.total_download_progress.clamp(0.0, 1.0) * 100.0) as u64);
            pb.set_message(progress.estimated_remaining.clone());
        }

        match progress.status {
            DownloadStatus::AssembleComplete => {
                if let Some(pb) = total_bar.as_ref() {
                    pb.finish_with_message(format!("complete at {}", progress.transfer_rate));
                }
                true
            }
            DownloadStatus::AssembleFailed => {
                if let Some(pb) = total_bar.as_ref() {
                    pb.abandon_with_message("assembly failed");
                }
                true
            }
            DownloadStatus::Cancelled => {
                if let Some(pb) = total_bar.as_ref() {
                    pb.abandon_with_message("cancelled");
                }
                true
            }
            _ => false,
        }
    }
}
