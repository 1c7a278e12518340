use crate::dispatch::DispatchEvent;
use crate::ui::icons::{CHECK, CROSS, RUNNING};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

/// Progress bar over claimed repositories, fed by dispatcher events.
pub struct RunProgress {
    bar: ProgressBar,
    verbose: bool,
}

impl RunProgress {
    pub fn new(total: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("progress bar template is a valid static string")
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix("Repos");
        Self { bar, verbose }
    }

    /// A bar that draws nothing, for JSON logging mode.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            verbose: false,
        }
    }

    pub fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Started { repo } => {
                if self.verbose {
                    self.bar.println(format!("{}{}", RUNNING, style(repo).dim()));
                }
                self.bar.set_message(repo.clone());
            }
            DispatchEvent::Finished { repo, label } => {
                let icon = if *label == "failed" { &CROSS } else { &CHECK };
                self.bar.println(format!("{}{} {}", icon, repo, style(label).dim()));
                self.bar.inc(1);
            }
        }
    }

    /// Consume events until every sender is dropped.
    pub async fn drive(self, mut rx: mpsc::UnboundedReceiver<DispatchEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drive_counts_finished_events() {
        let progress = RunProgress::hidden();
        let bar = progress.bar.clone();
        bar.set_length(2);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DispatchEvent::Started { repo: "a/b".into() }).unwrap();
        tx.send(DispatchEvent::Finished { repo: "a/b".into(), label: "published" }).unwrap();
        tx.send(DispatchEvent::Finished { repo: "c/d".into(), label: "failed" }).unwrap();
        drop(tx);
        progress.drive(rx).await;
        assert_eq!(bar.position(), 2);
    }
}
