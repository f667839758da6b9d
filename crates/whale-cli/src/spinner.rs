use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use whale_core::Phase;

/// Creates a progress spinner with the usual braille ticks, green, 100ms tick.
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.green} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn describe(phase: Phase) -> &'static str {
    match phase {
        Phase::Creating => "Creating deployment and service...",
        Phase::WaitingReady => "Waiting for deployment to become ready...",
        Phase::Ready => "Deployment ready, holding...",
        Phase::Failed => "Run failed, cleaning up...",
        Phase::Cleaning => "Deleting service and deployment...",
        Phase::Done => "Done.",
    }
}

/// Follow phase updates until the controller goes away.
pub fn follow_phases(mut phases: watch::Receiver<Option<Phase>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = create_spinner();
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            if let Some(phase) = phase {
                spinner.set_message(describe(phase));
            }
        }
        spinner.finish_and_clear();
    })
}
