use publish::RunState;

pub fn make_progress_spinner() -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner())
            .tick_strings(&[
                "▹▹▹▹▹",
                "▸▹▹▹▹",
                "▹▸▹▹▹",
                "▹▹▸▹▹",
                "▹▹▹▸▹",
                "▹▹▹▹▸",
                "▪▪▪▪▪",
            ]),
    );
    pb
}

/// Message shown while the run is in `state`, i.e. what it is working on next.
fn describe(state: RunState) -> String {
    match state {
        RunState::Received => "[1/4] cloning repository".to_string(),
        RunState::Cloned => "[2/4] cleaning target directory".to_string(),
        RunState::Cleaned => "[3/4] unzipping archive".to_string(),
        RunState::Extracted => "[4/4] committing and pushing".to_string(),
        RunState::Committed => "pushed".to_string(),
        RunState::NoOp => "nothing to push".to_string(),
        RunState::Done => "done".to_string(),
        RunState::Failed(stage) => format!("failed during {stage}"),
    }
}

/// A pipeline observer that drives `pb`.
pub fn observer(pb: indicatif::ProgressBar) -> impl Fn(RunState) + Send + Sync + 'static {
    move |state| match state {
        RunState::Done | RunState::Failed(_) => pb.finish_with_message(describe(state)),
        _ => pb.set_message(describe(state)),
    }
}
