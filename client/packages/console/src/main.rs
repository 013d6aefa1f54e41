fn main() {
    if let Err(err) = pubsub_console::cli::run_console() {
        tracing::error!(error = %err, "pubsub-console failed");
        std::process::exit(1);
    }
}
