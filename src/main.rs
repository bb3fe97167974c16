mod cli;
mod core;
mod logging;
mod platform;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_main().await {
        crate::core::terminal::print_error(&format!("error: {e:#}"));
        std::process::exit(1);
    }
}
