//! Graceful shutdown handler.

use tokio::sync::watch;

/// First Ctrl+C lets the current chunk commit, then stops. Second Ctrl+C exits
/// immediately; replaying an unfinished chunk later is harmless.
pub fn setup_shutdown_handler() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nReceived Ctrl+C, finishing the current chunk...");
            println!("Press Ctrl+C again to force quit");

            let _ = shutdown_tx.send(true);

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nForce quit requested, exiting immediately...");
                std::process::exit(1);
            }
        }
    });

    shutdown_rx
}
