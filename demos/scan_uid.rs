//! Find the RFID reader and print every tag UID it reports
//!
//! Run with: cargo run --example scan_uid
//!
//! Press Enter to start a new attempt after a failure, or Ctrl+C to exit.

use rfid_uid_ble::{BleUidSession, PlatformAdapter, Result, SessionState, SessionUpdate};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,rfid_uid_ble=info".into()),
        )
        .init();

    println!("RFID UID Reader");
    println!("===============\n");
    println!("Power on the reader and hold a tag near it.\n");

    let adapter = Arc::new(PlatformAdapter::new().await?);
    let session = BleUidSession::new(adapter)?;

    let _status = session.on_status_changed(|status| {
        println!("[status] {}", status);
    });
    let _uid = session.on_uid_changed(|uid| {
        println!("[uid]    {}", uid);
    });

    let mut updates = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    session.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => {
                        if session.state().can_start() {
                            session.start()?;
                        }
                    }
                    _ => break,
                }
            }
            update = updates.recv() => {
                if let Ok(SessionUpdate::State(state)) = update {
                    if matches!(state, SessionState::Failed { .. } | SessionState::Disconnected { .. }) {
                        println!("Press Enter to try again.");
                    }
                }
            }
        }
    }

    session.shutdown().await?;
    println!("Done!");

    Ok(())
}
