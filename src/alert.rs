//! Connect/disconnect alert actions.

use std::io::Write;
use std::time::Duration;

use crate::options::AlertMode;

fn sound_bell() {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(b"\x07");
    let _ = out.flush();
}

async fn blink_background() {
    {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(b"\x1b[?5h");
        let _ = out.flush();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(b"\x1b[?5l");
        let _ = out.flush();
    }
}

pub async fn connect(mode: AlertMode) {
    match mode {
        AlertMode::None => {}
        AlertMode::Bell => sound_bell(),
        AlertMode::Blink => blink_background().await,
    }
}

pub async fn disconnect(mode: AlertMode) {
    match mode {
        AlertMode::None => {}
        AlertMode::Bell => {
            sound_bell();
            tokio::time::sleep(Duration::from_millis(200)).await;
            sound_bell();
        }
        AlertMode::Blink => {
            blink_background().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            blink_background().await;
        }
    }
}
