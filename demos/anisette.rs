use std::path::PathBuf;

use anisette_rs::Anisette;
use anyhow::{Context, Result};

fn main() -> Result<()> {
    // Usage:
    // cargo run --example anisette -- <libs-or-apk-path> [apple_root_pem] [session.tar]
    let libs_path = std::env::args().nth(1);
    let apple_root_pem = std::env::args().nth(2).map(PathBuf::from);
    let session_path = std::env::args().nth(3);

    let mut anisette = if let Some(session_path) = session_path.as_deref() {
        if std::path::Path::new(session_path).exists() {
            println!("Resuming session from {session_path}");
            let file = std::fs::File::open(session_path)
                .with_context(|| format!("failed to open {session_path}"))?;
            Anisette::load([file], None, apple_root_pem)?
        } else {
            init_fresh(libs_path.as_deref(), apple_root_pem)?
        }
    } else {
        init_fresh(libs_path.as_deref(), apple_root_pem)?
    };

    let headers = anisette.get_data()?;
    println!("{}", serde_json::to_string_pretty(&headers)?);

    if let Some(session_path) = session_path {
        let mut file = std::fs::File::create(&session_path)
            .with_context(|| format!("failed to create {session_path}"))?;
        anisette.save_all(&mut file)?;
        println!("Saved session to {session_path}");
    }

    Ok(())
}

fn init_fresh(libs_path: Option<&str>, apple_root_pem: Option<PathBuf>) -> Result<Anisette> {
    match libs_path {
        Some(path) => {
            println!("Initializing session from {path}");
            Anisette::init_from_path(path, None, apple_root_pem)
        }
        None => {
            println!("Downloading library bundle");
            Anisette::init_default(None, apple_root_pem)
        }
    }
}
