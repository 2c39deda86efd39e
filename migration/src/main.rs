use std::{env, fs, path::Path, process};
use util::{config, logging};

mod runner;

#[tokio::main]
async fn main() {
    let _log_guard = logging::init_logging("logs", &config::log_file());

    let db_path = config::database_path();
    let url = format!("sqlite://{}?mode=rwc", db_path);
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("clean") => {
            remove_db_file(&db_path);
        }
        Some("fresh") => {
            remove_db_file(&db_path);
            create_db_dir(&db_path);
            apply(&url).await;
        }
        _ => {
            create_db_dir(&db_path);
            apply(&url).await;
        }
    }
}

async fn apply(url: &str) {
    if let Err(e) = runner::apply_schema(url).await {
        eprintln!("Schema setup failed: {e}");
        process::exit(1);
    }
}

fn remove_db_file(path: &str) {
    let db_path = Path::new(path);
    if db_path.exists() {
        fs::remove_file(db_path).expect("Failed to delete DB file");
        tracing::info!("Deleted DB: {}", db_path.display());
        println!("Deleted DB: {}", db_path.display());
    } else {
        println!("DB file does not exist: {}", db_path.display());
    }
}

fn create_db_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).expect("Failed to create DB directory");
    }
}
