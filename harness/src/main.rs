//! In-sandbox harness entrypoint.
//!
//! Reads `test_config.json` and `main.py` from the working directory (the
//! isolate box), runs every case, and prints a single JSON array to stdout.
//! All failures, including unreadable inputs, are reported through that
//! array with exit status 0; the executor classifies them.

use judge_harness::TestConfig;
use judge_harness::run_cases;
use judge_harness::synthetic_error;

fn main() {
    let records = match load_and_run() {
        Ok(records) => records,
        Err(message) => vec![synthetic_error(message)],
    };
    match serde_json::to_string(&records) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("failed to encode harness output: {err}");
            std::process::exit(1);
        }
    }
}

fn load_and_run() -> Result<Vec<judge_protocol::CaseRecord>, String> {
    let config_text = std::fs::read_to_string("test_config.json")
        .map_err(|_| "test_config.json not found".to_string())?;
    let user_code =
        std::fs::read_to_string("main.py").map_err(|_| "main.py not found".to_string())?;
    let config: TestConfig = serde_json::from_str(&config_text)
        .map_err(|err| format!("invalid test_config.json: {err}"))?;
    Ok(run_cases(&config, &user_code))
}
